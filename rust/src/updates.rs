use serde_json::Value;

use crate::backend::records::{MessageRecord, ProfileRecord};
use crate::backend::{ChangeEvent, Identity, SubscriptionHandle};
use crate::error::SyncError;
use crate::state::{AppState, ConversationSummary};
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

/// Results of work spawned by the actor. Everything session-scoped carries the
/// session generation it was started under; conversation traffic carries the
/// id of the synchronizer that asked for it. Stale results are dropped.
#[derive(Debug)]
pub enum InternalEvent {
    // Session
    SessionResolved {
        attempt: u64,
        result: Result<Option<Identity>, String>,
    },
    MyProfileLoaded {
        generation: u64,
        result: Result<Option<ProfileRecord>, SyncError>,
    },

    // Conversation
    ConversationHistoryFetched {
        conversation: u64,
        token: u64,
        result: Result<Vec<MessageRecord>, SyncError>,
    },
    ConversationSubscribed {
        conversation: u64,
        result: Result<SubscriptionHandle, String>,
    },
    ConversationChange {
        conversation: u64,
        event: ChangeEvent,
    },
    MessageSendResult {
        conversation: u64,
        local_id: String,
        result: Result<MessageRecord, SyncError>,
    },

    // Conversation list
    ConversationListFetched {
        token: u64,
        result: Result<Vec<ConversationSummary>, SyncError>,
    },
    ListFeedSubscribed {
        generation: u64,
        result: Result<SubscriptionHandle, String>,
    },
    ListFeedChanged {
        generation: u64,
    },
    ListFeedEnded {
        generation: u64,
        handle: SubscriptionHandle,
    },

    // Home
    HomeFetched {
        token: u64,
        result: Result<Vec<ProfileRecord>, SyncError>,
    },
    LocationSaved {
        generation: u64,
        error: Option<String>,
    },

    // Profile
    ProfileSaved {
        generation: u64,
        result: Result<Vec<Value>, String>,
    },
    AvatarUploaded {
        generation: u64,
        result: Result<String, String>,
    },
}
