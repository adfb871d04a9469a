use crate::geo::Coordinates;

#[derive(uniffi::Record, Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub router: Router,
    pub auth: AuthState,
    pub my_profile: MyProfileState,
    pub busy: BusyState,
    pub conversation_list: Vec<ConversationSummary>,
    pub current_conversation: Option<ConversationViewState>,
    pub home: HomeFeedState,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            router: Router {
                default_screen: Screen::Auth,
                screen_stack: vec![],
            },
            auth: AuthState::LoggedOut,
            my_profile: MyProfileState::empty(),
            busy: BusyState::idle(),
            conversation_list: vec![],
            current_conversation: None,
            home: HomeFeedState::empty(),
            toast: None,
        }
    }
}

/// "In flight" flags for long-ish operations that the UI should reflect.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct BusyState {
    pub restoring_session: bool,
    pub loading_conversations: bool,
    pub loading_home: bool,
    pub saving_profile: bool,
    pub uploading_avatar: bool,
}

impl BusyState {
    pub fn idle() -> Self {
        Self {
            restoring_session: false,
            loading_conversations: false,
            loading_home: false,
            saving_profile: false,
            uploading_avatar: false,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct Router {
    pub default_screen: Screen,
    pub screen_stack: Vec<Screen>,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq)]
pub enum Screen {
    Auth,
    Home,
    ConversationList,
    Conversation { counterparty_id: String },
    Register,
    Profile,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn {
        user_id: String,
        email: Option<String>,
    },
}

impl AuthState {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            AuthState::LoggedIn { user_id, .. } => Some(user_id),
            AuthState::LoggedOut => None,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct MyProfileState {
    pub username: Option<String>,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
    /// Uploaded but not yet saved with `UpdateProfile`.
    pub draft_avatar_url: Option<String>,
    pub location: Option<Coordinates>,
}

impl MyProfileState {
    pub fn empty() -> Self {
        Self {
            username: None,
            age: None,
            avatar_url: None,
            draft_avatar_url: None,
            location: None,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub counterparty_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_message: String,
    /// Unix millis.
    pub last_message_at: i64,
    pub last_message_is_mine: bool,
    pub time_label: String,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct ConversationViewState {
    pub counterparty_id: String,
    pub counterparty_name: String,
    pub counterparty_avatar_url: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Both live feeds are attached. `false` means history only.
    pub is_live: bool,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Unix millis.
    pub created_at: i64,
    pub is_mine: bool,
    pub delivery: MessageDeliveryState,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct NearbyUser {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub profile_gif: Option<String>,
    pub age: Option<i32>,
    pub online: bool,
    pub is_fake: bool,
    pub distance_km: Option<f64>,
    pub distance_label: String,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct HomeFeedState {
    pub fresh_faces: Vec<NearbyUser>,
    pub nearby: Vec<NearbyUser>,
    pub is_loading: bool,
}

impl HomeFeedState {
    pub fn empty() -> Self {
        Self {
            fresh_faces: vec![],
            nearby: vec![],
            is_loading: false,
        }
    }

    pub fn total_users(&self) -> u32 {
        (self.fresh_faces.len() + self.nearby.len()) as u32
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_starts_logged_out_on_auth() {
        let s = AppState::empty();
        assert_eq!(s.rev, 0);
        assert_eq!(s.router.default_screen, Screen::Auth);
        assert_eq!(s.auth.user_id(), None);
        assert_eq!(s.busy, BusyState::idle());
        assert_eq!(s.home.total_users(), 0);
    }

    #[test]
    fn logged_in_exposes_user_id() {
        let auth = AuthState::LoggedIn {
            user_id: "u1".into(),
            email: None,
        };
        assert_eq!(auth.user_id(), Some("u1"));
    }
}
