use crate::state::Screen;

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Auth
    RestoreSession {
        access_token: String,
    },
    SignOut,

    // Navigation
    PushScreen {
        screen: Screen,
    },
    UpdateScreenStack {
        stack: Vec<Screen>,
    },

    // Conversation
    OpenConversation {
        counterparty_id: String,
    },
    CloseConversation,
    RefreshConversation,
    SendMessage {
        content: String,
    },
    RetryMessage {
        message_id: String,
    },

    // Lists
    RefreshConversationList,
    RefreshHome,
    UpdateLocation {
        latitude: f64,
        longitude: f64,
    },

    // Profile
    UpdateProfile {
        username: Option<String>,
        age: Option<i32>,
        avatar_url: Option<String>,
    },
    UploadAvatar {
        file_name: String,
        bytes: Vec<u8>,
    },

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes access tokens or message content).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::RestoreSession { .. } => "RestoreSession",
            AppAction::SignOut => "SignOut",

            // Navigation
            AppAction::PushScreen { .. } => "PushScreen",
            AppAction::UpdateScreenStack { .. } => "UpdateScreenStack",

            // Conversation
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",
            AppAction::RefreshConversation => "RefreshConversation",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",

            // Lists
            AppAction::RefreshConversationList => "RefreshConversationList",
            AppAction::RefreshHome => "RefreshHome",
            AppAction::UpdateLocation { .. } => "UpdateLocation",

            // Profile
            AppAction::UpdateProfile { .. } => "UpdateProfile",
            AppAction::UploadAvatar { .. } => "UploadAvatar",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
        }
    }
}
