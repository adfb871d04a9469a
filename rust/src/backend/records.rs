// Typed rows for the `messages` and `profiles` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MESSAGES_TABLE: &str = "messages";
pub const PROFILES_TABLE: &str = "profiles";
pub const AVATARS_BUCKET: &str = "avatars";

/// Denormalized display fields some queries join onto a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRef {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ProfileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ProfileRef>,
}

impl MessageRecord {
    /// The other party of this message, relative to `me`.
    pub fn counterparty_of(&self, me: &str) -> &str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Display fields for the counterparty, if the row carries them.
    pub fn counterparty_ref(&self, me: &str) -> Option<&ProfileRef> {
        if self.sender_id == me {
            self.receiver.as_ref()
        } else {
            self.sender.as_ref()
        }
    }
}

/// Fields written by a message insert; `id` and `created_at` are server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub profile_gif: Option<String>,
    #[serde(default)]
    pub age: Option<i32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub is_fake: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}
