//! Canonical inbound activity.
//!
//! Channel adapters translate platform requests into an [`Activity`]. The
//! engine only reads the addressing fields (for storage keys) and the type
//! (for access-pattern learning); everything else is carried for bot logic.

use serde::{Deserialize, Serialize};

/// Well-known activity types.
pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const CONVERSATION_UPDATE: &str = "conversationUpdate";
    pub const EVENT: &str = "event";
    pub const END_OF_CONVERSATION: &str = "endOfConversation";
}

/// An account on a channel (the bot or a user).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// The conversation an activity belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAccount {
    pub id: String,
}

/// One inbound request, normalized across channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Activity type, e.g. [`activity_types::MESSAGE`].
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub channel_id: String,
    /// The bot receiving the activity.
    pub recipient: ChannelAccount,
    /// The user sending the activity.
    pub from: ChannelAccount,
    pub conversation: ConversationAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Activity {
    /// Build an activity addressed from `from_id` to `recipient_id`.
    pub fn new(
        activity_type: impl Into<String>,
        channel_id: impl Into<String>,
        recipient_id: impl Into<String>,
        from_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            activity_type: activity_type.into(),
            id: None,
            channel_id: channel_id.into(),
            recipient: ChannelAccount::new(recipient_id),
            from: ChannelAccount::new(from_id),
            conversation: ConversationAccount {
                id: conversation_id.into(),
            },
            text: None,
        }
    }

    /// Shorthand for a `message` activity carrying `text`.
    pub fn message(
        channel_id: impl Into<String>,
        recipient_id: impl Into<String>,
        from_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            activity_types::MESSAGE,
            channel_id,
            recipient_id,
            from_id,
            conversation_id,
        )
        .with_text(text)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
