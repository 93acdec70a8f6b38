//! Frame scopes and storage key layout.
//!
//! A scope decides which parts of the activity address a frame's record:
//!
//! | scope                | key                                              |
//! |----------------------|--------------------------------------------------|
//! | `user`               | `{ns}/{recipient}/{channel}/{from}`              |
//! | `conversation`       | `{ns}/{recipient}/{channel}/{conversation}`      |
//! | `conversationMember` | `{ns}/{recipient}/{channel}/{conversation}/{from}` |
//!
//! `ns` is the frame's namespace, which defaults to the scope name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::activity::Activity;
use crate::error::EngineError;

/// Persistence scope of a root frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameScope {
    /// Per user, shared across conversations on a channel.
    User,
    /// Shared by every participant of a conversation.
    Conversation,
    /// Per user within one conversation.
    ConversationMember,
}

impl FrameScope {
    pub const ALL: [FrameScope; 3] = [
        FrameScope::User,
        FrameScope::Conversation,
        FrameScope::ConversationMember,
    ];

    /// Wire name of the scope; also the default namespace.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Conversation => "conversation",
            Self::ConversationMember => "conversationMember",
        }
    }

    /// Storage key for a record in `namespace` addressed by `activity`.
    pub fn storage_key(self, namespace: &str, activity: &Activity) -> String {
        let base = format!(
            "{namespace}/{}/{}",
            activity.recipient.id, activity.channel_id
        );
        match self {
            Self::User => format!("{base}/{}", activity.from.id),
            Self::Conversation => format!("{base}/{}", activity.conversation.id),
            Self::ConversationMember => {
                format!("{base}/{}/{}", activity.conversation.id, activity.from.id)
            }
        }
    }
}

impl fmt::Display for FrameScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameScope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| EngineError::UnknownScope {
                scope: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(from: &str) -> Activity {
        Activity::message("cli", "bot", from, "c1", "hi")
    }

    #[test]
    fn key_layouts() {
        let a = activity("alice");
        assert_eq!(FrameScope::User.storage_key("user", &a), "user/bot/cli/alice");
        assert_eq!(
            FrameScope::Conversation.storage_key("conversation", &a),
            "conversation/bot/cli/c1"
        );
        assert_eq!(
            FrameScope::ConversationMember.storage_key("members", &a),
            "members/bot/cli/c1/alice"
        );
    }

    #[test]
    fn user_keys_differ_per_sender() {
        let alice = FrameScope::User.storage_key("user", &activity("alice"));
        let bob = FrameScope::User.storage_key("user", &activity("bob"));
        assert_ne!(alice, bob);
    }

    #[test]
    fn parse_round_trips_and_rejects_unknown() {
        for scope in FrameScope::ALL {
            assert_eq!(scope.as_str().parse::<FrameScope>().unwrap(), scope);
        }
        let err = "channel".parse::<FrameScope>().unwrap_err();
        assert!(matches!(err, EngineError::UnknownScope { scope } if scope == "channel"));
    }
}
