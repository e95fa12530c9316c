use std::fmt;

use serde::Serialize;

/// Identity of whoever sent an inbound message (user id, phone JID, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SenderId(pub String);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SenderId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Where replies to a message go. For private chats this equals the sender.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChatId(pub String);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Text extracted from a raw transport event by the owner.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    pub sender_name: Option<String>,
    pub text: String,
}
