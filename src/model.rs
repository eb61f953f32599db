//! Wire and domain types shared by every component.
//!
//! Shapes mirror what the chat server emits. Decoding is lenient: apart from
//! `content`, every message field is optional, because global-room system
//! messages carry no sender and optimistic messages carry no id.

use serde::{Deserialize, Serialize};

/// Identifies one message timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationId {
    /// The shared room every joined user sees by default.
    Global,
    /// A two-party chat, keyed by the server-issued chat id.
    Private(i64),
}

impl ConversationId {
    /// Map a wire `chat_id` onto a conversation. `None` is the global room.
    pub fn from_chat_id(chat_id: Option<i64>) -> Self {
        match chat_id {
            Some(id) => ConversationId::Private(id),
            None => ConversationId::Global,
        }
    }

    /// The wire `chat_id` for this conversation.
    pub fn chat_id(&self) -> Option<i64> {
        match self {
            ConversationId::Global => None,
            ConversationId::Private(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationId::Global => write!(f, "global"),
            ConversationId::Private(id) => write!(f, "chat#{id}"),
        }
    }
}

/// A user as reported by the roster endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub joined_recently: bool,
}

/// Message type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    UserMessage,
    System,
}

/// Client-side delivery state of a timeline entry. Never serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Shown locally, waiting for the server to confirm it.
    Pending,
    /// Confirmed by (or received from) the server.
    #[default]
    Delivered,
    /// The send failed; the entry stays in the timeline and can be retried.
    Failed,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id. Absent for optimistic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// `None` for the global room.
    #[serde(default)]
    pub chat_id: Option<i64>,
    /// Global-room payloads spell this `user_id`.
    #[serde(default, alias = "user_id")]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Correlation token of the optimistic send that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    /// A locally composed user message with no id yet.
    pub fn compose(conversation: ConversationId, sender: &User, content: impl Into<String>) -> Self {
        Message {
            id: None,
            chat_id: conversation.chat_id(),
            sender_id: Some(sender.id),
            username: Some(sender.username.clone()),
            content: content.into(),
            kind: MessageKind::UserMessage,
            created_at: None,
            client_ref: None,
            delivery: Delivery::Pending,
        }
    }

    /// Which timeline this message belongs to.
    pub fn conversation(&self) -> ConversationId {
        ConversationId::from_chat_id(self.chat_id)
    }

    /// True for locally created entries the server has not acknowledged.
    pub fn is_optimistic(&self) -> bool {
        self.id.is_none() && self.delivery != Delivery::Delivered
    }
}

/// Metadata for a private conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateChat {
    pub id: i64,
    pub user1_id: i64,
    pub user2_id: i64,
    #[serde(default)]
    pub user1: Option<User>,
    #[serde(default)]
    pub user2: Option<User>,
}

impl PrivateChat {
    /// True when this chat is between `a` and `b`, in either order.
    pub fn involves(&self, a: i64, b: i64) -> bool {
        (self.user1_id == a && self.user2_id == b) || (self.user1_id == b && self.user2_id == a)
    }

    /// The other participant's id, seen from `self_id`.
    pub fn peer_of(&self, self_id: i64) -> i64 {
        if self.user1_id == self_id {
            self.user2_id
        } else {
            self.user1_id
        }
    }
}

/// The local user's identity, fixed for the lifetime of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: User,
}
