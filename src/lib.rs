//! Client-side synchronization core for a realtime chat service.
//!
//! A [`SessionCoordinator`] joins under a server-generated name, polls the
//! global room and the roster over HTTP, and carries private conversations
//! over a WebSocket. Every channel reports into one event queue; the
//! coordinator applies those events to a [`ConversationStore`] and a
//! [`NotificationTracker`], and a front end renders whatever they hold.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod liveness;
pub mod model;
pub mod notifications;
pub mod polling;
pub mod realtime;
pub mod session;
pub mod store;

pub use api::{ChatApi, HttpApi, SendRequest};
pub use config::{ClientConfig, PollWindow};
pub use error::{ApiError, ChatError};
pub use events::{EventStream, SocketEvent, SyncEvent, Update};
pub use model::{ConversationId, Delivery, Message, MessageKind, PrivateChat, Session, User};
pub use notifications::NotificationTracker;
pub use polling::{PollResource, PollingChannel};
pub use realtime::{ConnectionState, RealtimeChannel, ServerEvent};
pub use session::{ActiveChat, SessionCoordinator};
pub use store::{AppendOutcome, ConversationStore};
