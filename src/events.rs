//! Events flowing from the channels into the coordinator.
//!
//! Channels never touch the stores. They push [`SyncEvent`]s onto an
//! unbounded queue, each stamped with the [`Ticket`] it was produced under,
//! and the coordinator applies them one at a time.

use tokio::sync::mpsc;

use crate::liveness::Ticket;
use crate::model::{ConversationId, Message, User};
use crate::realtime::{ConnectionState, ServerEvent};

pub type EventSink = mpsc::UnboundedSender<SyncEvent>;
pub type EventStream = mpsc::UnboundedReceiver<SyncEvent>;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// One successful global-room poll, in server order.
    GlobalMessages { ticket: Ticket, messages: Vec<Message> },
    /// One successful roster poll.
    Roster { ticket: Ticket, users: Vec<User> },
    /// Something happened on the realtime connection.
    Socket { ticket: Ticket, event: SocketEvent },
}

impl SyncEvent {
    pub fn ticket(&self) -> &Ticket {
        match self {
            SyncEvent::GlobalMessages { ticket, .. }
            | SyncEvent::Roster { ticket, .. }
            | SyncEvent::Socket { ticket, .. } => ticket,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The handshake finished and the `connect` envelope went out.
    Connected,
    /// The connection closed, failed to open, or errored.
    Disconnected { reason: String },
    /// A decoded server frame.
    Frame(ServerEvent),
    /// A queued private message never made it onto the wire.
    SendFailed { chat_id: i64, client_ref: String },
}

/// What changed after the coordinator applied an event. Lets a front end
/// redraw only what it has to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Timeline(ConversationId),
    Roster,
    Unread(i64),
    Connection(ConnectionState),
}
