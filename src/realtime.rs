//! WebSocket channel for private conversations.
//!
//! ## Design
//! - At most one socket task at a time; `open` while `Connecting` or
//!   `Connected` does nothing.
//! - The task sends the `connect` envelope first, then multiplexes queued
//!   outgoing messages and incoming frames with `tokio::select!`.
//! - Incoming frames are decoded by their `type` tag. Unknown tags are
//!   skipped, malformed frames are logged and skipped.
//! - The task reports through the coordinator's event queue. `close` revokes
//!   the channel's ticket so anything the old task still reports is dropped.
//! - No automatic reconnect: after a drop the channel stays `Disconnected`
//!   until the next `open`.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::events::{EventSink, SocketEvent, SyncEvent};
use crate::liveness::{Liveness, Ticket};
use crate::model::{Message, MessageKind};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Payload of a `notification` frame. Exactly one of the id fields is
/// expected; `sender_id` wins if both are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user_id: Option<i64>,
}

impl NotificationPayload {
    /// The peer to flag.
    pub fn peer(&self) -> Option<i64> {
        self.sender_id.or(self.other_user_id)
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewMessage(Message),
    Notification(NotificationPayload),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerEvent {
    /// Decode one text frame. `Ok(None)` means a well-formed frame with a tag
    /// this client does not handle.
    pub fn decode(text: &str) -> Result<Option<Self>, ChatError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ChatError::Socket(format!("bad envelope: {e}")))?;

        let event = match envelope.kind.as_str() {
            // `private_message` is the relay spelling used by older servers.
            "new_message" | "private_message" => serde_json::from_value(envelope.data)
                .map(ServerEvent::NewMessage)
                .map_err(|e| ChatError::Socket(format!("bad {} payload: {e}", envelope.kind)))?,
            "notification" => serde_json::from_value(envelope.data)
                .map(ServerEvent::Notification)
                .map_err(|e| ChatError::Socket(format!("bad notification payload: {e}")))?,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// A private message as the client puts it on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub client_ref: String,
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect { user_id: i64 },
    PrivateMessage { data: PrivateMessage },
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Owns the realtime connection's lifecycle.
#[derive(Debug)]
pub struct RealtimeChannel {
    url: String,
    state: ConnectionState,
    liveness: Liveness,
    outgoing: Option<mpsc::UnboundedSender<PrivateMessage>>,
}

impl RealtimeChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: ConnectionState::Disconnected,
            liveness: Liveness::new(),
            outgoing: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True if `ticket` belongs to the current connection attempt.
    pub fn owns(&self, ticket: &Ticket) -> bool {
        self.liveness.owns(ticket)
    }

    /// Start connecting as `user_id`. Returns false, doing nothing, when a
    /// connection is already open or opening.
    pub fn open(&mut self, user_id: i64, sink: EventSink) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.liveness.revoke();
        let ticket = self.liveness.ticket();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);
        self.state = ConnectionState::Connecting;
        debug!(url = %self.url, user_id, generation = ticket.issued(), "opening realtime connection");
        tokio::spawn(run_socket(self.url.clone(), user_id, ticket, sink, rx));
        true
    }

    /// Close the connection. Safe to call in any state.
    pub fn close(&mut self) {
        self.liveness.revoke();
        // Dropping the sender ends the task's outgoing stream; it sends Close and exits.
        self.outgoing = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Queue a private message. Accepted while `Connecting` (it goes out
    /// right after the `connect` envelope) or `Connected`.
    pub fn send(&self, message: PrivateMessage) -> Result<(), ChatError> {
        if self.state == ConnectionState::Disconnected {
            return Err(ChatError::Send("realtime channel is disconnected".into()));
        }
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| ChatError::Send("realtime channel is disconnected".into()))?;
        outgoing
            .send(message)
            .map_err(|_| ChatError::Send("realtime connection already closed".into()))
    }

    /// Track lifecycle events reported by the socket task. Callers must have
    /// checked that the event's ticket is one this channel [`owns`](Self::owns).
    pub fn observe(&mut self, event: &SocketEvent) {
        match event {
            SocketEvent::Connected => self.state = ConnectionState::Connected,
            SocketEvent::Disconnected { .. } => {
                self.state = ConnectionState::Disconnected;
                self.outgoing = None;
            }
            SocketEvent::Frame(_) | SocketEvent::SendFailed { .. } => {}
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(text)).await.map_err(|e| e.to_string())
}

/// Report every queued message as failed. Closes the queue first so nothing
/// new can slip in behind the drain.
fn fail_queued(outgoing: &mut mpsc::UnboundedReceiver<PrivateMessage>, emit: &impl Fn(SocketEvent)) {
    outgoing.close();
    while let Ok(message) = outgoing.try_recv() {
        emit(SocketEvent::SendFailed {
            chat_id: message.chat_id,
            client_ref: message.client_ref,
        });
    }
}

async fn run_socket(
    url: String,
    user_id: i64,
    ticket: Ticket,
    sink: EventSink,
    mut outgoing: mpsc::UnboundedReceiver<PrivateMessage>,
) {
    let emit = |event: SocketEvent| {
        let _ = sink.send(SyncEvent::Socket {
            ticket: ticket.clone(),
            event,
        });
    };

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let err = ChatError::Socket(e.to_string());
            warn!(error = %err, %url, "realtime connect failed");
            fail_queued(&mut outgoing, &emit);
            emit(SocketEvent::Disconnected { reason: err.to_string() });
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws.split();

    if let Err(reason) = send_frame(&mut ws_sink, &ClientFrame::Connect { user_id }).await {
        warn!(error = %reason, %url, "realtime handshake failed");
        fail_queued(&mut outgoing, &emit);
        emit(SocketEvent::Disconnected { reason });
        return;
    }

    info!(user_id, %url, "realtime connected");
    emit(SocketEvent::Connected);

    let reason = loop {
        tokio::select! {
            queued = outgoing.recv() => {
                match queued {
                    Some(message) => {
                        let chat_id = message.chat_id;
                        let client_ref = message.client_ref.clone();
                        if let Err(reason) = send_frame(&mut ws_sink, &ClientFrame::PrivateMessage { data: message }).await {
                            emit(SocketEvent::SendFailed { chat_id, client_ref });
                            break reason;
                        }
                    }
                    None => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        break "closed by client".to_string();
                    }
                }
            }

            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::decode(&text) {
                        Ok(Some(event)) => emit(SocketEvent::Frame(event)),
                        Ok(None) => debug!("ignoring frame with unrecognized tag"),
                        Err(err) => warn!(error = %err, "ignoring malformed frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => {} // Ignore binary / ping / pong frames
                    Some(Err(e)) => break e.to_string(),
                }
            }
        }
    };

    fail_queued(&mut outgoing, &emit);
    info!(user_id, %reason, "realtime disconnected");
    emit(SocketEvent::Disconnected { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::net::TcpListener;

    // -- decoding -------------------------------------------------------------

    #[test]
    fn decode_new_message() {
        let text = r#"{"type":"new_message","data":{"id":101,"chat_id":7,"content":"hi","sender_id":1}}"#;
        match ServerEvent::decode(text).unwrap() {
            Some(ServerEvent::NewMessage(m)) => {
                assert_eq!(m.id, Some(101));
                assert_eq!(m.chat_id, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case(r#"{"type":"notification","data":{"chat_id":9,"other_user_id":5}}"#, 9, 5)]
    #[case(r#"{"type":"notification","data":{"chat_id":3,"sender_id":8}}"#, 3, 8)]
    fn decode_notification_peer(#[case] text: &str, #[case] chat: i64, #[case] peer: i64) {
        match ServerEvent::decode(text).unwrap() {
            Some(ServerEvent::Notification(n)) => {
                assert_eq!(n.chat_id, chat);
                assert_eq!(n.peer(), Some(peer));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case(r#"{"type":"typing","data":{"chat_id":1}}"#)]
    #[case(r#"{"type":"pong"}"#)]
    fn unknown_tags_are_ignored(#[case] text: &str) {
        assert!(ServerEvent::decode(text).unwrap().is_none());
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"data":{}}"#)]
    #[case(r#"{"type":"new_message","data":{"id":1}}"#)]
    #[case(r#"{"type":"notification","data":{"sender_id":1}}"#)]
    fn malformed_frames_are_errors(#[case] text: &str) {
        assert!(matches!(ServerEvent::decode(text), Err(ChatError::Socket(_))));
    }

    #[test]
    fn legacy_private_message_tag_decodes_as_new_message() {
        let text = r#"{"type":"private_message","data":{"chat_id":2,"content":"yo","sender_id":4}}"#;
        assert!(matches!(ServerEvent::decode(text).unwrap(), Some(ServerEvent::NewMessage(_))));
    }

    #[test]
    fn connect_frame_shape() {
        let v = serde_json::to_value(ClientFrame::Connect { user_id: 12 }).unwrap();
        assert_eq!(v, serde_json::json!({"type": "connect", "user_id": 12}));
    }

    #[test]
    fn private_message_frame_shape() {
        let frame = ClientFrame::PrivateMessage {
            data: PrivateMessage {
                chat_id: 7,
                sender_id: 1,
                username: "a".into(),
                content: "hi".into(),
                kind: MessageKind::UserMessage,
                client_ref: "r1".into(),
            },
        };
        let v = serde_json::to_value(frame).unwrap();
        assert_eq!(v["type"], "private_message");
        assert_eq!(v["data"]["chat_id"], 7);
        assert_eq!(v["data"]["type"], "user_message");
        assert_eq!(v["data"]["client_ref"], "r1");
    }

    // -- live connection against a loopback server ----------------------------

    /// Accepts one connection, forwards every text frame it receives to the
    /// returned receiver and sends every string pushed to the returned sender.
    async fn loopback_server() -> (String, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/chats/ws", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel::<String>();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => { let _ = seen_tx.send(text); }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    push = push_rx.recv() => match push {
                        Some(text) if text == "CLOSE" => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                        Some(text) => { let _ = sink.send(WsMessage::Text(text)).await; }
                        None => break,
                    },
                }
            }
        });

        (url, seen_rx, push_tx)
    }

    async fn next_socket_event(rx: &mut EventStream) -> (Ticket, SocketEvent) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for socket event")
            .expect("event queue closed");
        match event {
            SyncEvent::Socket { ticket, event } => (ticket, event),
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn next_seen(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("server gone");
        serde_json::from_str(&text).unwrap()
    }

    fn private(chat_id: i64, client_ref: &str) -> PrivateMessage {
        PrivateMessage {
            chat_id,
            sender_id: 1,
            username: "a".into(),
            content: "hi".into(),
            kind: MessageKind::UserMessage,
            client_ref: client_ref.into(),
        }
    }

    #[tokio::test]
    async fn open_sends_connect_envelope_then_reports_connected() {
        let (url, mut seen, _push) = loopback_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);

        assert!(channel.open(1, tx.clone()));
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert!(!channel.open(1, tx), "second open while connecting is a no-op");

        let (ticket, event) = next_socket_event(&mut rx).await;
        assert!(channel.owns(&ticket));
        assert!(matches!(event, SocketEvent::Connected));
        channel.observe(&event);
        assert_eq!(channel.state(), ConnectionState::Connected);

        assert_eq!(next_seen(&mut seen).await, serde_json::json!({"type": "connect", "user_id": 1}));
        channel.close();
    }

    #[tokio::test]
    async fn send_while_connecting_goes_out_after_connect() {
        let (url, mut seen, _push) = loopback_server().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);
        channel.open(1, tx);
        channel.send(private(7, "r1")).unwrap();

        assert_eq!(next_seen(&mut seen).await["type"], "connect");
        let frame = next_seen(&mut seen).await;
        assert_eq!(frame["type"], "private_message");
        assert_eq!(frame["data"]["client_ref"], "r1");
        channel.close();
    }

    #[tokio::test]
    async fn incoming_frames_are_decoded_and_junk_skipped() {
        let (url, _seen, push) = loopback_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);
        channel.open(1, tx);
        let (_, connected) = next_socket_event(&mut rx).await;
        channel.observe(&connected);

        push.send(r#"{"type":"typing","data":{}}"#.into()).unwrap();
        push.send("garbage".into()).unwrap();
        push.send(r#"{"type":"new_message","data":{"id":101,"chat_id":7,"content":"hi","sender_id":2}}"#.into())
            .unwrap();
        push.send(r#"{"type":"notification","data":{"chat_id":9,"other_user_id":5}}"#.into())
            .unwrap();

        let (_, first) = next_socket_event(&mut rx).await;
        assert!(matches!(first, SocketEvent::Frame(ServerEvent::NewMessage(ref m)) if m.id == Some(101)));
        let (_, second) = next_socket_event(&mut rx).await;
        assert!(matches!(second, SocketEvent::Frame(ServerEvent::Notification(ref n)) if n.peer() == Some(5)));
        channel.close();
    }

    #[tokio::test]
    async fn server_close_reports_disconnected() {
        let (url, _seen, push) = loopback_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);
        channel.open(1, tx);
        let (_, connected) = next_socket_event(&mut rx).await;
        channel.observe(&connected);

        push.send("CLOSE".into()).unwrap();
        let (ticket, event) = next_socket_event(&mut rx).await;
        assert!(channel.owns(&ticket));
        assert!(matches!(event, SocketEvent::Disconnected { .. }));
        channel.observe(&event);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.send(private(7, "late")), Err(ChatError::Send(_))));
    }

    #[tokio::test]
    async fn failed_connect_fails_queued_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/chats/ws", listener.local_addr().unwrap());
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);
        channel.open(1, tx);
        channel.send(private(7, "queued")).unwrap();

        let (_, first) = next_socket_event(&mut rx).await;
        match first {
            SocketEvent::SendFailed { chat_id, client_ref } => {
                assert_eq!(chat_id, 7);
                assert_eq!(client_ref, "queued");
            }
            other => panic!("unexpected {other:?}"),
        }
        let (_, second) = next_socket_event(&mut rx).await;
        assert!(matches!(second, SocketEvent::Disconnected { .. }));
        channel.observe(&second);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn send_while_disconnected_is_an_error() {
        let channel = RealtimeChannel::new("ws://127.0.0.1:1/chats/ws");
        assert!(matches!(channel.send(private(1, "x")), Err(ChatError::Send(_))));
    }

    #[tokio::test]
    async fn close_makes_old_tickets_stale() {
        let (url, _seen, _push) = loopback_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = RealtimeChannel::new(url);
        channel.open(1, tx);
        let (ticket, _) = next_socket_event(&mut rx).await;
        channel.close();
        channel.close();
        assert!(!channel.owns(&ticket));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
