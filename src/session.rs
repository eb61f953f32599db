//! Session coordinator: identity, channel lifecycle and the unified view.
//!
//! The coordinator is the only writer of the conversation store and the
//! notification tracker. Channels feed it [`SyncEvent`]s, and the
//! presentation layer calls its actions and reads its derived state. All
//! methods take `&mut self`, so calls are serialized by the borrow checker,
//! and events queued during an action are applied afterwards in arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, SendRequest};
use crate::config::ClientConfig;
use crate::error::ChatError;
use crate::events::{EventSink, EventStream, SocketEvent, SyncEvent, Update};
use crate::model::{ConversationId, Message, MessageKind, PrivateChat, Session, User};
use crate::notifications::NotificationTracker;
use crate::polling::{PollResource, PollingChannel};
use crate::realtime::{ConnectionState, PrivateMessage, RealtimeChannel, ServerEvent};
use crate::store::ConversationStore;

/// The private conversation currently on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChat {
    pub chat: PrivateChat,
    pub peer: User,
}

pub struct SessionCoordinator<A: ChatApi> {
    api: Arc<A>,
    config: ClientConfig,
    sink: EventSink,
    session: Option<Session>,
    store: ConversationStore,
    unread: NotificationTracker,
    roster: Vec<User>,
    chats: HashMap<i64, PrivateChat>,
    /// Private chats whose history has been fetched.
    seeded: HashSet<i64>,
    active: Option<ActiveChat>,
    polling: PollingChannel,
    realtime: RealtimeChannel,
    shut_down: bool,
}

impl<A: ChatApi> SessionCoordinator<A> {
    /// Build a coordinator and the event stream its channels report on.
    /// Feed every event from the stream back through [`apply`](Self::apply).
    pub fn new(api: A, config: ClientConfig) -> (Self, EventStream) {
        if let Err(e) = config.validate() {
            warn!(error = %e, "continuing with invalid client config");
        }
        let (sink, events) = mpsc::unbounded_channel();
        let realtime = RealtimeChannel::new(config.websocket_url());
        let coordinator = Self {
            api: Arc::new(api),
            config,
            sink,
            session: None,
            store: ConversationStore::new(),
            unread: NotificationTracker::new(),
            roster: Vec::new(),
            chats: HashMap::new(),
            seeded: HashSet::new(),
            active: None,
            polling: PollingChannel::new(),
            realtime,
            shut_down: false,
        };
        (coordinator, events)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Acquire an identity and start the channels.
    ///
    /// One-shot: once a session exists this returns it without touching the
    /// network. On failure nothing is latched and the caller may retry.
    pub async fn join(&mut self) -> Result<Session, ChatError> {
        if let Some(session) = &self.session {
            debug!(user_id = session.user.id, "join called again, keeping existing session");
            return Ok(session.clone());
        }

        let username = self.api.generate_username().await.map_err(ChatError::Identity)?;
        let user = self.api.join(&username).await.map_err(ChatError::Identity)?;
        info!(user_id = user.id, username = %user.username, "joined");

        let session = Session { user };
        self.session = Some(session.clone());

        self.hydrate_unread(session.user.id).await;
        self.start_polling(PollResource::Messages);
        self.start_polling(PollResource::Roster);
        if self.config.connect_on_join {
            self.realtime.open(session.user.id, self.sink.clone());
        }

        Ok(session)
    }

    /// Open (creating if needed) the private conversation with `peer` and
    /// make it the active view.
    pub async fn open_conversation(&mut self, peer: &User) -> Result<ConversationId, ChatError> {
        let me = self.require_user()?.clone();
        self.realtime.open(me.id, self.sink.clone());

        let cached = self.chats.values().find(|c| c.involves(me.id, peer.id)).cloned();
        let chat = match cached {
            Some(chat) => chat,
            None => {
                let chat = self
                    .api
                    .get_or_create_chat(me.id, peer.id)
                    .await
                    .map_err(ChatError::Fetch)?;
                self.chats.insert(chat.id, chat.clone());
                chat
            }
        };
        let conversation = ConversationId::Private(chat.id);

        // Live frames may already have created the timeline; history is still owed.
        if !self.seeded.contains(&chat.id) {
            match self.api.chat_messages(chat.id).await {
                Ok(history) => {
                    self.store.seed(conversation, history);
                    self.seeded.insert(chat.id);
                }
                Err(e) => warn!(error = %ChatError::Fetch(e), chat_id = chat.id, "history fetch failed, will retry on next open"),
            }
        }

        self.unread.clear_unread(peer.id);
        if let Err(e) = self.api.mark_read(me.id, chat.id).await {
            warn!(error = %ChatError::Fetch(e), chat_id = chat.id, "mark-read failed");
        }

        self.unread.set_active_peer(Some(peer.id));
        self.active = Some(ActiveChat { chat, peer: peer.clone() });
        self.polling.stop(PollResource::Messages);
        debug!(%conversation, peer_id = peer.id, "conversation opened");

        Ok(conversation)
    }

    /// Return to the global room and resume polling it.
    pub fn close_conversation(&mut self) {
        if self.active.take().is_none() {
            return;
        }
        self.unread.set_active_peer(None);
        self.start_polling(PollResource::Messages);
    }

    /// Send `text` to the active conversation.
    ///
    /// Blank text is ignored (`Ok(None)`). Otherwise the message appears in
    /// the timeline immediately and its correlation token is returned; a
    /// failed delivery leaves it marked failed rather than returning an error.
    pub async fn send(&mut self, text: &str) -> Result<Option<String>, ChatError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let me = self.require_user()?.clone();
        let conversation = self.active_conversation();

        let message = Message::compose(conversation, &me, text);
        let client_ref = self.store.send_optimistic(conversation, message.clone());
        let message = Message { client_ref: Some(client_ref.clone()), ..message };

        self.deliver(conversation, &me, message).await;
        Ok(Some(client_ref))
    }

    /// Re-send a failed message. Returns false if `client_ref` does not name
    /// a failed entry in `conversation`.
    pub async fn retry(&mut self, conversation: ConversationId, client_ref: &str) -> Result<bool, ChatError> {
        let me = self.require_user()?.clone();
        let Some(message) = self.store.mark_pending(conversation, client_ref) else {
            return Ok(false);
        };
        if conversation != ConversationId::Global {
            self.realtime.open(me.id, self.sink.clone());
        }
        self.deliver(conversation, &me, message).await;
        Ok(true)
    }

    /// Stop every channel. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.polling.stop_all();
        self.realtime.close();
    }

    // -----------------------------------------------------------------------
    // Event application
    // -----------------------------------------------------------------------

    /// Apply one channel event. Events from superseded socket or roster
    /// runs, and everything after [`shutdown`](Self::shutdown), return `None`.
    ///
    /// A global poll result that was already queued when its loop paused is
    /// still applied: the server has advanced its cursor past those rows.
    pub fn apply(&mut self, event: SyncEvent) -> Option<Update> {
        if self.shut_down {
            return None;
        }
        match event {
            SyncEvent::GlobalMessages { ticket, messages } => {
                if !self.polling.issued(PollResource::Messages, &ticket) {
                    debug!("dropping foreign global poll result");
                    return None;
                }
                self.store.extend(ConversationId::Global, messages);
                Some(Update::Timeline(ConversationId::Global))
            }
            SyncEvent::Roster { ticket, users } => {
                if !self.polling.owns(PollResource::Roster, &ticket) {
                    return None;
                }
                let self_id = self.session.as_ref().map(|s| s.user.id);
                self.roster = users.into_iter().filter(|u| Some(u.id) != self_id).collect();
                Some(Update::Roster)
            }
            SyncEvent::Socket { ticket, event } => {
                if !self.realtime.owns(&ticket) {
                    debug!("dropping event from a closed socket");
                    return None;
                }
                self.apply_socket(event)
            }
        }
    }

    fn apply_socket(&mut self, event: SocketEvent) -> Option<Update> {
        self.realtime.observe(&event);
        match event {
            SocketEvent::Connected | SocketEvent::Disconnected { .. } => {
                Some(Update::Connection(self.realtime.state()))
            }
            SocketEvent::SendFailed { chat_id, client_ref } => {
                let conversation = ConversationId::Private(chat_id);
                warn!(error = %ChatError::Send("socket closed before the frame went out".into()), chat_id, "private send failed");
                self.store
                    .mark_failed(conversation, &client_ref)
                    .then_some(Update::Timeline(conversation))
            }
            SocketEvent::Frame(ServerEvent::NewMessage(message)) => {
                let conversation = message.conversation();
                let sender = message.sender_id;
                self.store.append(conversation, message);

                let self_id = self.session.as_ref().map(|s| s.user.id);
                let background = conversation != ConversationId::Global && conversation != self.active_conversation();
                if let Some(peer) = sender.filter(|id| background && Some(*id) != self_id) {
                    self.unread.set_unread(peer);
                }
                Some(Update::Timeline(conversation))
            }
            SocketEvent::Frame(ServerEvent::Notification(note)) => {
                if ConversationId::Private(note.chat_id) == self.active_conversation() {
                    return None;
                }
                let peer = note.peer()?;
                self.unread.set_unread(peer).then_some(Update::Unread(peer))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived state
    // -----------------------------------------------------------------------

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn active_chat(&self) -> Option<&ActiveChat> {
        self.active.as_ref()
    }

    pub fn active_conversation(&self) -> ConversationId {
        self.active
            .as_ref()
            .map_or(ConversationId::Global, |a| ConversationId::Private(a.chat.id))
    }

    /// Messages of the conversation on screen.
    pub fn current_messages(&self) -> &[Message] {
        self.store.timeline(self.active_conversation())
    }

    pub fn timeline(&self, conversation: ConversationId) -> &[Message] {
        self.store.timeline(conversation)
    }

    /// Roster from the last successful poll, without the local user.
    pub fn users(&self) -> &[User] {
        &self.roster
    }

    pub fn is_unread(&self, peer_id: i64) -> bool {
        self.unread.is_unread(peer_id)
    }

    pub fn unread_peers(&self) -> Vec<i64> {
        self.unread.unread_peers()
    }

    pub fn failed(&self, conversation: ConversationId) -> Vec<String> {
        self.store.failed(conversation)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.realtime.state()
    }

    pub fn is_polling(&self, resource: PollResource) -> bool {
        self.polling.is_running(resource)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn require_user(&self) -> Result<&User, ChatError> {
        self.session.as_ref().map(|s| &s.user).ok_or(ChatError::NotJoined)
    }

    fn start_polling(&mut self, resource: PollResource) {
        let Some(session) = &self.session else {
            return;
        };
        let window = match resource {
            PollResource::Messages => self.config.message_poll,
            PollResource::Roster => self.config.roster_poll,
        };
        self.polling
            .start(resource, Arc::clone(&self.api), session.user.id, window, self.sink.clone());
    }

    async fn hydrate_unread(&mut self, user_id: i64) {
        match self.api.unread_flags(user_id).await {
            Ok(flags) => {
                debug!(count = flags.len(), "hydrated unread flags");
                self.unread.hydrate(&flags);
            }
            Err(e) => warn!(error = %ChatError::Fetch(e), "unread hydration failed"),
        }
    }

    /// Push an optimistic `message` to the server through the route its
    /// conversation uses, marking it failed if that does not work.
    async fn deliver(&mut self, conversation: ConversationId, me: &User, message: Message) {
        let client_ref = message.client_ref.clone().unwrap_or_default();

        match conversation {
            ConversationId::Global => {
                let request = SendRequest {
                    content: message.content,
                    username: me.username.clone(),
                    kind: MessageKind::UserMessage,
                    user_id: me.id,
                    client_ref: Some(client_ref.clone()),
                };
                match self.api.send_message(&request).await {
                    Ok(mut confirmed) => {
                        confirmed.client_ref = Some(client_ref);
                        self.store.append(conversation, confirmed);
                    }
                    Err(e) => {
                        warn!(error = %ChatError::Send(e.to_string()), "global send failed");
                        self.store.mark_failed(conversation, &client_ref);
                    }
                }
            }
            ConversationId::Private(chat_id) => {
                let frame = PrivateMessage {
                    chat_id,
                    sender_id: me.id,
                    username: me.username.clone(),
                    content: message.content,
                    kind: MessageKind::UserMessage,
                    client_ref: client_ref.clone(),
                };
                if let Err(err) = self.realtime.send(frame) {
                    warn!(error = %err, chat_id, "private send failed");
                    self.store.mark_failed(conversation, &client_ref);
                }
            }
        }
    }
}

impl<A: ChatApi> Drop for SessionCoordinator<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
