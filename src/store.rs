//! Per-conversation message timelines.
//!
//! Timelines are append-only in arrival order. The only in-place edit is
//! reconciliation: an incoming copy of a message that is already present
//! (same server id, or the server echo of an optimistic send) replaces the
//! existing entry at its existing position instead of being appended.

use std::collections::HashMap;

use crate::model::{ConversationId, Delivery, Message};

/// What [`ConversationStore::append`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Pushed to the end of the timeline.
    Appended,
    /// An entry with the same server id existed and was replaced.
    Replaced,
    /// An optimistic entry was matched and replaced by the server copy.
    Reconciled,
}

/// Owns every conversation timeline.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    timelines: HashMap<ConversationId, Vec<Message>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// A store holding only the (empty) global timeline.
    pub fn new() -> Self {
        let mut timelines = HashMap::new();
        timelines.insert(ConversationId::Global, Vec::new());
        Self { timelines }
    }

    /// True once a timeline exists for `id` (created by seeding or the first append).
    pub fn has_timeline(&self, id: ConversationId) -> bool {
        self.timelines.contains_key(&id)
    }

    /// Create an empty timeline for `id` if there is none.
    pub fn ensure(&mut self, id: ConversationId) {
        self.timelines.entry(id).or_default();
    }

    /// Insert `message` into `id`'s timeline, reconciling duplicates.
    ///
    /// Matching, first hit wins:
    /// 1. an entry with the same server `id`;
    /// 2. an optimistic entry with the same `client_ref`;
    /// 3. when the incoming message has an id but no `client_ref`, the oldest
    ///    optimistic entry from the same sender with identical content.
    pub fn append(&mut self, id: ConversationId, message: Message) -> AppendOutcome {
        let timeline = self.timelines.entry(id).or_default();

        if let Some(server_id) = message.id {
            if let Some(slot) = timeline.iter_mut().find(|m| m.id == Some(server_id)) {
                *slot = carry_ref(slot, message);
                return AppendOutcome::Replaced;
            }
        }

        if let Some(pos) = find_optimistic(timeline, &message) {
            timeline[pos] = carry_ref(&timeline[pos], message);
            return AppendOutcome::Reconciled;
        }

        timeline.push(message);
        AppendOutcome::Appended
    }

    /// Append a batch in order, e.g. a fetched history page.
    pub fn extend(&mut self, id: ConversationId, messages: impl IntoIterator<Item = Message>) {
        self.ensure(id);
        for message in messages {
            self.append(id, message);
        }
    }

    /// Put fetched history in front of whatever arrived live before it.
    /// Live entries that the history already holds collapse into it by id.
    pub fn seed(&mut self, id: ConversationId, history: impl IntoIterator<Item = Message>) {
        let live = self.timelines.insert(id, Vec::new()).unwrap_or_default();
        self.extend(id, history);
        self.extend(id, live);
    }

    /// Show a locally composed message before the server confirms it.
    ///
    /// The entry is stored without an id and marked [`Delivery::Pending`];
    /// a correlation token is assigned if the message has none. Returns it.
    pub fn send_optimistic(&mut self, id: ConversationId, mut message: Message) -> String {
        let client_ref = message
            .client_ref
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        message.id = None;
        message.client_ref = Some(client_ref.clone());
        message.delivery = Delivery::Pending;
        self.timelines.entry(id).or_default().push(message);
        client_ref
    }

    /// Flag an unconfirmed optimistic entry as failed. Returns false when no
    /// such entry exists (already confirmed, or unknown).
    pub fn mark_failed(&mut self, id: ConversationId, client_ref: &str) -> bool {
        self.set_delivery(id, client_ref, Delivery::Failed).is_some()
    }

    /// Move a failed entry back to pending for a retry and return a copy of it.
    pub fn mark_pending(&mut self, id: ConversationId, client_ref: &str) -> Option<Message> {
        let timeline = self.timelines.get(&id)?;
        let failed = timeline
            .iter()
            .any(|m| m.client_ref.as_deref() == Some(client_ref) && m.delivery == Delivery::Failed);
        if !failed {
            return None;
        }
        self.set_delivery(id, client_ref, Delivery::Pending)
    }

    /// Read-only view of a timeline; empty for unknown conversations.
    pub fn timeline(&self, id: ConversationId) -> &[Message] {
        self.timelines.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Correlation tokens of every failed entry in `id`, oldest first.
    pub fn failed(&self, id: ConversationId) -> Vec<String> {
        self.timeline(id)
            .iter()
            .filter(|m| m.delivery == Delivery::Failed)
            .filter_map(|m| m.client_ref.clone())
            .collect()
    }

    fn set_delivery(&mut self, id: ConversationId, client_ref: &str, delivery: Delivery) -> Option<Message> {
        let entry = self
            .timelines
            .get_mut(&id)?
            .iter_mut()
            .find(|m| m.is_optimistic() && m.client_ref.as_deref() == Some(client_ref))?;
        entry.delivery = delivery;
        Some(entry.clone())
    }
}

fn find_optimistic(timeline: &[Message], incoming: &Message) -> Option<usize> {
    if let Some(client_ref) = incoming.client_ref.as_deref() {
        if let Some(pos) = timeline
            .iter()
            .position(|m| m.is_optimistic() && m.client_ref.as_deref() == Some(client_ref))
        {
            return Some(pos);
        }
    }

    // Servers that do not echo the token: fall back to sender + content.
    if incoming.id.is_some() && incoming.client_ref.is_none() {
        return timeline.iter().position(|m| {
            m.is_optimistic() && m.sender_id == incoming.sender_id && m.content == incoming.content
        });
    }

    None
}

/// The replacement keeps the token of the entry it replaces.
fn carry_ref(existing: &Message, mut incoming: Message) -> Message {
    if incoming.client_ref.is_none() {
        incoming.client_ref = existing.client_ref.clone();
    }
    incoming
}
