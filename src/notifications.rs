//! Per-peer unread flags.
//!
//! The tracker knows which peer's conversation is on screen and refuses to
//! flag that peer: activity in the open conversation is, by definition, seen.
//! Clearing a flag is local only; the server-side mark-read belongs to the
//! session coordinator.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct NotificationTracker {
    unread: BTreeSet<i64>,
    active_peer: Option<i64>,
}

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag `peer_id`. Returns true if the flag changed. No-op while that
    /// peer's conversation is active.
    pub fn set_unread(&mut self, peer_id: i64) -> bool {
        if self.active_peer == Some(peer_id) {
            return false;
        }
        self.unread.insert(peer_id)
    }

    /// Returns true if the flag was set before.
    pub fn clear_unread(&mut self, peer_id: i64) -> bool {
        self.unread.remove(&peer_id)
    }

    pub fn is_unread(&self, peer_id: i64) -> bool {
        self.unread.contains(&peer_id)
    }

    /// Replace every flag with a server snapshot. `false` entries are dropped.
    pub fn hydrate(&mut self, flags: &HashMap<i64, bool>) {
        self.unread = flags
            .iter()
            .filter(|(_, unread)| **unread)
            .map(|(peer, _)| *peer)
            .filter(|peer| self.active_peer != Some(*peer))
            .collect();
    }

    /// The peer whose conversation is currently shown, if any.
    pub fn set_active_peer(&mut self, peer_id: Option<i64>) {
        self.active_peer = peer_id;
    }

    pub fn active_peer(&self) -> Option<i64> {
        self.active_peer
    }

    /// Flagged peers, ascending.
    pub fn unread_peers(&self) -> Vec<i64> {
        self.unread.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_clear() {
        let mut t = NotificationTracker::new();
        assert!(t.set_unread(5));
        assert!(t.is_unread(5));
        assert!(t.clear_unread(5));
        assert!(!t.is_unread(5));
    }

    #[test]
    fn clear_is_idempotent() {
        let mut t = NotificationTracker::new();
        t.set_unread(5);
        t.clear_unread(5);
        assert!(!t.clear_unread(5));
        assert!(!t.is_unread(5));
    }

    #[test]
    fn active_peer_is_never_flagged() {
        let mut t = NotificationTracker::new();
        t.set_active_peer(Some(5));
        assert!(!t.set_unread(5));
        assert!(!t.is_unread(5));
        assert!(t.set_unread(6), "other peers still flag");
    }

    #[test]
    fn setting_twice_reports_no_change() {
        let mut t = NotificationTracker::new();
        assert!(t.set_unread(2));
        assert!(!t.set_unread(2));
    }

    #[test]
    fn hydrate_replaces_wholesale() {
        let mut t = NotificationTracker::new();
        t.set_unread(1);
        let flags = HashMap::from([(2, true), (3, true), (4, false)]);
        t.hydrate(&flags);
        assert_eq!(t.unread_peers(), vec![2, 3]);
    }

    #[test]
    fn hydrate_respects_active_peer() {
        let mut t = NotificationTracker::new();
        t.set_active_peer(Some(2));
        t.hydrate(&HashMap::from([(2, true), (3, true)]));
        assert_eq!(t.unread_peers(), vec![3]);
    }
}
