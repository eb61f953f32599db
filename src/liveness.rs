//! Generation-counter liveness tokens.
//!
//! A channel owns one [`Liveness`]. Every time it starts work it hands out a
//! [`Ticket`]; stopping the channel calls [`Liveness::revoke`], which bumps the
//! generation and turns every outstanding ticket stale. Work that finishes
//! late checks its ticket and throws its result away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    generation: Arc<AtomicU64>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a ticket bound to the current generation.
    pub fn ticket(&self) -> Ticket {
        Ticket {
            generation: Arc::clone(&self.generation),
            issued: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Invalidate every ticket issued so far. Idempotent in effect: a second
    /// revoke leaves all old tickets just as stale.
    pub fn revoke(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True if `ticket` was issued by this liveness, current or not.
    pub fn issued(&self, ticket: &Ticket) -> bool {
        Arc::ptr_eq(&self.generation, &ticket.generation)
    }

    /// True if `ticket` was issued by this liveness and is still current.
    pub fn owns(&self, ticket: &Ticket) -> bool {
        self.issued(ticket) && ticket.is_live()
    }
}

/// Proof that some work was scheduled under a particular generation.
#[derive(Debug, Clone)]
pub struct Ticket {
    generation: Arc<AtomicU64>,
    issued: u64,
}

impl Ticket {
    pub fn is_live(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.issued
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }
}
