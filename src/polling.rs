//! Jittered, cancellable HTTP poll loops.
//!
//! Each resource gets one task running `Waiting -> Fetching -> Waiting`
//! until its ticket goes stale. A loop awaits its own fetch before sleeping
//! again, so two fetches for the same resource are never in flight. Failures
//! are logged and the schedule carries on.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::api::ChatApi;
use crate::config::PollWindow;
use crate::error::ChatError;
use crate::events::{EventSink, SyncEvent};
use crate::liveness::{Liveness, Ticket};

/// Consecutive failures after which poll errors log at `error` level.
const ESCALATE_AFTER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResource {
    /// `GET /messages/new` for the global room.
    Messages,
    /// `GET /active-users`.
    Roster,
}

impl std::fmt::Display for PollResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollResource::Messages => write!(f, "messages"),
            PollResource::Roster => write!(f, "roster"),
        }
    }
}

/// One resource's loop: its liveness and, while running, its task.
#[derive(Debug, Default)]
struct PollLoop {
    liveness: Liveness,
    task: Option<JoinHandle<()>>,
}

impl PollLoop {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop(&mut self) {
        self.liveness.revoke();
        // Dropping the handle detaches the task; it exits at its next ticket check.
        self.task = None;
    }
}

/// Owns the global-messages loop and the roster loop.
#[derive(Debug, Default)]
pub struct PollingChannel {
    messages: PollLoop,
    roster: PollLoop,
}

impl PollingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start polling `resource` for `user_id`. Returns false if it was
    /// already running.
    pub fn start<A: ChatApi>(
        &mut self,
        resource: PollResource,
        api: Arc<A>,
        user_id: i64,
        window: PollWindow,
        sink: EventSink,
    ) -> bool {
        let slot = self.slot(resource);
        if slot.is_running() {
            return false;
        }
        slot.liveness.revoke();
        let ticket = slot.liveness.ticket();
        debug!(%resource, user_id, generation = ticket.issued(), "starting poll loop");
        slot.task = Some(tokio::spawn(run_loop(api, resource, user_id, window, ticket, sink)));
        true
    }

    /// Stop polling `resource`. Safe to call repeatedly. A fetch already in
    /// flight completes, but its result is dropped.
    pub fn stop(&mut self, resource: PollResource) {
        debug!(%resource, "stopping poll loop");
        self.slot(resource).stop();
    }

    pub fn stop_all(&mut self) {
        self.stop(PollResource::Messages);
        self.stop(PollResource::Roster);
    }

    pub fn is_running(&self, resource: PollResource) -> bool {
        match resource {
            PollResource::Messages => self.messages.is_running(),
            PollResource::Roster => self.roster.is_running(),
        }
    }

    /// True if `ticket` came from any run of `resource`'s loop, stopped or not.
    pub fn issued(&self, resource: PollResource, ticket: &Ticket) -> bool {
        match resource {
            PollResource::Messages => self.messages.liveness.issued(ticket),
            PollResource::Roster => self.roster.liveness.issued(ticket),
        }
    }

    /// True if `ticket` came from the current run of `resource`'s loop.
    pub fn owns(&self, resource: PollResource, ticket: &Ticket) -> bool {
        match resource {
            PollResource::Messages => self.messages.liveness.owns(ticket),
            PollResource::Roster => self.roster.liveness.owns(ticket),
        }
    }

    fn slot(&mut self, resource: PollResource) -> &mut PollLoop {
        match resource {
            PollResource::Messages => &mut self.messages,
            PollResource::Roster => &mut self.roster,
        }
    }
}

async fn run_loop<A: ChatApi>(
    api: Arc<A>,
    resource: PollResource,
    user_id: i64,
    window: PollWindow,
    ticket: Ticket,
    sink: EventSink,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        let delay = window.sample(&mut rand::thread_rng());
        tokio::time::sleep(delay).await;

        if !ticket.is_live() {
            break;
        }

        let fetched = match resource {
            PollResource::Messages => api
                .new_messages(user_id)
                .await
                .map(|messages| SyncEvent::GlobalMessages { ticket: ticket.clone(), messages }),
            PollResource::Roster => api
                .active_users(user_id)
                .await
                .map(|users| SyncEvent::Roster { ticket: ticket.clone(), users }),
        };

        if !ticket.is_live() {
            debug!(%resource, "poll loop stopped mid-fetch, discarding result");
            break;
        }

        match fetched {
            Ok(event) => {
                consecutive_failures = 0;
                if sink.send(event).is_err() {
                    // Coordinator is gone.
                    break;
                }
            }
            Err(e) => {
                let err = ChatError::Fetch(e);
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= ESCALATE_AFTER {
                    error!(error = %err, %resource, consecutive_failures, "poll failed repeatedly, will retry next cycle");
                } else {
                    warn!(error = %err, %resource, "poll failed, will retry next cycle");
                }
            }
        }
    }

    debug!(%resource, "poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SendRequest;
    use crate::error::ApiError;
    use crate::model::{Message, PrivateChat, User};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    /// Counts fetches; optionally blocks each fetch on a gate, optionally
    /// fails the first `fail_first` calls.
    #[derive(Default)]
    struct PollApi {
        message_calls: AtomicUsize,
        roster_calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail_first: usize,
    }

    fn not_here() -> ApiError {
        ApiError::Http { status: 501, url: "mock".into() }
    }

    fn msg(id: i64) -> Message {
        serde_json::from_value(serde_json::json!({"id": id, "content": format!("m{id}"), "user_id": 2})).unwrap()
    }

    impl ChatApi for PollApi {
        async fn generate_username(&self) -> Result<String, ApiError> {
            Err(not_here())
        }
        async fn join(&self, _username: &str) -> Result<User, ApiError> {
            Err(not_here())
        }
        async fn new_messages(&self, _user_id: i64) -> Result<Vec<Message>, ApiError> {
            let n = self.message_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if n < self.fail_first {
                return Err(ApiError::Connect { url: "mock".into(), detail: "refused".into() });
            }
            Ok(vec![msg(n as i64 * 2 + 1), msg(n as i64 * 2 + 2)])
        }
        async fn active_users(&self, _current_user_id: i64) -> Result<Vec<User>, ApiError> {
            self.roster_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![User { id: 2, username: "y".into(), joined_recently: false }])
        }
        async fn send_message(&self, _request: &SendRequest) -> Result<Message, ApiError> {
            Err(not_here())
        }
        async fn get_or_create_chat(&self, _a: i64, _b: i64) -> Result<PrivateChat, ApiError> {
            Err(not_here())
        }
        async fn chat_messages(&self, _chat_id: i64) -> Result<Vec<Message>, ApiError> {
            Err(not_here())
        }
        async fn unread_flags(&self, _user_id: i64) -> Result<HashMap<i64, bool>, ApiError> {
            Err(not_here())
        }
        async fn mark_read(&self, _user_id: i64, _chat_id: i64) -> Result<(), ApiError> {
            Err(not_here())
        }
    }

    #[test]
    fn resource_display() {
        assert_eq!(PollResource::Messages.to_string(), "messages");
        assert_eq!(PollResource::Roster.to_string(), "roster");
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_messages_in_server_order() {
        let api = Arc::new(PollApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        match rx.recv().await.unwrap() {
            SyncEvent::GlobalMessages { ticket, messages } => {
                assert!(ticket.is_live());
                let ids: Vec<Option<i64>> = messages.iter().map(|m| m.id).collect();
                assert_eq!(ids, [Some(1), Some(2)]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        polling.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn first_fetch_waits_for_a_jittered_delay() {
        let api = Arc::new(PollApi::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert_eq!(api.message_calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(3_001)).await;
        assert!(api.message_calls.load(Ordering::SeqCst) >= 1);
        polling.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_timer_fires_prevents_fetch() {
        let api = Arc::new(PollApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        polling.stop(PollResource::Messages);
        polling.stop(PollResource::Messages);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.message_calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_result_is_discarded_after_stop() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(PollApi { gate: Some(Arc::clone(&gate)), ..PollApi::default() });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(api.message_calls.load(Ordering::SeqCst), 1, "fetch should be in flight");

        polling.stop(PollResource::Messages);
        gate.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(rx.try_recv().is_err(), "stale result must not be delivered");
        assert_eq!(api.message_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_schedule() {
        let api = Arc::new(PollApi { fail_first: 3, ..PollApi::default() });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::GlobalMessages { .. }));
        assert_eq!(api.message_calls.load(Ordering::SeqCst), 4);
        polling.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_running_is_noop() {
        let api = Arc::new(PollApi::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        let fixed = PollWindow { min_ms: 1_000, max_ms: 1_001 };
        assert!(polling.start(PollResource::Roster, Arc::clone(&api), 1, fixed, tx.clone()));
        assert!(!polling.start(PollResource::Roster, Arc::clone(&api), 1, fixed, tx));
        assert!(polling.is_running(PollResource::Roster));
        assert!(!polling.is_running(PollResource::Messages));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(api.roster_calls.load(Ordering::SeqCst), 1, "only one loop may run");
        polling.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_issues_fresh_ticket() {
        let api = Arc::new(PollApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx.clone());
        polling.stop(PollResource::Messages);
        assert!(polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx));

        let event = rx.recv().await.unwrap();
        assert!(polling.owns(PollResource::Messages, event.ticket()));
        assert!(!polling.owns(PollResource::Roster, event.ticket()));
        polling.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_result_stays_recognized_after_stop() {
        let api = Arc::new(PollApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut polling = PollingChannel::new();
        polling.start(PollResource::Messages, Arc::clone(&api), 1, PollWindow::MESSAGES, tx);

        let event = rx.recv().await.unwrap();
        polling.stop(PollResource::Messages);

        assert!(!polling.owns(PollResource::Messages, event.ticket()));
        assert!(polling.issued(PollResource::Messages, event.ticket()));
        assert!(!polling.issued(PollResource::Roster, event.ticket()));
    }
}
