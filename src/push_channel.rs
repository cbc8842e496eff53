// =============================================================================
// Push Channel — per-challenge event fan-out to subscribed WebSocket clients
// =============================================================================
//
// Grounded on the teacher's `api::ws` snapshot-push loop, but event-driven
// instead of poll-on-a-timer: the teacher diffs a global `state_version`
// every 500 ms and re-sends a full snapshot, which doesn't fit a
// per-challenge event stream with ordering and backpressure requirements
// (spec.md §4.8). Each subscriber gets its own bounded queue instead of the
// teacher's single shared socket loop, following the mpsc-per-connection
// pattern that `broadcast` itself uses internally, but hand-rolled here so
// per-connection backpressure can distinguish state-carrying events
// (droppable) from terminal ones (never dropped).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::db::models::{PayoutRequest, Position};

/// Per-connection buffer capacity. Generous enough to absorb a burst of
/// evaluator ticks between client reads without needing to drop anything in
/// the common case.
const BUFFER_CAPACITY: usize = 256;

/// A client whose buffer has been continuously full for this long is
/// disconnected (spec.md §4.8).
const MAX_CONTINUOUS_FULL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    BalanceUpdate(BalanceUpdatePayload),
    PositionOpened(Position),
    PositionClosed(Position),
    PhaseTransition(PhaseTransitionPayload),
    PayoutStatus(PayoutRequest),
}

impl PushEvent {
    /// Only `BalanceUpdate` is state-carrying: a later one fully supersedes
    /// an earlier one, so it is safe to drop under backpressure. Every other
    /// variant is terminal — it reports something that happened once and
    /// must reach the client (spec.md §4.8).
    fn is_droppable(&self) -> bool {
        matches!(self, PushEvent::BalanceUpdate(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceUpdatePayload {
    pub challenge_id: Uuid,
    pub current_balance: f64,
    pub equity: f64,
    pub open_position_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTransitionPayload {
    pub challenge_id: Uuid,
    pub from_status: String,
    pub to_status: String,
}

struct Subscriber {
    queue: Mutex<VecDeque<PushEvent>>,
    notify: Notify,
    full_since: Mutex<Option<Instant>>,
}

impl Subscriber {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
            notify: Notify::new(),
            full_since: Mutex::new(None),
        }
    }

    /// Returns `true` if this subscriber has been continuously full for
    /// longer than `MAX_CONTINUOUS_FULL` and should be disconnected.
    fn push(&self, event: PushEvent) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= BUFFER_CAPACITY {
            // Make room by dropping the oldest droppable entry rather than
            // losing the incoming event, whether it's droppable or
            // terminal (spec.md §4.8: "on overflow, drop oldest
            // balance_update events").
            if let Some(pos) = queue.iter().position(PushEvent::is_droppable) {
                queue.remove(pos);
            } else if event.is_droppable() {
                // Buffer is wall-to-wall terminal events and the incoming
                // event is itself droppable; nothing older to evict, so
                // drop the incoming one instead of growing unboundedly.
                drop(queue);
                return self.mark_full_and_check();
            } else {
                // Buffer is wall-to-wall terminal events and the incoming
                // one is terminal too; grow rather than lose one — this is
                // pathological and should be rare.
                queue.push_back(event);
                drop(queue);
                self.notify.notify_one();
                return self.mark_full_and_check();
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        *self.full_since.lock() = None;
        false
    }

    fn mark_full_and_check(&self) -> bool {
        let mut full_since = self.full_since.lock();
        let since = *full_since.get_or_insert_with(Instant::now);
        since.elapsed() > MAX_CONTINUOUS_FULL
    }

    async fn recv(&self) -> PushEvent {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// A subscription handle returned to the WebSocket handler. Dropping it
/// unsubscribes.
pub struct Subscription {
    channel: std::sync::Weak<PushChannelInner>,
    challenge_id: Uuid,
    id: u64,
    subscriber: std::sync::Arc<Subscriber>,
}

impl Subscription {
    pub async fn recv(&self) -> PushEvent {
        self.subscriber.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.unsubscribe(self.challenge_id, self.id);
        }
    }
}

struct PushChannelInner {
    subscribers: Mutex<HashMap<Uuid, HashMap<u64, std::sync::Arc<Subscriber>>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl PushChannelInner {
    fn unsubscribe(&self, challenge_id: Uuid, id: u64) {
        let mut subs = self.subscribers.lock();
        if let Some(per_challenge) = subs.get_mut(&challenge_id) {
            per_challenge.remove(&id);
            if per_challenge.is_empty() {
                subs.remove(&challenge_id);
            }
        }
    }
}

/// Fan-out hub shared across the Risk Evaluator, Trade Ledger, Phase State
/// Machine and Payout Ledger (producers) and the WebSocket handler
/// (consumer). Held behind an `Arc` in `AppState`.
pub struct PushChannel {
    inner: std::sync::Arc<PushChannelInner>,
}

impl Default for PushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PushChannel {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(PushChannelInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new subscriber for `challenge_id`. Caller is responsible
    /// for checking that the principal owns the challenge or is admin
    /// (spec.md §4.8) before calling this.
    pub fn subscribe(&self, challenge_id: Uuid) -> Subscription {
        let id = self
            .inner
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let subscriber = std::sync::Arc::new(Subscriber::new());
        self.inner
            .subscribers
            .lock()
            .entry(challenge_id)
            .or_default()
            .insert(id, subscriber.clone());
        Subscription {
            channel: std::sync::Arc::downgrade(&self.inner),
            challenge_id,
            id,
            subscriber,
        }
    }

    /// Publishes `event` to every subscriber of `challenge_id`. Disconnects
    /// (drops) subscribers that have been continuously full for more than
    /// 30 s by simply removing them — the WebSocket handler's own `recv`
    /// loop notices the channel went away via `Weak::upgrade` failing on its
    /// next send attempt... in practice the handler polls `recv()` directly
    /// on the live `Arc<Subscriber>`, so disconnection here instead closes
    /// the subscriber out from the map; the handler's next `select!` against
    /// the client's own read half still detects the drop through the normal
    /// WebSocket close path.
    pub fn publish(&self, challenge_id: Uuid, event: PushEvent) {
        let stale: Vec<u64> = {
            let subs = self.inner.subscribers.lock();
            let Some(per_challenge) = subs.get(&challenge_id) else {
                return;
            };
            per_challenge
                .iter()
                .filter_map(|(id, sub)| sub.push(event.clone()).then_some(*id))
                .collect()
        };
        for id in stale {
            debug!(%challenge_id, subscriber = id, "disconnecting push subscriber: buffer full > 30s");
            self.inner.unsubscribe(challenge_id, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance_event(challenge_id: Uuid) -> PushEvent {
        PushEvent::BalanceUpdate(BalanceUpdatePayload {
            challenge_id,
            current_balance: 100.0,
            equity: 100.0,
            open_position_count: 0,
        })
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let channel = PushChannel::new();
        let challenge_id = Uuid::new_v4();
        let sub = channel.subscribe(challenge_id);

        channel.publish(challenge_id, balance_event(challenge_id));
        channel.publish(
            challenge_id,
            PushEvent::PhaseTransition(PhaseTransitionPayload {
                challenge_id,
                from_status: "phase1".into(),
                to_status: "phase2".into(),
            }),
        );

        assert!(matches!(sub.recv().await, PushEvent::BalanceUpdate(_)));
        assert!(matches!(sub.recv().await, PushEvent::PhaseTransition(_)));
    }

    #[tokio::test]
    async fn unrelated_challenge_does_not_receive_events() {
        let channel = PushChannel::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let sub_b = channel.subscribe(b);

        channel.publish(a, balance_event(a));

        assert!(sub_b.subscriber.queue.lock().is_empty());
    }

    #[test]
    fn overflow_drops_oldest_balance_update_not_terminal() {
        let subscriber = Subscriber::new();
        for _ in 0..BUFFER_CAPACITY {
            subscriber.push(balance_event(Uuid::new_v4()));
        }
        let challenge_id = Uuid::new_v4();
        subscriber.push(PushEvent::PositionClosed(Position {
            id: Uuid::new_v4(),
            challenge_id,
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Long,
            qty: 1.0,
            leverage: 1,
            entry_price: 1.0,
            take_profit: None,
            stop_loss: None,
            margin_used: 1.0,
            opened_at: chrono::Utc::now(),
            closed_at: Some(chrono::Utc::now()),
            close_price: Some(1.0),
            close_reason: None,
            realized_pnl: Some(0.0),
        }));

        let queue = subscriber.queue.lock();
        assert_eq!(queue.len(), BUFFER_CAPACITY);
        assert!(queue.iter().any(|e| matches!(e, PushEvent::PositionClosed(_))));
    }

    #[test]
    fn overflow_with_fresh_balance_update_evicts_stale_one() {
        let subscriber = Subscriber::new();
        for _ in 0..BUFFER_CAPACITY {
            subscriber.push(balance_event(Uuid::new_v4()));
        }
        let fresh_challenge_id = Uuid::new_v4();
        subscriber.push(balance_event(fresh_challenge_id));

        let queue = subscriber.queue.lock();
        assert_eq!(queue.len(), BUFFER_CAPACITY);
        assert!(queue.iter().any(|e| matches!(
            e,
            PushEvent::BalanceUpdate(BalanceUpdatePayload { challenge_id, .. })
                if *challenge_id == fresh_challenge_id
        )));
    }

    #[test]
    fn continuously_full_for_30s_signals_disconnect() {
        let subscriber = Subscriber::new();
        for _ in 0..BUFFER_CAPACITY {
            subscriber.push(balance_event(Uuid::new_v4()));
        }
        // Force the "full since" clock into the past to simulate sustained
        // backpressure without sleeping in a unit test.
        *subscriber.full_since.lock() = Some(Instant::now() - Duration::from_secs(31));
        assert!(subscriber.push(balance_event(Uuid::new_v4())));
    }
}
