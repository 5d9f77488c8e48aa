//! Consume-state bookkeeping, the consume loop, and the ack/reject failure
//! policy (spec.md §3, §4.3.1–§4.3.3).
//!
//! The ack/reject *decision* is split out as a pure function
//! (`decide_rejection`) so it's testable without a live broker — the
//! load-bearing design choice for spec.md §8's testable properties #2 and
//! #5 and scenarios S3/S4.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use lapin::Channel;
use tokio::sync::Semaphore;

use crate::delayed_reject::DelayedRejectTable;
use crate::message::Message;

/// Default cap on concurrently-scheduled delayed rejects per consumer
/// (spec.md §4.3.2).
pub const DEFAULT_DELAYED_REJECTIONS_LIMIT: usize = 10_000;

/// One active consumer's registration (spec.md §3 "Consume state").
pub struct ConsumerRegistration {
    pub consumer_tag: String,
    pub queue: String,
    pub no_ack: bool,
    pub parallel: i64,
    pub requeue_delay: Duration,
    pub always_requeue: bool,
    pub channel: Channel,
    /// Set by `cancel_consuming` before it issues `basic.cancel`, so the
    /// consume loop's own exit handling can tell a local cancel apart from
    /// the stream simply ending (broker close, connection loss) once it
    /// notices — the loop has no other way to distinguish the two.
    pub local_cancel: Arc<AtomicBool>,
}

/// `consumer_tag -> registration` map, owned exclusively by `Protocol`.
#[derive(Default)]
pub struct ConsumeState {
    inner: HashMap<String, ConsumerRegistration>,
}

impl ConsumeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registration: ConsumerRegistration) {
        self.inner.insert(registration.consumer_tag.clone(), registration);
    }

    pub fn remove(&mut self, consumer_tag: &str) -> Option<ConsumerRegistration> {
        self.inner.remove(consumer_tag)
    }

    pub fn get(&self, consumer_tag: &str) -> Option<&ConsumerRegistration> {
        self.inner.get(consumer_tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|s| s.as_str())
    }

    pub fn drain(&mut self) -> Vec<ConsumerRegistration> {
        self.inner.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// What to do with a delivery whose callback failed, per spec.md §4.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectDecision {
    /// `basic_reject(delivery_tag, requeue=false)`.
    RejectNoRequeue,
    /// `basic_reject(delivery_tag, requeue=true)` immediately.
    RejectRequeueNow,
    /// Schedule a delayed `basic_reject(delivery_tag, requeue=true)`.
    ScheduleDelayedRequeue,
    /// Neither ack nor reject — let the broker redeliver on its own.
    Hold,
}

/// The pure failed-message rejection policy from spec.md §4.3.2. Does not
/// touch the network — callers act on the returned decision.
pub fn decide_rejection(
    redelivered: bool,
    always_requeue: bool,
    requeue_delay: Duration,
    scheduled_delayed_rejects_for_consumer: usize,
    delayed_rejections_limit: usize,
) -> RejectDecision {
    let over_limit = scheduled_delayed_rejects_for_consumer > delayed_rejections_limit;

    if redelivered || over_limit {
        if always_requeue {
            RejectDecision::Hold
        } else {
            RejectDecision::RejectNoRequeue
        }
    } else if requeue_delay > Duration::ZERO {
        RejectDecision::ScheduleDelayedRequeue
    } else {
        RejectDecision::RejectRequeueNow
    }
}

/// Why the consume loop's `consumer.next()` stopped yielding deliveries
/// (spec.md §4.3.1) — purely descriptive, logged on exit. Whether buffered
/// deliveries get rejected-with-requeue is decided separately, from
/// `ConsumerRegistration::local_cancel`, not from this enum: a local cancel
/// and a broker-initiated close both end the stream the same way (`None`),
/// so this type can't carry that distinction on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The consumer stream ended (`None`): local cancel, broker cancel, or
    /// connection loss all surface this way.
    Terminator,
    /// The stream yielded an error.
    UnexpectedError,
}

/// A single inbox item: either a real delivery or a termination signal, the
/// Rust equivalent of `twoost`'s `queue.get()` raising `_PikaQueueUnconsumed`
/// / `ConnectionDone` / yielding `None`.
pub enum InboxItem {
    Delivery(Box<Message>),
    Terminator,
    Unconsumed,
    ConnectionLost,
}

/// The concurrency gate from spec.md §4.3.1: `max(parallel, 1)` permits when
/// `parallel >= 0`, unbounded (no gating) when `parallel < 0`.
pub enum ConcurrencyGate {
    Bounded(Arc<Semaphore>),
    Unbounded,
}

impl ConcurrencyGate {
    pub fn new(parallel: i64) -> Self {
        if parallel >= 0 {
            let permits = std::cmp::max(parallel, 1) as usize;
            ConcurrencyGate::Bounded(Arc::new(Semaphore::new(permits)))
        } else {
            ConcurrencyGate::Unbounded
        }
    }

    /// Acquire a permit, if this gate is bounded. The returned guard must be
    /// held for the lifetime of one in-flight callback and dropped on
    /// completion to release it back.
    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match self {
            ConcurrencyGate::Bounded(sem) => {
                Some(sem.clone().acquire_owned().await.expect("semaphore never closed"))
            }
            ConcurrencyGate::Unbounded => None,
        }
    }

    pub fn available_permits(&self) -> Option<usize> {
        match self {
            ConcurrencyGate::Bounded(sem) => Some(sem.available_permits()),
            ConcurrencyGate::Unbounded => None,
        }
    }
}

/// Drain a consumer's delayed-reject table on loop exit (spec.md §4.3.3
/// step 2). `do_reject` is true only when the loss was local and there is a
/// live ack-mode channel to reject on.
pub async fn cleanup_delayed_rejects(table: &DelayedRejectTable, consumer_tag: &str, do_reject: bool) {
    let drained = table.drain_consumer(consumer_tag);
    if !do_reject {
        return;
    }
    for (delivery_tag, channel) in drained {
        if let Err(err) = channel
            .basic_reject(delivery_tag, lapin::options::BasicRejectOptions { requeue: true })
            .await
        {
            tracing::error!(%err, delivery_tag, "failed to reject buffered delivery during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivered_without_always_requeue_rejects_no_requeue() {
        let decision = decide_rejection(true, false, Duration::from_secs(1), 0, DEFAULT_DELAYED_REJECTIONS_LIMIT);
        assert_eq!(decision, RejectDecision::RejectNoRequeue);
    }

    #[test]
    fn redelivered_with_always_requeue_holds() {
        let decision = decide_rejection(true, true, Duration::from_secs(1), 0, DEFAULT_DELAYED_REJECTIONS_LIMIT);
        assert_eq!(decision, RejectDecision::Hold);
    }

    #[test]
    fn over_limit_behaves_like_redelivered() {
        let decision = decide_rejection(false, false, Duration::from_secs(1), 10_001, 10_000);
        assert_eq!(decision, RejectDecision::RejectNoRequeue);
    }

    #[test]
    fn not_redelivered_under_limit_with_delay_schedules() {
        let decision = decide_rejection(false, false, Duration::from_millis(500), 0, DEFAULT_DELAYED_REJECTIONS_LIMIT);
        assert_eq!(decision, RejectDecision::ScheduleDelayedRequeue);
    }

    #[test]
    fn not_redelivered_zero_delay_rejects_requeue_now() {
        let decision = decide_rejection(false, false, Duration::ZERO, 0, DEFAULT_DELAYED_REJECTIONS_LIMIT);
        assert_eq!(decision, RejectDecision::RejectRequeueNow);
    }

    #[tokio::test]
    async fn bounded_gate_caps_concurrent_permits_at_max_parallel_one() {
        let gate = ConcurrencyGate::new(3);
        assert_eq!(gate.available_permits(), Some(3));
        let p1 = gate.acquire().await;
        let p2 = gate.acquire().await;
        let p3 = gate.acquire().await;
        assert_eq!(gate.available_permits(), Some(0));
        drop(p1);
        assert_eq!(gate.available_permits(), Some(1));
        drop(p2);
        drop(p3);
    }

    #[test]
    fn negative_parallel_is_unbounded() {
        let gate = ConcurrencyGate::new(-1);
        assert_eq!(gate.available_permits(), None);
    }

    #[test]
    fn zero_parallel_means_one_permit() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.available_permits(), Some(1));
    }
}
