//! Publisher-confirm bookkeeping (spec.md §3, §4.3).
//!
//! Grounded on `_AMQPProtocol._onPublishConfirm` /
//! `_fail_published_messages` in `twoost/amqp.py`: a `delivery_tag -> pending`
//! map, resolved ascending-by-tag for a `multiple` ack/nack, drained and
//! failed wholesale on channel/connection loss.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::Error;

/// What a confirmed publish eventually resolves to.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The safe-write channel was closed by the broker before a confirm
    /// arrived; the channel itself gets reopened, this entry does not.
    ChannelClosed(String),
    /// The whole connection was lost.
    ConnectionLost,
}

/// A handle the publish caller awaits.
pub struct ConfirmHandle {
    rx: oneshot::Receiver<ConfirmOutcome>,
}

impl ConfirmHandle {
    pub async fn wait(self) -> Result<(), Error> {
        match self.rx.await {
            Ok(ConfirmOutcome::Ack) => Ok(()),
            Ok(ConfirmOutcome::Nack) => Err(Error::BrokerNack),
            Ok(ConfirmOutcome::ChannelClosed(reason)) => Err(Error::ChannelClosed { code: 0, text: reason }),
            Ok(ConfirmOutcome::ConnectionLost) => Err(Error::ConnectionDone),
            // The sending half was dropped without resolving — treat as a
            // connection loss, the only way that can happen given the
            // fail-all paths always resolve every entry before a table is
            // torn down.
            Err(_) => Err(Error::ConnectionDone),
        }
    }

    /// An already-resolved, successful handle — used for `confirm=false`
    /// publishes, which resolve immediately per spec.md §4.3.
    pub fn resolved_ok() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ConfirmOutcome::Ack);
        Self { rx }
    }
}

/// `delivery_tag -> pending completion` bookkeeping for one safe-write
/// channel. Keys are assigned by a monotonic counter starting at 1.
pub struct ConfirmTable {
    counter: AtomicU64,
    pending: Mutex<BTreeMap<u64, oneshot::Sender<ConfirmOutcome>>>,
}

impl Default for ConfirmTable {
    fn default() -> Self {
        Self { counter: AtomicU64::new(0), pending: Mutex::new(BTreeMap::new()) }
    }
}

impl ConfirmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next delivery tag and register a pending confirm for it,
    /// returning the tag (for `basic_publish`) and a handle the caller can
    /// await.
    pub fn register(&self) -> (u64, ConfirmHandle) {
        let tag = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tag, tx);
        (tag, ConfirmHandle { rx })
    }

    /// Resolve a broker ack. `multiple` resolves every entry with key ≤
    /// `delivery_tag`, ascending; otherwise resolves exactly that entry.
    pub fn resolve_ack(&self, delivery_tag: u64, multiple: bool) {
        self.resolve(delivery_tag, multiple, ConfirmOutcome::Ack);
    }

    /// Resolve a broker nack, same key-selection rule as `resolve_ack`.
    pub fn resolve_nack(&self, delivery_tag: u64, multiple: bool) {
        self.resolve(delivery_tag, multiple, ConfirmOutcome::Nack);
    }

    /// Resolve a single entry as connection-lost — used when awaiting one
    /// publish's own confirmation future errors out, which only ever happens
    /// because the connection under it is gone.
    pub fn fail_one_connection_lost(&self, delivery_tag: u64) {
        self.resolve(delivery_tag, false, ConfirmOutcome::ConnectionLost);
    }

    fn resolve(&self, delivery_tag: u64, multiple: bool, outcome: ConfirmOutcome) {
        let mut pending = self.pending.lock().unwrap();
        if multiple {
            let tags: Vec<u64> = pending.range(..=delivery_tag).map(|(k, _)| *k).collect();
            for tag in tags {
                if let Some(tx) = pending.remove(&tag) {
                    let _ = tx.send(outcome.clone());
                }
            }
        } else if let Some(tx) = pending.remove(&delivery_tag) {
            let _ = tx.send(outcome);
        }
    }

    /// Fail every entry still present because the safe-write channel was
    /// closed by the broker (spec.md §4.3 "Safe-write-channel closed by
    /// broker"). Entries already resolved by a prior `resolve_ack`/
    /// `resolve_nack` are not touched twice — this function only ever sees
    /// what `remove` left behind, resolving spec.md §9's "resolve only
    /// entries still present in the table at close time" open question.
    pub fn fail_all_channel_closed(&self, reason: impl Into<String>) {
        self.drain_and_resolve(|reason| ConfirmOutcome::ChannelClosed(reason), reason.into());
    }

    /// Fail every entry still present because the whole connection was lost
    /// (spec.md §4.3 "Connection lost").
    pub fn fail_all_connection_lost(&self) {
        self.drain_and_resolve(|_| ConfirmOutcome::ConnectionLost, String::new());
    }

    fn drain_and_resolve(&self, outcome: impl Fn(String) -> ConfirmOutcome, reason: String) {
        let mut pending = self.pending.lock().unwrap();
        let entries: Vec<_> = std::mem::take(&mut *pending).into_iter().collect();
        drop(pending);
        for (_, tx) in entries {
            let _ = tx.send(outcome(reason.clone()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_ack_resolves_only_that_tag() {
        let table = ConfirmTable::new();
        let (tag, handle) = table.register();
        assert_eq!(tag, 1);
        table.resolve_ack(1, false);
        handle.wait().await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn multi_ack_resolves_ascending_and_leaves_later_tags_pending() {
        let table = ConfirmTable::new();
        let (_, h1) = table.register();
        let (_, h2) = table.register();
        let (_, h3) = table.register();

        table.resolve_ack(2, true);
        h1.wait().await.unwrap();
        h2.wait().await.unwrap();
        assert_eq!(table.len(), 1);

        table.resolve_nack(3, false);
        let err = h3.wait().await.unwrap_err();
        assert!(matches!(err, Error::BrokerNack));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_channel_closed_resolves_every_remaining_entry_exactly_once() {
        let table = ConfirmTable::new();
        let (_, h1) = table.register();
        table.resolve_ack(1, false);
        let (_, h2) = table.register();

        table.fail_all_channel_closed("channel closed");
        h1.wait().await.unwrap();
        let err = h2.wait().await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { .. }));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_connection_lost_resolves_as_connection_done() {
        let table = ConfirmTable::new();
        let (_, h1) = table.register();
        table.fail_all_connection_lost();
        let err = h1.wait().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionDone));
    }

    #[tokio::test]
    async fn unconfirmed_publish_resolves_immediately_ok() {
        let handle = ConfirmHandle::resolved_ok();
        handle.wait().await.unwrap();
    }
}
