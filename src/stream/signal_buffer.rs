//! Per-recipient signal mailboxes with long-poll draining

use crate::rtc::{Signal, SignalKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How a drain orders the signals it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOrder {
    /// Arrival order
    Arrival,
    /// Offers, then answers, then candidates; arrival order within each kind
    OffersFirst,
}

#[derive(Default)]
struct Mailbox {
    queue: Vec<Signal>,
    notify: Arc<Notify>,
}

/// Pending signals keyed by recipient. Cheap to clone.
#[derive(Clone)]
pub struct SignalBuffer {
    mailboxes: Arc<Mutex<HashMap<String, Mailbox>>>,
    order: DrainOrder,
}

impl SignalBuffer {
    pub fn new(order: DrainOrder) -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            order,
        }
    }

    pub fn push(&self, recipient: &str, signal: Signal) {
        self.push_all(recipient, std::iter::once(signal));
    }

    pub fn push_all(&self, recipient: &str, signals: impl IntoIterator<Item = Signal>) {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(recipient.to_string()).or_default();
        let before = mailbox.queue.len();
        mailbox.queue.extend(signals);
        if mailbox.queue.len() > before {
            // Stores a permit when nobody is waiting yet
            mailbox.notify.notify_one();
        }
    }

    /// Take everything pending for `recipient` without waiting
    pub fn take(&self, recipient: &str) -> Vec<Signal> {
        let taken = take_locked(&mut self.mailboxes.lock(), recipient);
        self.ordered(taken)
    }

    /// Wait until something is pending for `recipient` and take all of it.
    ///
    /// Returns an empty list once `timeout` elapses. Dropping the future
    /// cancels the wait without losing queued signals.
    pub async fn drain(&self, recipient: &str, timeout: Duration) -> Vec<Signal> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut mailboxes = self.mailboxes.lock();
                if mailboxes.get(recipient).is_some_and(|m| !m.queue.is_empty()) {
                    return self.ordered(take_locked(&mut mailboxes, recipient));
                }
                mailboxes.entry(recipient.to_string()).or_default().notify.clone()
            };

            let woken = tokio::time::timeout_at(deadline, notify.notified()).await.is_ok();
            drop(notify);
            if !woken {
                return self.take(recipient);
            }
        }
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.mailboxes.lock().get(recipient).map_or(0, |m| m.queue.len())
    }

    /// Drop `recipient`'s mailbox and anything still queued in it
    pub fn remove(&self, recipient: &str) {
        self.mailboxes.lock().remove(recipient);
    }

    /// Recipients with a mailbox
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.mailboxes.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ordered(&self, mut signals: Vec<Signal>) -> Vec<Signal> {
        if self.order == DrainOrder::OffersFirst {
            signals.sort_by_key(|s| match s.kind {
                SignalKind::Offer => 0,
                SignalKind::Answer => 1,
                SignalKind::Candidate => 2,
            });
        }
        signals
    }
}

/// Empty `recipient`'s queue. The mailbox itself goes away unless another
/// drain is still waiting on it.
fn take_locked(mailboxes: &mut HashMap<String, Mailbox>, recipient: &str) -> Vec<Signal> {
    let Some(mailbox) = mailboxes.get_mut(recipient) else {
        return Vec::new();
    };
    let taken = std::mem::take(&mut mailbox.queue);
    if Arc::strong_count(&mailbox.notify) == 1 {
        mailboxes.remove(recipient);
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    fn candidate(viewer: &str, n: u16) -> Signal {
        Signal::candidate(
            viewer,
            RTCIceCandidateInit {
                candidate: format!("candidate:{}", n),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_offers_precede_candidates() {
        let buffer = SignalBuffer::new(DrainOrder::OffersFirst);
        buffer.push("capture", candidate("A", 1));
        buffer.push("capture", Signal::offer("A", "v=0 a"));
        buffer.push("capture", candidate("B", 2));
        buffer.push("capture", Signal::answer("C", "v=0 c"));
        buffer.push("capture", Signal::offer("B", "v=0 b"));

        let drained = buffer.drain("capture", Duration::from_secs(1)).await;
        let kinds: Vec<SignalKind> = drained.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SignalKind::Offer,
                SignalKind::Offer,
                SignalKind::Answer,
                SignalKind::Candidate,
                SignalKind::Candidate
            ]
        );
        assert_eq!(drained[0].viewer_id, "A");
        assert_eq!(drained[1].viewer_id, "B");
        assert_eq!(drained[3].candidate.as_ref().unwrap().candidate, "candidate:1");
        assert_eq!(buffer.pending("capture"), 0);
    }

    #[tokio::test]
    async fn test_arrival_order_kept() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        buffer.push("v", candidate("v", 1));
        buffer.push("v", Signal::answer("v", "sdp"));
        let drained = buffer.take("v");
        assert_eq!(drained[0].kind, SignalKind::Candidate);
        assert_eq!(drained[1].kind, SignalKind::Answer);
    }

    #[tokio::test]
    async fn test_empty_drain_times_out() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        let started = Instant::now();
        let drained = buffer.drain("nobody", Duration::from_millis(50)).await;
        assert!(drained.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_push_wakes_waiting_drain() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.drain("viewer", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push("viewer", Signal::answer("viewer", "v=0"));

        let drained = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(drained.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_drain_keeps_signals() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        let _ = tokio::time::timeout(Duration::from_millis(10), buffer.drain("viewer", Duration::from_secs(5))).await;
        buffer.push("viewer", Signal::offer("viewer", "v=0"));
        assert_eq!(buffer.pending("viewer"), 1);
        assert_eq!(buffer.drain("viewer", Duration::from_millis(10)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_mailboxes_are_independent() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        buffer.push("a", Signal::answer("a", "x"));
        assert!(buffer.drain("b", Duration::from_millis(10)).await.is_empty());
        assert_eq!(buffer.pending("a"), 1);
        buffer.remove("a");
        assert_eq!(buffer.pending("a"), 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_empty_polls_leave_no_mailboxes() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        for i in 0..1000 {
            assert!(buffer.drain(&format!("V{}", i), Duration::ZERO).await.is_empty());
        }
        assert!(buffer.is_empty());

        buffer.push("V1", Signal::answer("V1", "v=0"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain("V1", Duration::ZERO).await.len(), 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_drain_keeps_its_mailbox() {
        let buffer = SignalBuffer::new(DrainOrder::Arrival);
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.drain("viewer", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A second poll timing out must not strand the first one
        assert!(buffer.drain("viewer", Duration::from_millis(10)).await.is_empty());
        assert_eq!(buffer.len(), 1);

        buffer.push("viewer", Signal::answer("viewer", "v=0"));
        let drained = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(buffer.is_empty());
    }
}
