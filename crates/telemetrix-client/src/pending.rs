//! Pending Reply Slots.
//!
//! A query that expects an identifiable reply reserves the slot for that
//! reply kind before sending, then waits on it. At most one reservation per
//! kind exists at a time; a second request fails with `Busy`.
//!
//! A slot ends in exactly one of four ways:
//!
//! - the read loop fulfills it with the matching report
//! - the waiter times out
//! - the waiter is cancelled (its future is dropped)
//! - the link is lost and every slot is failed with `TransportLost`
//!
//! The waiter's [`PendingReply`] removes its own slot on drop, guarded by a
//! ticket, so an expired or cancelled wait never leaves a slot behind for a
//! later report to complete.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use telemetrix_core::{Error, Result, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Reply kinds that support request/response style queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    FirmwareVersion,
    IAmHere,
}

impl ReplyKind {
    /// Human-readable name used in errors.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::FirmwareVersion => "firmware version",
            Self::IAmHere => "I-am-here reply",
        }
    }
}

#[derive(Debug)]
struct Slot {
    ticket: u64,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Slots {
    open: HashMap<ReplyKind, Slot>,
    next_ticket: u64,
    closed: Option<String>,
}

#[derive(Debug, Default)]
pub struct PendingReplies {
    slots: Mutex<Slots>,
}

impl PendingReplies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for `kind`.
    ///
    /// # Errors
    ///
    /// - `Busy` if a request of this kind is already outstanding
    /// - `TransportLost` once the link has been lost or closed
    pub fn reserve(&self, kind: ReplyKind) -> Result<PendingReply<'_>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &slots.closed {
            return Err(Error::TransportLost(reason.clone()));
        }
        if slots.open.contains_key(&kind) {
            return Err(Error::Busy(kind.describe()));
        }

        slots.next_ticket += 1;
        let ticket = slots.next_ticket;
        let (tx, rx) = oneshot::channel();
        slots.open.insert(kind, Slot { ticket, tx });
        trace!(?kind, ticket, "Reserved reply slot");

        Ok(PendingReply {
            owner: self,
            kind,
            ticket,
            rx,
        })
    }

    /// Complete the outstanding request for `kind`, if any.
    ///
    /// Returns `false` when nobody is waiting, e.g. for a reply that arrives
    /// after its caller timed out.
    pub fn fulfill(&self, kind: ReplyKind, value: Value) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .remove(&kind);
        match slot {
            // The waiter may have been dropped between removal and send
            Some(slot) => slot.tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.closed.is_none() {
                slots.closed = Some(reason.to_string());
            }
            slots.open.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "Failing pending replies");
        }
        for slot in drained {
            let _ = slot.tx.send(Err(Error::TransportLost(reason.to_string())));
        }
    }

    /// Returns true if a request of `kind` is outstanding.
    #[must_use]
    pub fn is_outstanding(&self, kind: ReplyKind) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .contains_key(&kind)
    }

    fn release(&self, kind: ReplyKind, ticket: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.open.get(&kind).is_some_and(|slot| slot.ticket == ticket) {
            slots.open.remove(&kind);
            trace!(?kind, ticket, "Released reply slot");
        }
    }
}

/// A reserved slot, waiting for its reply.
#[derive(Debug)]
pub struct PendingReply<'a> {
    owner: &'a PendingReplies,
    kind: ReplyKind,
    ticket: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply<'_> {
    #[must_use]
    pub fn kind(&self) -> ReplyKind {
        self.kind
    }

    /// Wait for the reply.
    ///
    /// # Errors
    ///
    /// - `Timeout` if nothing arrives within `timeout`; the slot is cleared
    /// - `TransportLost` if the link fails while waiting
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransportLost("reply slot dropped".into())),
            Err(_) => Err(Error::Timeout {
                awaiting: self.kind.describe(),
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.owner.release(self.kind, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetrix_core::FirmwareVersion;

    const VERSION: Value = Value::Firmware(FirmwareVersion::new(2, 9));

    #[tokio::test]
    async fn test_fulfill_completes_wait() {
        let pending = PendingReplies::new();
        let reply = pending.reserve(ReplyKind::FirmwareVersion).unwrap();
        assert_eq!(reply.kind(), ReplyKind::FirmwareVersion);

        assert!(pending.fulfill(ReplyKind::FirmwareVersion, VERSION));
        let value = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, VERSION);
        assert!(!pending.is_outstanding(ReplyKind::FirmwareVersion));
    }

    #[test]
    fn test_second_reservation_is_busy() {
        let pending = PendingReplies::new();
        let _first = pending.reserve(ReplyKind::FirmwareVersion).unwrap();

        let second = pending.reserve(ReplyKind::FirmwareVersion);
        assert!(matches!(second, Err(Error::Busy("firmware version"))));

        // Other kinds are independent
        assert!(pending.reserve(ReplyKind::IAmHere).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_slot() {
        let pending = PendingReplies::new();
        let reply = pending.reserve(ReplyKind::FirmwareVersion).unwrap();

        let result = reply.wait(Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(Error::Timeout {
                awaiting: "firmware version",
                duration_ms: 100
            })
        ));
        assert!(!pending.is_outstanding(ReplyKind::FirmwareVersion));

        // A late reply finds nobody waiting
        assert!(!pending.fulfill(ReplyKind::FirmwareVersion, VERSION));
    }

    #[test]
    fn test_drop_releases_slot() {
        let pending = PendingReplies::new();
        let reply = pending.reserve(ReplyKind::IAmHere).unwrap();
        drop(reply);

        assert!(!pending.is_outstanding(ReplyKind::IAmHere));
        assert!(pending.reserve(ReplyKind::IAmHere).is_ok());
    }

    #[test]
    fn test_stale_guard_does_not_release_newer_slot() {
        let pending = PendingReplies::new();
        let first = pending.reserve(ReplyKind::FirmwareVersion).unwrap();
        let first_ticket = first.ticket;
        // Fulfilled and removed, but the waiter has not been dropped yet
        assert!(pending.fulfill(ReplyKind::FirmwareVersion, VERSION));

        let second = pending.reserve(ReplyKind::FirmwareVersion).unwrap();
        assert_ne!(second.ticket, first_ticket);
        drop(first);

        assert!(pending.is_outstanding(ReplyKind::FirmwareVersion));
        drop(second);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingReplies::new();
        let reply = pending.reserve(ReplyKind::FirmwareVersion).unwrap();

        pending.fail_all("transport closed");

        let result = reply.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::TransportLost(reason)) if reason == "transport closed"));
        assert!(matches!(
            pending.reserve(ReplyKind::IAmHere),
            Err(Error::TransportLost(_))
        ));
    }
}
