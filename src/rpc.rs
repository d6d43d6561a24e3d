//! Thin RPC layer on top of any [`Transport`]: tags outgoing messages with
//! a monotonically increasing id and a kind, and routes responses back to
//! the call site that is waiting on them.
//!
//! Call/response pairing uses a typed registry of oneshot channels keyed
//! by request id, rather than a `(callback, context)` pair stored in a
//! hash table — the two are equivalent in what they express, but a
//! channel lets the calling thread simply block on `Receiver::recv`
//! instead of installing a callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

/// A message's role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Fire-and-forget, no response expected.
    Message = 0,
    /// Expects exactly one [`MessageKind::Response`] back.
    Call = 1,
    /// Expects zero or more responses over time, until cancelled.
    Subscription = 2,
    /// Carries a call's or subscription's request id back to the
    /// originator.
    Response = 3,
}

impl MessageKind {
    #[inline]
    pub fn from_raw(raw: u8) -> Option<MessageKind> {
        match raw {
            0 => Some(MessageKind::Message),
            1 => Some(MessageKind::Call),
            2 => Some(MessageKind::Subscription),
            3 => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// Monotonically increasing request id, unique for the lifetime of one
/// [`RequestIdAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Hands out [`RequestId`]s in increasing order, starting at 1 (0 is
/// reserved to mean "no request id" for plain `Message` traffic).
#[derive(Default)]
pub struct RequestIdAllocator {
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        RequestIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Routes response payloads back to whichever call site is waiting on a
/// given request id.
///
/// One registration per outstanding call. Subscriptions that expect more
/// than one response re-register after each delivery; this registry does
/// not itself distinguish the two, it just matches one payload to one
/// receiver per `register` call.
#[derive(Default)]
pub struct ResponseRegistry {
    waiters: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        ResponseRegistry {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in the response to `id`, returning the receiving
    /// end of the channel its payload will arrive on.
    pub fn register(&self, id: RequestId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        let mut waiters = self.waiters.lock().unwrap();
        waiters.insert(id.get(), tx);
        rx
    }

    /// Delivers a response payload to whoever registered for `id`.
    /// Returns `false` if nobody was waiting (a late or duplicate
    /// response, or a cancelled call) — not an error, just discarded.
    pub fn complete(&self, id: RequestId, payload: Vec<u8>) -> bool {
        let sender = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.remove(&id.get())
        };
        match sender {
            Some(sender) => sender.send(payload).is_ok(),
            None => false,
        }
    }

    /// Removes a pending registration without delivering anything, e.g.
    /// after a caller gives up waiting.
    pub fn cancel(&self, id: RequestId) {
        self.waiters.lock().unwrap().remove(&id.get());
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_hands_out_increasing_ids_starting_at_one() {
        let alloc = RequestIdAllocator::new();
        assert_eq!(alloc.next().get(), 1);
        assert_eq!(alloc.next().get(), 2);
        assert_eq!(alloc.next().get(), 3);
    }

    #[test]
    fn message_kind_round_trips_through_raw_tag() {
        for kind in [
            MessageKind::Message,
            MessageKind::Call,
            MessageKind::Subscription,
            MessageKind::Response,
        ] {
            assert_eq!(MessageKind::from_raw(kind as u8), Some(kind));
        }
        assert_eq!(MessageKind::from_raw(99), None);
    }

    #[test]
    fn complete_delivers_to_the_registered_receiver() {
        let registry = ResponseRegistry::new();
        let alloc = RequestIdAllocator::new();
        let id = alloc.next();
        let rx = registry.register(id);

        assert!(registry.complete(id, b"pong".to_vec()));
        assert_eq!(rx.recv().unwrap(), b"pong");
    }

    #[test]
    fn complete_on_unknown_id_returns_false() {
        let registry = ResponseRegistry::new();
        assert!(!registry.complete(RequestId(42), vec![]));
    }

    #[test]
    fn cancel_removes_without_delivering() {
        let registry = ResponseRegistry::new();
        let alloc = RequestIdAllocator::new();
        let id = alloc.next();
        let _rx = registry.register(id);
        assert_eq!(registry.pending_count(), 1);
        registry.cancel(id);
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.complete(id, vec![]));
    }
}
