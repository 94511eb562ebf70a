//! Conflating cell channel for small values.
//!
//! The heavyweight frame exchange in [`crate::ring`] moves whole frames; this
//! is its little sibling for derived values (frame statistics, motion
//! reports). One producer, any number of consumers, and only the latest
//! value is retained: `send` never blocks behind a slow consumer and `recv`
//! never waits for a new value, it just returns the most recent one.
//!
//! Two slots are kept so the producer always writes the slot consumers are
//! *not* being directed at, then flips the published index. A consumer
//! therefore always reads a fully written value.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

struct Channel<T> {
    slots: [RwLock<T>; 2],
    published: AtomicU8,
    sender_dropped: AtomicBool,
    num_receivers: AtomicUsize,
}

/// The producing half. Not `Clone`: one producer per channel.
pub struct Sender<T> {
    chan: Arc<Channel<T>>,
    /// Slot the next value will be written into; alternates on every send.
    next: u8,
}

/// The consuming half. Cheap to clone; every clone observes the same latest
/// value.
pub struct Receiver<T> {
    chan: Arc<Channel<T>>,
}

/// Creates a conflating channel seeded with `T::default()`.
pub fn channel<T: Clone + Default>() -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Channel {
        slots: [RwLock::new(T::default()), RwLock::new(T::default())],
        published: AtomicU8::new(0),
        sender_dropped: AtomicBool::new(false),
        num_receivers: AtomicUsize::new(1),
    });

    (
        Sender {
            chan: chan.clone(),
            next: 0,
        },
        Receiver { chan },
    )
}

impl<T: Clone + Default> Sender<T> {
    /// Publishes a value, overwriting whatever the consumers have not read
    /// yet, and returns the number of live receivers.
    ///
    /// A return value of 0 tells the producer the subscription is dead and
    /// the sender can be dropped. Feed workers use this to garbage-collect
    /// their sender lists.
    pub fn send(&mut self, value: T) -> usize {
        {
            let mut slot = self.chan.slots[self.next as usize].write();
            *slot = value;
        }
        self.chan.published.store(self.next, Ordering::Release);
        self.next = (self.next + 1) % 2;
        self.chan.num_receivers.load(Ordering::Acquire)
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.chan.sender_dropped.store(true, Ordering::Release);
    }
}

impl<T: Clone + Default> Receiver<T> {
    /// Returns a clone of the latest published value, or `None` once the
    /// sender has been dropped.
    ///
    /// Before the first send this is `T::default()`.
    pub fn recv(&self) -> Option<T> {
        if self.chan.sender_dropped.load(Ordering::Acquire) {
            return None;
        }
        let published = self.chan.published.load(Ordering::Acquire);
        let slot = self.chan.slots[published as usize].read();
        Some(slot.clone())
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.num_receivers.fetch_add(1, Ordering::AcqRel);
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.chan.num_receivers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Clone + Default> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_before_send_returns_default() {
        let (_tx, rx) = channel::<u64>();
        assert_eq!(rx.recv(), Some(0));
    }

    #[test]
    fn recv_returns_latest_value() {
        let (mut tx, rx) = channel::<u64>();
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv(), Some(3));
        // Conflation: the intermediate values are gone for good.
        assert_eq!(rx.recv(), Some(3));
    }

    #[test]
    fn send_reports_receiver_count() {
        let (mut tx, rx) = channel::<u64>();
        assert_eq!(tx.send(1), 1);

        let rx2 = rx.clone();
        assert_eq!(tx.send(2), 2);

        drop(rx2);
        assert_eq!(tx.send(3), 1);

        drop(rx);
        assert_eq!(tx.send(4), 0);
    }

    #[test]
    fn recv_after_sender_drop_returns_none() {
        let (tx, rx) = channel::<u64>();
        drop(tx);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn cloned_receivers_see_the_same_value() {
        let (mut tx, rx) = channel::<&'static str>();
        let rx2 = rx.clone();
        tx.send("latest");
        assert_eq!(rx.recv(), Some("latest"));
        assert_eq!(rx2.recv(), Some("latest"));
    }

    #[test]
    fn iterator_yields_until_sender_drops() {
        let (mut tx, mut rx) = channel::<u64>();
        tx.send(5);
        assert_eq!(rx.next(), Some(5));
        drop(tx);
        assert_eq!(rx.next(), None);
    }
}
