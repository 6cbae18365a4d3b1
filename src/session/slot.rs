//! Pending-operation slots
//!
//! A slot holds the single waiter for one kind of completion, keyed by
//! characteristic handle for reads and writes and by `()` for the
//! session-wide descriptor, MTU and RSSI operations. Occupying a busy slot
//! fails immediately. Each occupant gets a ticket so a waiter that gives up
//! (timeout, cancellation) only ever vacates its own entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::lock;

struct Pending<T> {
    ticket: u64,
    tx: oneshot::Sender<T>,
}

pub(crate) struct PendingSlots<K, T> {
    entries: Mutex<HashMap<K, Pending<T>>>,
    next_ticket: AtomicU64,
}

impl<K: Eq + Hash + Clone, T> PendingSlots<K, T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Claim the slot for `key`, or `None` if an operation is already waiting.
    pub fn occupy(&self, key: K) -> Option<(SlotGuard<'_, K, T>, oneshot::Receiver<T>)> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&key) {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        entries.insert(key.clone(), Pending { ticket, tx });
        let guard = SlotGuard {
            slots: self,
            key,
            ticket,
        };
        Some((guard, rx))
    }

    /// Hand `value` to the waiter on `key`. Returns `false` if nobody was
    /// waiting or the waiter had already gone.
    pub fn resolve(&self, key: &K, value: T) -> bool {
        let pending = lock(&self.entries).remove(key);
        match pending {
            Some(pending) => pending.tx.send(value).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_occupied(&self, key: &K) -> bool {
        lock(&self.entries).contains_key(key)
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn abandon_all(&self) {
        lock(&self.entries).clear();
    }

    fn vacate(&self, key: &K, ticket: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(key).map(|p| p.ticket) == Some(ticket) {
            entries.remove(key);
        }
    }
}

/// Vacates its slot on drop unless a later occupant has taken it over.
pub(crate) struct SlotGuard<'a, K: Eq + Hash + Clone, T> {
    slots: &'a PendingSlots<K, T>,
    key: K,
    ticket: u64,
}

impl<K: Eq + Hash + Clone, T> Drop for SlotGuard<'_, K, T> {
    fn drop(&mut self) {
        self.slots.vacate(&self.key, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_occupant_is_refused() {
        let slots: PendingSlots<u16, u8> = PendingSlots::new();
        let (_guard, rx) = slots.occupy(1).unwrap();
        assert!(slots.occupy(1).is_none());
        assert!(slots.occupy(2).is_some());

        assert!(slots.resolve(&1, 42));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn test_guard_vacates_slot() {
        let slots: PendingSlots<(), u8> = PendingSlots::new();
        {
            let _occupied = slots.occupy(()).unwrap();
            assert!(slots.is_occupied(&()));
        }
        assert!(!slots.is_occupied(&()));
        assert!(!slots.resolve(&(), 1));
    }

    #[test]
    fn test_stale_guard_leaves_new_occupant() {
        let slots: PendingSlots<(), u8> = PendingSlots::new();
        let (first, _rx1) = slots.occupy(()).unwrap();
        slots.resolve(&(), 1);

        let (_second, _rx2) = slots.occupy(()).unwrap();
        drop(first);
        assert!(slots.is_occupied(&()));
    }

    #[tokio::test]
    async fn test_abandon_closes_receivers() {
        let slots: PendingSlots<u16, u8> = PendingSlots::new();
        let (_guard, rx) = slots.occupy(7).unwrap();
        slots.abandon_all();
        assert!(rx.await.is_err());
    }
}
