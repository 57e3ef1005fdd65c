use crate::commitlog::Offset;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// ReplicationLedger remembers which replicated batches this node has already accepted, and at
/// which offset. It's what lets flood replication terminate: a node only appends and re-fans-out
/// a batch the first time its replication id shows up.
///
/// Bounded. Once `capacity` ids are tracked, the oldest id that no produce call is still working
/// on is forgotten. Ids in use are never evicted, so the ledger may briefly exceed `capacity`.
pub(crate) struct ReplicationLedger {
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    slots: HashMap<String, Arc<OnceCell<Offset>>>,
    insertion_order: VecDeque<String>,
}

impl ReplicationLedger {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Ledger capacity must be non-zero");

        ReplicationLedger {
            capacity,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Slot for `replication_id`. The slot is initialized with the local offset by whoever appends
    /// the batch first; concurrent arrivals of the same id wait on that append.
    pub(crate) fn slot(&self, replication_id: &str) -> Arc<OnceCell<Offset>> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(slot) = inner.slots.get(replication_id) {
            return slot.clone();
        }

        while inner.insertion_order.len() >= self.capacity {
            if !inner.evict_oldest_idle() {
                break;
            }
        }

        let slot = Arc::new(OnceCell::new());
        inner.slots.insert(replication_id.to_string(), slot.clone());
        inner.insertion_order.push_back(replication_id.to_string());

        slot
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}

impl LedgerInner {
    // A slot is idle when the ledger holds the only reference: no append or fan-out for that id
    // is in flight.
    fn evict_oldest_idle(&mut self) -> bool {
        let slots = &self.slots;
        let idle = self
            .insertion_order
            .iter()
            .position(|id| slots.get(id).map_or(true, |slot| Arc::strong_count(slot) == 1));

        match idle.and_then(|i| self.insertion_order.remove(i)) {
            Some(id) => {
                self.slots.remove(&id);
                true
            }
            None => false,
        }
    }
}

/// A fresh id for a batch that entered the cluster through this node.
pub(crate) fn new_replication_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_shares_a_slot() {
        let ledger = ReplicationLedger::new(4);

        let first = ledger.slot("abc");
        first.set(Offset::new(7)).unwrap();

        assert_eq!(ledger.slot("abc").get(), Some(&Offset::new(7)));
        assert_eq!(ledger.slot("xyz").get(), None);
    }

    #[test]
    fn oldest_id_is_evicted_at_capacity() {
        let ledger = ReplicationLedger::new(2);
        ledger.slot("a").set(Offset::new(0)).unwrap();
        ledger.slot("b").set(Offset::new(1)).unwrap();
        ledger.slot("c").set(Offset::new(2)).unwrap();

        assert_eq!(ledger.len(), 2);
        // "a" was forgotten, so it comes back empty.
        assert_eq!(ledger.slot("a").get(), None);
        assert_eq!(ledger.slot("c").get(), Some(&Offset::new(2)));
    }

    #[test]
    fn in_flight_ids_are_not_evicted() {
        let ledger = ReplicationLedger::new(1);
        let in_flight = ledger.slot("a");

        ledger.slot("b").set(Offset::new(1)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(Arc::ptr_eq(&in_flight, &ledger.slot("a")));

        in_flight.set(Offset::new(0)).unwrap();
        drop(in_flight);
        ledger.slot("c");

        // Both released ids were older than "c" and are gone now.
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.slot("a").get(), None);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = new_replication_id();
        let b = new_replication_id();

        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
