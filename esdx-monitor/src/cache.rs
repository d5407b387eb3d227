use std::{collections::HashMap, fmt};

use esdx_monitor_common::Counter;

use crate::{
    counters::{CounterSource, LookupError},
    hop::Hop,
};

/// One line of the bandwidth changelog.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HopChange {
    New(Hop),
    Deleted(Hop),
    Counters { hop: Hop, counter: Counter },
}

impl fmt::Display for HopChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopChange::New(hop) => write!(f, "New hop: {hop}"),
            HopChange::Deleted(hop) => write!(f, "Delete hop: {hop}"),
            HopChange::Counters { hop, counter } => write!(
                f,
                "Hop {hop}: {} bytes, {} packets",
                counter.bytes, counter.packets
            ),
        }
    }
}

/// Hops currently tracked by the monitor with the counters last reported for them.
#[derive(Debug, Default)]
pub struct HopCache {
    hops: HashMap<Hop, Counter>,
}

impl HopCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Sorted copy of all entries.
    pub fn snapshot(&self) -> Vec<(Hop, Counter)> {
        let mut entries: Vec<_> = self.hops.iter().map(|(h, c)| (*h, *c)).collect();
        entries.sort_unstable_by_key(|(hop, _)| *hop);
        entries
    }

    /// Starts (or restarts) tracking `hop` from a zero baseline.
    ///
    /// A hop that is already tracked is reset too. Its true totals live in the
    /// filter's table, so only the diff baseline is lost.
    pub fn discover(&mut self, hop: Hop) -> HopChange {
        self.hops.insert(hop, Counter::default());
        HopChange::New(hop)
    }

    /// Re-reads every tracked hop from `source`.
    ///
    /// Returns counter changes in scan order followed by one deletion per hop
    /// the table no longer holds. Hops whose lookup failed keep their entry.
    pub fn reconcile<S: CounterSource + ?Sized>(&mut self, source: &S) -> Vec<HopChange> {
        let mut changes = Vec::new();
        let mut evicted = Vec::new();

        for (hop, last) in self.hops.iter_mut() {
            let key = hop.map_key();
            match source.read(key) {
                Ok(counter) => {
                    if counter != *last {
                        *last = counter;
                        changes.push(HopChange::Counters { hop: *hop, counter });
                    }
                }
                Err(LookupError::NotFound) => evicted.push(*hop),
                Err(err) => {
                    tracing::warn!(
                        hop = %hop,
                        key = format_args!("{key:#010x}"),
                        error = %err,
                        "error reading counters"
                    );
                }
            }
        }

        evicted.sort_unstable();
        for hop in evicted {
            self.hops.remove(&hop);
            changes.push(HopChange::Deleted(hop));
        }
        changes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{io, sync::Mutex};

    pub(crate) enum Slot {
        Present(Vec<Counter>),
        Broken,
    }

    impl HopCache {
        pub(crate) fn is_empty(&self) -> bool {
            self.hops.is_empty()
        }

        pub(crate) fn get(&self, hop: &Hop) -> Option<Counter> {
            self.hops.get(hop).copied()
        }
    }

    /// In-memory stand-in for the per-CPU counters map.
    #[derive(Default)]
    pub(crate) struct FakeTable {
        slots: Mutex<HashMap<u32, Slot>>,
    }

    impl FakeTable {
        pub(crate) fn set(&self, hop: Hop, bytes: u64, packets: u64) {
            self.slots
                .lock()
                .expect("fake table poisoned")
                .insert(hop.map_key(), Slot::Present(vec![Counter { bytes, packets }]));
        }

        pub(crate) fn set_per_cpu(&self, hop: Hop, per_cpu: Vec<Counter>) {
            self.slots
                .lock()
                .expect("fake table poisoned")
                .insert(hop.map_key(), Slot::Present(per_cpu));
        }

        pub(crate) fn break_key(&self, hop: Hop) {
            self.slots.lock().expect("fake table poisoned").insert(hop.map_key(), Slot::Broken);
        }

        pub(crate) fn evict(&self, hop: Hop) {
            self.slots.lock().expect("fake table poisoned").remove(&hop.map_key());
        }
    }

    impl CounterSource for FakeTable {
        fn read(&self, key: u32) -> Result<Counter, LookupError> {
            match self.slots.lock().expect("fake table poisoned").get(&key) {
                Some(Slot::Present(per_cpu)) => Ok(crate::counters::sum_replicas(per_cpu.iter())),
                Some(Slot::Broken) => Err(LookupError::Failure(Box::new(io::Error::other(
                    "bpf_map_lookup_elem failed",
                )))),
                None => Err(LookupError::NotFound),
            }
        }
    }

    fn counter(bytes: u64, packets: u64) -> Counter {
        Counter { bytes, packets }
    }

    #[test]
    fn discovery_then_tick_reports_new_counters() {
        let hop = Hop::new(1, 2);
        let table = FakeTable::default();
        let mut cache = HopCache::new();

        let change = cache.discover(hop);
        assert_eq!(change.to_string(), "New hop: 1 -> 2");
        assert_eq!(cache.get(&hop), Some(Counter::default()));

        table.set(hop, 100, 1);
        let changes = cache.reconcile(&table);
        assert_eq!(
            changes,
            vec![HopChange::Counters {
                hop,
                counter: counter(100, 1)
            }]
        );
        assert_eq!(changes[0].to_string(), "Hop 1 -> 2: 100 bytes, 1 packets");
        assert_eq!(cache.get(&hop), Some(counter(100, 1)));
    }

    #[test]
    fn unchanged_table_is_reported_once() {
        let hop = Hop::new(3, 4);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);
        table.set(hop, 64, 2);

        assert_eq!(cache.reconcile(&table).len(), 1);
        assert!(cache.reconcile(&table).is_empty());
        assert_eq!(cache.get(&hop), Some(counter(64, 2)));
    }

    #[test]
    fn change_in_either_field_is_reported() {
        let hop = Hop::new(3, 4);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);

        table.set(hop, 64, 2);
        cache.reconcile(&table);
        table.set(hop, 64, 3);
        assert_eq!(cache.reconcile(&table).len(), 1);
        table.set(hop, 65, 3);
        assert_eq!(cache.reconcile(&table).len(), 1);
    }

    #[test]
    fn per_cpu_replicas_are_summed_before_comparison() {
        let hop = Hop::new(5, 6);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);
        table.set_per_cpu(hop, vec![counter(10, 1), counter(20, 2), counter(5, 0)]);

        let changes = cache.reconcile(&table);
        assert_eq!(changes[0].to_string(), "Hop 5 -> 6: 35 bytes, 3 packets");
        assert_eq!(cache.get(&hop), Some(counter(35, 3)));
    }

    #[test]
    fn evicted_hop_is_deleted_exactly_once() {
        let hop = Hop::new(7, 8);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);
        table.set(hop, 10, 1);
        cache.reconcile(&table);

        table.evict(hop);
        let changes = cache.reconcile(&table);
        assert_eq!(changes, vec![HopChange::Deleted(hop)]);
        assert_eq!(changes[0].to_string(), "Delete hop: 7 -> 8");
        assert!(cache.get(&hop).is_none());
        assert!(cache.reconcile(&table).is_empty());
    }

    #[test]
    fn deletions_follow_counter_changes() {
        let kept = Hop::new(1, 2);
        let gone = Hop::new(2, 1);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(kept);
        cache.discover(gone);
        table.set(kept, 1500, 1);

        let changes = cache.reconcile(&table);
        assert_eq!(
            changes,
            vec![
                HopChange::Counters {
                    hop: kept,
                    counter: counter(1500, 1)
                },
                HopChange::Deleted(gone),
            ]
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lookup_failure_keeps_entry_for_retry() {
        let hop = Hop::new(9, 10);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);
        table.set(hop, 10, 1);
        cache.reconcile(&table);

        table.break_key(hop);
        assert!(cache.reconcile(&table).is_empty());
        assert_eq!(cache.get(&hop), Some(counter(10, 1)));

        table.set(hop, 20, 2);
        assert_eq!(
            cache.reconcile(&table),
            vec![HopChange::Counters {
                hop,
                counter: counter(20, 2)
            }]
        );
    }

    #[test]
    fn rediscovery_resets_baseline() {
        let hop = Hop::new(1, 2);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);
        table.set(hop, 100, 1);
        cache.reconcile(&table);

        assert_eq!(cache.discover(hop), HopChange::New(hop));
        assert_eq!(cache.get(&hop), Some(Counter::default()));

        // Same table value is a change again against the zero baseline.
        assert_eq!(cache.reconcile(&table).len(), 1);
    }

    #[test]
    fn hop_discovered_but_never_counted_is_dropped() {
        let hop = Hop::new(11, 12);
        let table = FakeTable::default();
        let mut cache = HopCache::new();
        cache.discover(hop);

        assert_eq!(cache.reconcile(&table), vec![HopChange::Deleted(hop)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_hop() {
        let mut cache = HopCache::new();
        cache.discover(Hop::new(3, 1));
        cache.discover(Hop::new(1, 9));
        cache.discover(Hop::new(1, 2));

        let hops: Vec<_> = cache.snapshot().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hops, vec![Hop::new(1, 2), Hop::new(1, 9), Hop::new(3, 1)]);
    }
}
