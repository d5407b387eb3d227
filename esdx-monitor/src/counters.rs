use std::{borrow::Borrow, error::Error as StdError};

use aya::maps::{MapData, MapError, PerCpuHashMap};
use thiserror::Error;

use esdx_monitor_common::Counter;

#[derive(Debug, Error)]
pub enum LookupError {
    /// The key is no longer in the table. The filter's LRU map evicted it.
    #[error("key not found")]
    NotFound,

    #[error("counter lookup failed: {0}")]
    Failure(#[source] Box<dyn StdError + Send + Sync>),
}

/// Read access to the per-hop traffic totals, keyed by [`crate::hop::Hop::map_key`].
pub trait CounterSource {
    fn read(&self, key: u32) -> Result<Counter, LookupError>;
}

/// The filter's per-CPU `counters` map.
pub struct PerCpuCounterTable<T> {
    map: PerCpuHashMap<T, u32, Counter>,
}

impl<T: Borrow<MapData>> PerCpuCounterTable<T> {
    pub fn new(map: PerCpuHashMap<T, u32, Counter>) -> Self {
        Self { map }
    }
}

impl<T: Borrow<MapData>> CounterSource for PerCpuCounterTable<T> {
    fn read(&self, key: u32) -> Result<Counter, LookupError> {
        match self.map.get(&key, 0) {
            Ok(per_cpu) => Ok(sum_replicas(per_cpu.iter())),
            Err(MapError::KeyNotFound) => Err(LookupError::NotFound),
            Err(err) => Err(LookupError::Failure(Box::new(err))),
        }
    }
}

/// Merges per-CPU replicas into one total.
pub fn sum_replicas<'a, I>(values: I) -> Counter
where
    I: IntoIterator<Item = &'a Counter>,
{
    values.into_iter().fold(Counter::default(), |total, v| Counter {
        bytes: total.bytes.wrapping_add(v.bytes),
        packets: total.packets.wrapping_add(v.packets),
    })
}
