//! Vector clocks: one counter per device, partially ordering operation
//! histories across replicas.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClockRelation {
    Before,
    After,
    Concurrent,
    Equal,
}

/// A mapping from device-id-hex to a monotonically increasing counter.
///
/// Backed by a `BTreeMap` so iteration is already device-id-ascending,
/// which is both the canonical JSON key order and the basis of
/// [`VectorClock::sort_key`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock {
            counters: BTreeMap::new(),
        }
    }

    pub fn with_device(device_id: impl Into<String>, value: u64) -> Self {
        let mut vc = VectorClock::new();
        vc.counters.insert(device_id.into(), value);
        vc
    }

    pub fn get(&self, device_id: &str) -> u64 {
        *self.counters.get(device_id).unwrap_or(&0)
    }

    pub fn set(&mut self, device_id: &str, value: u64) {
        self.counters.insert(device_id.to_string(), value);
    }

    /// Advances `device_id`'s counter by one, in place.
    pub fn increment(&mut self, device_id: &str) {
        let next = self.get(device_id) + 1;
        self.set(device_id, next);
    }

    /// Elementwise max of two clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (device_id, &count) in &other.counters {
            let current = merged.get(device_id);
            if count > current {
                merged.set(device_id, count);
            }
        }
        merged
    }

    pub fn merge_in_place(&mut self, other: &VectorClock) {
        *self = self.merge(other);
    }

    /// Compares `self` against `other` over the union of both devices.
    pub fn compare(&self, other: &VectorClock) -> VectorClockRelation {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut devices: Vec<&String> = self.counters.keys().chain(other.counters.keys()).collect();
        devices.sort();
        devices.dedup();

        for device_id in devices {
            let a = self.get(device_id);
            let b = other.get(device_id);
            match a.cmp(&b) {
                Ordering::Greater => self_greater = true,
                Ordering::Less => other_greater = true,
                Ordering::Equal => {}
            }
            if self_greater && other_greater {
                return VectorClockRelation::Concurrent;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => VectorClockRelation::Equal,
            (true, false) => VectorClockRelation::After,
            (false, true) => VectorClockRelation::Before,
            (true, true) => VectorClockRelation::Concurrent,
        }
    }

    /// `self >= other` over every device (missing entries read as zero).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            VectorClockRelation::After | VectorClockRelation::Equal
        )
    }

    pub fn is_dominated_by(&self, other: &VectorClock) -> bool {
        other.dominates(self)
    }

    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), VectorClockRelation::Concurrent)
    }

    /// A tuple of `(device_id, counter)` pairs ordered by device-id-ascending,
    /// the basis of the import pipeline's deterministic replay order.
    pub fn sort_key(&self) -> Vec<(String, u64)> {
        self.counters
            .iter()
            .map(|(k, &v)| (k.clone(), v))
            .collect()
    }

    /// Canonical JSON serialization: keys sorted, `"{}"` when empty.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.counters)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let counters: BTreeMap<String, u64> = serde_json::from_str(json)?;
        Ok(VectorClock { counters })
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = &String> {
        self.counters.keys()
    }

    /// Elementwise minimum across a set of clocks, missing entries reading
    /// as zero. Used by log compaction to find the point every peer has
    /// acknowledged: an empty slice has no peers to ask, so the minimum is
    /// undefined and compaction should not proceed.
    pub fn elementwise_min(clocks: &[VectorClock]) -> Option<VectorClock> {
        if clocks.is_empty() {
            return None;
        }
        let mut devices: Vec<&String> = clocks.iter().flat_map(|c| c.counters.keys()).collect();
        devices.sort();
        devices.dedup();

        let mut floor = VectorClock::new();
        for device_id in devices {
            let min = clocks.iter().map(|c| c.get(device_id)).min().unwrap_or(0);
            if min > 0 {
                floor.set(device_id, min);
            }
        }
        Some(floor)
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        write!(f, "}}")
    }
}
