//! Hybrid logical clock: a wall-clock timestamp disambiguated by a logical
//! counter and the owning node's id, giving a total order that stays close
//! to physical time but never goes backwards.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Result, SyncError};

/// A single point on the hybrid logical clock: `(wall_ms, counter, node_id)`,
/// totally ordered lexicographically on that triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hlc {
    pub wall_ms: u64,
    pub counter: u32,
    pub node_id: String,
}

impl Hlc {
    pub fn new(wall_ms: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Hlc {
            wall_ms,
            counter,
            node_id: node_id.into(),
        }
    }

    /// Wire format: `"{wall_ms}:{counter}:{node_id}"`.
    pub fn pack(&self) -> String {
        format!("{}:{}:{}", self.wall_ms, self.counter, self.node_id)
    }

    pub fn unpack(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let wall_ms = parts
            .next()
            .ok_or_else(|| SyncError::Encoding("missing HLC wall_ms field".to_string()))?
            .parse::<u64>()
            .map_err(|e| SyncError::Encoding(format!("invalid HLC wall_ms: {e}")))?;
        let counter = parts
            .next()
            .ok_or_else(|| SyncError::Encoding("missing HLC counter field".to_string()))?
            .parse::<u32>()
            .map_err(|e| SyncError::Encoding(format!("invalid HLC counter: {e}")))?;
        let node_id = parts
            .next()
            .ok_or_else(|| SyncError::Encoding("missing HLC node_id field".to_string()))?
            .to_string();
        Ok(Hlc {
            wall_ms,
            counter,
            node_id,
        })
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pack())
    }
}

fn physical_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A per-replica hybrid logical clock. Guarded by a mutex so `now()`/`update()`
/// can be called from any thread without the caller coordinating access.
pub struct HlClock {
    node_id: String,
    last: Mutex<Hlc>,
}

impl HlClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let last = Hlc::new(0, 0, node_id.clone());
        HlClock {
            node_id,
            last: Mutex::new(last),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the most recently issued HLC without advancing the clock.
    pub fn current(&self) -> Hlc {
        self.last.lock().clone()
    }

    /// Produces a fresh HLC strictly greater than every previously returned
    /// value from this clock.
    pub fn now(&self) -> Hlc {
        let physical = physical_now_ms();
        let mut last = self.last.lock();

        let next = if physical > last.wall_ms {
            Hlc::new(physical, 0, self.node_id.clone())
        } else {
            Hlc::new(last.wall_ms, last.counter + 1, self.node_id.clone())
        };

        *last = next.clone();
        next
    }

    /// Absorbs a remote HLC observation, returning a fresh local HLC
    /// strictly greater than both the local state and `remote`.
    pub fn update(&self, remote: &Hlc) -> Hlc {
        let physical = physical_now_ms();
        let mut last = self.last.lock();

        let new_wall = physical.max(last.wall_ms).max(remote.wall_ms);

        let next = if new_wall == last.wall_ms && new_wall == remote.wall_ms {
            Hlc::new(new_wall, last.counter.max(remote.counter) + 1, self.node_id.clone())
        } else if new_wall == last.wall_ms {
            Hlc::new(new_wall, last.counter + 1, self.node_id.clone())
        } else if new_wall == remote.wall_ms {
            Hlc::new(new_wall, remote.counter + 1, self.node_id.clone())
        } else {
            Hlc::new(new_wall, 0, self.node_id.clone())
        };

        *last = next.clone();
        next
    }
}
