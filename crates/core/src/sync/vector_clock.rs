//! Vector clocks for causal ordering of operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockOrdering {
    Equal,
    LessThan,
    GreaterThan,
    Concurrent,
}

/// Per-client monotone counter vector. A missing component reads as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Component for a client, 0 if absent.
    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client_id: impl Into<String>, value: u64) {
        self.0.insert(client_id.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Advance this client's component by one.
    pub fn increment(&mut self, client_id: &str) {
        let entry = self.0.entry(client_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    /// Component-wise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client_id, &value) in &other.0 {
            let entry = self.0.entry(client_id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Merged copy of two clocks.
    pub fn merged(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Merge, then advance this client's component by one.
    pub fn merged_and_incremented(&self, other: &VectorClock, client_id: &str) -> VectorClock {
        let mut out = VectorClock::merged(self, other);
        out.increment(client_id);
        out
    }

    /// Compare two clocks over the union of their keys.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for client_id in self.0.keys().chain(other.0.keys()) {
            let a = self.get(client_id);
            let b = other.get(client_id);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::GreaterThan,
            (false, true) => ClockOrdering::LessThan,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when this clock dominates or equals the other.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::GreaterThan | ClockOrdering::Equal
        )
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (client_id, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", client_id, value)?;
        }
        write!(f, "}}")
    }
}
