use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::ClientId;

/// Per-client counters establishing causal order between operations.
/// A missing entry is equivalent to a zero counter.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClockOrdering {
    /// Every counter of self is <= other, and at least one is strictly lower
    LessThan,
    GreaterThan,
    Equal,
    Concurrent,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison
    pub fn inverse(self) -> Self {
        match self {
            ClockOrdering::LessThan => ClockOrdering::GreaterThan,
            ClockOrdering::GreaterThan => ClockOrdering::LessThan,
            other => other,
        }
    }
}

impl VectorClock {
    pub fn new() -> Self { Self(BTreeMap::new()) }

    pub fn get(&self, client: &ClientId) -> u64 { self.0.get(client).copied().unwrap_or(0) }

    pub fn set(&mut self, client: ClientId, counter: u64) { self.0.insert(client, counter); }

    pub fn len(&self) -> usize { self.0.len() }

    /// True when no client has a non-zero counter
    pub fn is_empty(&self) -> bool { self.0.values().all(|c| *c == 0) }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> { self.0.iter() }

    /// Bump the counter of `client`. Only ever called with the local client id.
    pub fn increment(&mut self, client: &ClientId) -> u64 {
        let counter = self.0.entry(client.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Returns a copy of this clock with `client` incremented
    pub fn incremented(&self, client: &ClientId) -> Self {
        let mut next = self.clone();
        next.increment(client);
        next
    }

    /// Per-key maximum
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, counter) in other.0.iter() {
            let entry = self.0.entry(client.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn merge_all<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> Self {
        let mut out = VectorClock::new();
        for clock in clocks {
            out.merge(clock);
        }
        out
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for client in self.0.keys().chain(other.0.keys()) {
            let a = self.get(client);
            let b = other.get(client);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::GreaterThan,
            (false, true) => ClockOrdering::LessThan,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when self causally precedes or equals other
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::LessThan | ClockOrdering::Equal)
    }
}

impl fmt::Debug for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (client, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", client, counter)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:?}", self) }
}

impl<C: Into<ClientId>> FromIterator<(C, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (C, u64)>>(iter: T) -> Self { Self(iter.into_iter().map(|(c, n)| (c.into(), n)).collect()) }
}

impl<C: Into<ClientId>, const N: usize> From<[(C, u64); N]> for VectorClock {
    fn from(entries: [(C, u64); N]) -> Self { entries.into_iter().collect() }
}
