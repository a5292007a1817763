use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-agent logical counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent: &str) -> u64 {
        self.0.get(agent).copied().unwrap_or(0)
    }

    /// Bumps `agent`'s counter and returns the new value.
    pub fn increment(&mut self, agent: &str) -> u64 {
        let counter = self.0.entry(agent.to_owned()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (agent, &time) in &other.0 {
            let entry = self.0.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(time);
        }
    }

    /// Causal order between two clocks, or `None` when they are concurrent.
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;

        for agent in self.0.keys().chain(other.0.keys()) {
            match self.get(agent).cmp(&other.get(agent)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }

        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other).is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(agent, &time)| (agent.as_str(), time))
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(agent, time)| (agent.into(), time)).collect())
    }
}

/// The causal position of one outbound message, as published to the
/// backend's `message_sequences` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageSequence {
    pub message_id: String,
    pub sequence_number: u64,
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}
