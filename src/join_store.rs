//! Pending join state, keyed by event identity.
//!
//! Entries live in an owned arena: a slot vector, an identity → slot index and
//! an age index ordered by `(created_at, seq)`. Nothing outside the store holds
//! a reference into it; resolution moves the [`PendingJoin`] out by value.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::record::{Interaction, Observation};

/// An interaction waiting for its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJoin {
    pub interaction: Interaction,
    /// Append-only, in arrival order.
    pub observations: Vec<Observation>,
    pub created_at: DateTime<Utc>,
    pub episode_id: Option<String>,
    /// Insertion sequence; breaks ties between equal `created_at`.
    pub seq: u64,
    /// A final observation arrived.
    pub final_signal: bool,
}

impl PendingJoin {
    pub fn event_id(&self) -> &str {
        &self.interaction.event_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry; `adopted` orphan observations were attached to it.
    Inserted { adopted: usize },
    /// Identity is already pending or was resolved recently. Nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Found,
    /// Not found; buffered until its interaction shows up or the grace period ends.
    Orphaned,
    /// Not found because the identity was already resolved.
    Late,
}

impl AppendOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, AppendOutcome::Found)
    }
}

#[derive(Debug)]
struct OrphanEntry {
    observations: Vec<Observation>,
    first_seen: DateTime<Utc>,
}

/// Snapshot of the store's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub orphan_keys: usize,
    pub remembered_resolved: usize,
    /// Orphan observations discarded after their grace period, since creation.
    pub dropped_orphans: usize,
}

/// Bounded FIFO memory of identities that are no longer pending.
#[derive(Debug, Default)]
pub struct RecentIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn remember(&mut self, id: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.set.insert(id.to_string()) {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

pub struct JoinStore {
    slots: Vec<Option<PendingJoin>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    by_age: BTreeMap<(DateTime<Utc>, u64), usize>,
    orphans: HashMap<String, OrphanEntry>,
    orphan_grace: TimeDelta,
    resolved: RecentIds,
    dropped_orphans: usize,
    next_seq: u64,
}

impl JoinStore {
    pub fn new(orphan_grace: TimeDelta, resolved_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            by_age: BTreeMap::new(),
            orphans: HashMap::new(),
            orphan_grace,
            resolved: RecentIds::new(resolved_capacity),
            dropped_orphans: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.index.contains_key(event_id)
    }

    pub fn was_resolved(&self, event_id: &str) -> bool {
        self.resolved.contains(event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<&PendingJoin> {
        let slot = *self.index.get(event_id)?;
        self.slots[slot].as_ref()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pending: self.index.len(),
            orphan_keys: self.orphans.len(),
            remembered_resolved: self.resolved.len(),
            dropped_orphans: self.dropped_orphans,
        }
    }

    pub fn insert_interaction(
        &mut self,
        interaction: Interaction,
        created_at: DateTime<Utc>,
    ) -> InsertOutcome {
        let event_id = interaction.event_id.clone();
        if self.index.contains_key(&event_id) || self.resolved.contains(&event_id) {
            return InsertOutcome::Duplicate;
        }

        let observations = self.take_orphans(&event_id, created_at);
        let adopted = observations.len();
        let final_signal = observations.iter().any(|o| o.is_final);
        let episode_id = interaction.episode_id.clone();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = PendingJoin {
            interaction,
            observations,
            created_at,
            episode_id,
            seq,
            final_signal,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(event_id, slot);
        self.by_age.insert((created_at, seq), slot);

        InsertOutcome::Inserted { adopted }
    }

    pub fn append_observation(
        &mut self,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> AppendOutcome {
        if let Some(&slot) = self.index.get(&observation.event_id) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.final_signal |= observation.is_final;
                entry.observations.push(observation);
                return AppendOutcome::Found;
            }
        }

        if self.resolved.contains(&observation.event_id) {
            return AppendOutcome::Late;
        }

        self.buffer_orphan(observation, now);
        AppendOutcome::Orphaned
    }

    /// Buffer an observation under its own identity without looking it up.
    pub fn buffer_orphan(&mut self, observation: Observation, now: DateTime<Utc>) {
        self.orphans
            .entry(observation.event_id.clone())
            .or_insert_with(|| OrphanEntry {
                observations: Vec::new(),
                first_seen: now,
            })
            .observations
            .push(observation);
    }

    /// Remove buffered orphans for `key` that are still inside the grace window.
    pub fn take_orphans(&mut self, key: &str, now: DateTime<Utc>) -> Vec<Observation> {
        match self.orphans.remove(key) {
            Some(entry) if now - entry.first_seen <= self.orphan_grace => entry.observations,
            Some(entry) => {
                debug!(
                    key,
                    dropped = entry.observations.len(),
                    "orphan observations outlived grace period"
                );
                self.dropped_orphans += entry.observations.len();
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Drop orphans older than the grace period. Returns how many observations went.
    pub fn expire_orphans(&mut self, now: DateTime<Utc>) -> usize {
        let grace = self.orphan_grace;
        let mut dropped = 0;
        self.orphans.retain(|_, entry| {
            let keep = now - entry.first_seen <= grace;
            if !keep {
                dropped += entry.observations.len();
            }
            keep
        });
        self.dropped_orphans += dropped;
        dropped
    }

    pub fn take_if_resolvable(&mut self, event_id: &str) -> Option<PendingJoin> {
        if self.get(event_id)?.final_signal {
            self.remove(event_id)
        } else {
            None
        }
    }

    /// Move an entry out of the store and remember its identity as resolved.
    pub fn remove(&mut self, event_id: &str) -> Option<PendingJoin> {
        let slot = self.index.remove(event_id)?;
        let entry = self.slots[slot].take()?;
        self.free.push(slot);
        self.by_age.remove(&(entry.created_at, entry.seq));
        self.resolved.remember(event_id);
        Some(entry)
    }

    /// Entries that have been pending for at least `ttl`, oldest first.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> Vec<PendingJoin> {
        let mut expired = Vec::new();
        while let Some((&(created_at, _), &slot)) = self.by_age.first_key_value() {
            if now - created_at < ttl {
                break;
            }
            let event_id = match self.slots[slot].as_ref() {
                Some(entry) => entry.interaction.event_id.clone(),
                None => break,
            };
            if let Some(entry) = self.remove(&event_id) {
                expired.push(entry);
            }
        }
        expired
    }

    /// Remove everything, oldest first.
    pub fn drain_all(&mut self) -> Vec<PendingJoin> {
        let ids: Vec<String> = self
            .by_age
            .values()
            .filter_map(|&slot| self.slots[slot].as_ref())
            .map(|entry| entry.interaction.event_id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Total observations sitting in the orphan buffer.
    pub fn orphan_observations(&self) -> usize {
        self.orphans.values().map(|o| o.observations.len()).sum()
    }
}
