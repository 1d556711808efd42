//! Episode grouping for multistep joins.
//!
//! An episode owns the ordered identities of its steps and the observations
//! addressed to the episode as a whole. The steps themselves stay in the
//! [`crate::join_store::JoinStore`]; closing an episode is the only way they
//! leave it in multistep mode, so each step is resolved exactly once.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::join_store::RecentIds;
use crate::record::Observation;

/// Where an observation addressed to an episode went.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Addressed to a known step; `event_id` now names that step.
    Step(Observation),
    /// Attached to the whole episode.
    Episode,
    /// Indexed past the steps seen so far; kept until that step arrives.
    Held,
    /// No such open episode.
    Unknown(Observation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Boundary,
    /// No activity for the idle TTL.
    Idle,
    /// Open longer than the episode age limit.
    MaxAge,
    EndOfStream,
}

impl CloseReason {
    pub fn is_forced(&self) -> bool {
        matches!(self, CloseReason::Idle | CloseReason::MaxAge)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeState {
    pub episode_id: String,
    /// Step identities in arrival order.
    pub members: Vec<String>,
    /// Observations addressed to the whole episode.
    pub observations: Vec<Observation>,
    /// Step-indexed observations whose step has not been logged yet.
    pub awaiting_step: Vec<Observation>,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub closed: bool,
    seq: u64,
}

impl EpisodeState {
    /// Identity of the step at `index`, if the episode has that many steps.
    pub fn step(&self, index: u32) -> Option<&str> {
        self.members.get(index as usize).map(String::as_str)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

pub struct EpisodeStore {
    episodes: HashMap<String, EpisodeState>,
    /// Which episode each pending step belongs to.
    step_owner: HashMap<String, String>,
    closed: RecentIds,
    next_seq: u64,
}

impl EpisodeStore {
    pub fn new(closed_capacity: usize) -> Self {
        Self {
            episodes: HashMap::new(),
            step_owner: HashMap::new(),
            closed: RecentIds::new(closed_capacity),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn get(&self, episode_id: &str) -> Option<&EpisodeState> {
        self.episodes.get(episode_id)
    }

    pub fn contains(&self, episode_id: &str) -> bool {
        self.episodes.contains_key(episode_id)
    }

    pub fn was_closed(&self, episode_id: &str) -> bool {
        self.closed.contains(episode_id)
    }

    pub fn owner_of(&self, event_id: &str) -> Option<&str> {
        self.step_owner.get(event_id).map(String::as_str)
    }

    /// Add a step, opening the episode on its first step. Returns true if opened.
    pub fn add_step(&mut self, episode_id: &str, event_id: &str, now: DateTime<Utc>) -> bool {
        self.step_owner
            .insert(event_id.to_string(), episode_id.to_string());

        if let Some(episode) = self.episodes.get_mut(episode_id) {
            episode.members.push(event_id.to_string());
            episode.touch(now);
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.episodes.insert(
            episode_id.to_string(),
            EpisodeState {
                episode_id: episode_id.to_string(),
                members: vec![event_id.to_string()],
                observations: Vec::new(),
                awaiting_step: Vec::new(),
                opened_at: now,
                last_activity: now,
                closed: false,
                seq,
            },
        );
        true
    }

    /// Route an observation keyed by episode id. An indexed observation only
    /// ever reaches the step at that index.
    pub fn route(&mut self, mut observation: Observation, now: DateTime<Utc>) -> Routed {
        let Some(episode) = self.episodes.get_mut(&observation.event_id) else {
            return Routed::Unknown(observation);
        };
        episode.touch(now);

        match observation.index {
            None => {
                episode.observations.push(observation);
                Routed::Episode
            }
            Some(index) => match episode.step(index) {
                Some(step_id) => {
                    observation.event_id = step_id.to_string();
                    Routed::Step(observation)
                }
                None => {
                    episode.awaiting_step.push(observation);
                    Routed::Held
                }
            },
        }
    }

    /// Held observations whose step has now arrived, readdressed to it.
    pub fn release_held(&mut self, episode_id: &str) -> Vec<Observation> {
        let Some(episode) = self.episodes.get_mut(episode_id) else {
            return Vec::new();
        };
        let steps = episode.members.len();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut episode.awaiting_step)
            .into_iter()
            .partition(|o| o.index.is_some_and(|i| (i as usize) < steps));
        episode.awaiting_step = waiting;

        ready
            .into_iter()
            .filter_map(|mut observation| {
                let step_id = episode.step(observation.index?)?;
                observation.event_id = step_id.to_string();
                Some(observation)
            })
            .collect()
    }

    /// Record activity on an episode without attaching anything to it.
    pub fn touch(&mut self, episode_id: &str, now: DateTime<Utc>) {
        if let Some(episode) = self.episodes.get_mut(episode_id) {
            episode.touch(now);
        }
    }

    pub fn close(&mut self, episode_id: &str) -> Option<EpisodeState> {
        let mut episode = self.episodes.remove(episode_id)?;
        for member in &episode.members {
            self.step_owner.remove(member);
        }
        episode.closed = true;
        self.closed.remember(episode_id);
        Some(episode)
    }

    /// Episodes due for forced closure, in the order they were opened.
    pub fn expire(
        &mut self,
        now: DateTime<Utc>,
        idle_ttl: TimeDelta,
        max_age: TimeDelta,
    ) -> Vec<(EpisodeState, CloseReason)> {
        let mut due: Vec<(DateTime<Utc>, u64, String, CloseReason)> = self
            .episodes
            .values()
            .filter_map(|e| {
                let reason = if now - e.opened_at >= max_age {
                    CloseReason::MaxAge
                } else if now - e.last_activity >= idle_ttl {
                    CloseReason::Idle
                } else {
                    return None;
                };
                Some((e.opened_at, e.seq, e.episode_id.clone(), reason))
            })
            .collect();
        due.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        due.into_iter()
            .filter_map(|(_, _, id, reason)| self.close(&id).map(|e| (e, reason)))
            .collect()
    }

    /// Close everything, in the order episodes were opened.
    pub fn drain_all(&mut self) -> Vec<EpisodeState> {
        let mut ids: Vec<(DateTime<Utc>, u64, String)> = self
            .episodes
            .values()
            .map(|e| (e.opened_at, e.seq, e.episode_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|(_, _, id)| self.close(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Outcome;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn episode_reward(episode: &str, at: i64, value: f32) -> Observation {
        Observation {
            event_id: episode.into(),
            timestamp: ts(at),
            index: None,
            outcome: Outcome::Numeric(value),
            is_final: false,
        }
    }

    #[test]
    fn test_steps_are_grouped_in_arrival_order() {
        let mut store = EpisodeStore::new(8);
        assert!(store.add_step("ep", "s1", ts(0)));
        assert!(!store.add_step("ep", "s2", ts(1)));
        assert!(!store.add_step("ep", "s3", ts(2)));

        let episode = store.get("ep").unwrap();
        assert_eq!(episode.members, vec!["s1", "s2", "s3"]);
        assert_eq!(episode.step(1), Some("s2"));
        assert_eq!(episode.step(3), None);
        assert_eq!(store.owner_of("s3"), Some("ep"));
    }

    #[test]
    fn test_unknown_episode_hands_observation_back() {
        let mut store = EpisodeStore::new(8);
        let obs = episode_reward("missing", 0, 1.0);
        assert_eq!(store.route(obs.clone(), ts(0)), Routed::Unknown(obs));
    }

    #[test]
    fn test_close_removes_episode_and_remembers_it() {
        let mut store = EpisodeStore::new(8);
        store.add_step("ep", "s1", ts(0));
        assert_eq!(store.route(episode_reward("ep", 1, 1.0), ts(1)), Routed::Episode);

        let closed = store.close("ep").unwrap();
        assert!(closed.closed);
        assert_eq!(closed.observations.len(), 1);
        assert!(store.is_empty());
        assert!(store.was_closed("ep"));
        assert_eq!(store.owner_of("s1"), None);
        assert!(store.close("ep").is_none());
    }

    #[test]
    fn test_indexed_observation_waits_for_its_step() {
        let mut store = EpisodeStore::new(8);
        store.add_step("ep", "s1", ts(0));

        let early = Observation {
            index: Some(1),
            ..episode_reward("ep", 1, 9.0)
        };
        assert_eq!(store.route(early, ts(1)), Routed::Held);
        assert!(store.get("ep").unwrap().observations.is_empty());
        assert!(store.release_held("ep").is_empty());

        store.add_step("ep", "s2", ts(2));
        let released = store.release_held("ep");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].event_id, "s2");
        assert!(store.get("ep").unwrap().awaiting_step.is_empty());

        let known = Observation {
            index: Some(0),
            ..episode_reward("ep", 3, 1.0)
        };
        match store.route(known, ts(3)) {
            Routed::Step(observation) => assert_eq!(observation.event_id, "s1"),
            other => panic!("unexpected routing {other:?}"),
        }
    }

    #[test]
    fn test_expire_idle_and_max_age() {
        let mut store = EpisodeStore::new(8);
        store.add_step("idle", "a", ts(0));
        store.add_step("busy", "b", ts(0));
        for t in (10..=200).step_by(10) {
            store.touch("busy", ts(t));
        }
        store.add_step("fresh", "c", ts(190));

        let closed = store.expire(ts(200), TimeDelta::milliseconds(100), TimeDelta::milliseconds(150));
        let reasons: Vec<(&str, CloseReason)> = closed
            .iter()
            .map(|(e, r)| (e.episode_id.as_str(), *r))
            .collect();
        assert_eq!(
            reasons,
            vec![("idle", CloseReason::MaxAge), ("busy", CloseReason::MaxAge)]
        );

        let closed = store.expire(ts(300), TimeDelta::milliseconds(100), TimeDelta::seconds(10));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, CloseReason::Idle);
    }
}
