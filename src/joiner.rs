//! The event join engine.
//!
//! One engine serves both joining modes. [`Grouping::PerEvent`] resolves each
//! interaction on its own final signal or TTL; [`Grouping::Episodic`] holds
//! every step until its episode closes and then distributes the episode
//! reward. Everything else (reading, aggregation, adaptation, metrics) is
//! shared, and all state is owned by the calling thread.
//!
//! Examples are queued in the order they resolve, which is not the order
//! their interactions were logged.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{ExampleAdapter, TrainingExample};
use crate::binary_reader::{RecordReader, RecordSource};
use crate::clock::JoinClock;
use crate::config::JoinSettings;
use crate::episode::{CloseReason, EpisodeState, EpisodeStore, Routed};
use crate::errors::{DecodeError, JoinerError, JoinerResult};
use crate::example::{Resolution, ResolvedExample, Reward};
use crate::join_store::{AppendOutcome, InsertOutcome, JoinStore, PendingJoin, StoreStats};
use crate::read_ahead::ReadAheadSource;
use crate::record::{
    Checkpoint, DecisionPayload, EpisodeBoundary, Interaction, LearningMode, Observation,
    ProblemType, Record,
};
use crate::reward::{RewardFunction, TimedReward};
use crate::telemetry::JoinMetrics;

/// Result of one non-blocking pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Ready(TrainingExample),
    /// Nothing resolved yet; the source has no complete record right now.
    Idle,
    /// Finished and fully drained.
    Exhausted,
}

enum Grouping {
    PerEvent,
    Episodic(EpisodeStore),
}

/// Values in effect for examples resolved right now. Checkpoints update the
/// fields that configuration left open.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LoopDefaults {
    reward_function: RewardFunction,
    learning_mode: LearningMode,
    default_reward: f32,
}

impl LoopDefaults {
    fn from_settings(settings: &JoinSettings) -> Self {
        Self {
            reward_function: settings.reward_function.unwrap_or(RewardFunction::Earliest),
            learning_mode: settings.learning_mode.unwrap_or(LearningMode::Online),
            default_reward: settings.default_reward.unwrap_or(0.0),
        }
    }
}

pub struct JoinEngine<S> {
    source: S,
    settings: JoinSettings,
    store: JoinStore,
    grouping: Grouping,
    clock: JoinClock,
    adapter: ExampleAdapter,
    defaults: LoopDefaults,
    ready: VecDeque<TrainingExample>,
    metrics: JoinMetrics,
    failure: Option<JoinerError>,
    source_done: bool,
    flushed: bool,
    aborted: bool,
}

/// Record source over a log file, decoding on a background thread when
/// `read_ahead` is set.
pub fn open_source(path: &Path, settings: &JoinSettings) -> JoinerResult<Box<dyn RecordSource>> {
    let file =
        File::open(path).map_err(|e| JoinerError::io(format!("opening {}", path.display()), e))?;
    let reader = RecordReader::with_max_frame_len(BufReader::new(file), settings.max_frame_len);

    info!(
        path = %path.display(),
        problem_type = %settings.problem_type,
        multistep = settings.multistep,
        read_ahead = settings.read_ahead,
        "opened binary log"
    );

    if settings.read_ahead > 0 {
        Ok(Box::new(ReadAheadSource::spawn(reader, settings.read_ahead)))
    } else {
        Ok(Box::new(reader))
    }
}

impl JoinEngine<Box<dyn RecordSource>> {
    pub fn open(path: &Path, settings: JoinSettings) -> JoinerResult<Self> {
        let source = open_source(path, &settings)?;
        Ok(Self::new(source, settings))
    }
}

impl<S: RecordSource> JoinEngine<S> {
    pub fn new(source: S, settings: JoinSettings) -> Self {
        let grouping = if settings.multistep {
            Grouping::Episodic(EpisodeStore::new(settings.resolved_memory))
        } else {
            Grouping::PerEvent
        };

        Self {
            source,
            store: JoinStore::new(settings.orphan_grace, settings.resolved_memory),
            grouping,
            clock: JoinClock::new(settings.clock),
            adapter: ExampleAdapter::for_problem(settings.problem_type),
            defaults: LoopDefaults::from_settings(&settings),
            settings,
            ready: VecDeque::new(),
            metrics: JoinMetrics::default(),
            failure: None,
            source_done: false,
            flushed: false,
            aborted: false,
        }
    }

    pub fn metrics(&self) -> &JoinMetrics {
        &self.metrics
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn settings(&self) -> &JoinSettings {
        &self.settings
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Open episodes; always zero in per-event mode.
    pub fn open_episodes(&self) -> usize {
        match &self.grouping {
            Grouping::PerEvent => 0,
            Grouping::Episodic(episodes) => episodes.len(),
        }
    }

    /// Next resolved example, reading the source to its end.
    ///
    /// A truncated trailing frame counts as the end. Once the source is
    /// exhausted every pending join is flushed. A stream-fatal error is
    /// returned after the examples that resolved before it, and the engine
    /// yields `Ok(None)` from then on.
    pub fn next_example(&mut self) -> JoinerResult<Option<TrainingExample>> {
        loop {
            if let Some(example) = self.ready.pop_front() {
                return Ok(Some(example));
            }
            if let Some(err) = self.failure.take() {
                self.aborted = true;
                return Err(err);
            }
            if self.aborted || self.flushed {
                return Ok(None);
            }
            if self.source_done {
                self.flush();
                continue;
            }

            match self.source.next_record() {
                Ok(Some(record)) => self.process(record),
                Ok(None) => self.source_done = true,
                Err(DecodeError::Truncated { needed, available }) => {
                    warn!(needed, available, "truncated trailing frame treated as end of log");
                    self.metrics.truncated_tail = true;
                    self.source_done = true;
                }
                Err(err) => self.fail(err),
            }
        }
    }

    /// Next resolved example without waiting for the source to end.
    ///
    /// For a log that is still being written: running out of complete records
    /// gives [`Pull::Idle`] and nothing is flushed. Call [`Self::finish`] when
    /// no more records will arrive.
    pub fn poll_example(&mut self) -> JoinerResult<Pull> {
        loop {
            if let Some(example) = self.ready.pop_front() {
                return Ok(Pull::Ready(example));
            }
            if let Some(err) = self.failure.take() {
                self.aborted = true;
                return Err(err);
            }
            if self.aborted || self.flushed {
                return Ok(Pull::Exhausted);
            }

            match self.source.next_record() {
                Ok(Some(record)) => self.process(record),
                Ok(None) | Err(DecodeError::Truncated { .. }) => {
                    if let Some(now) = self.clock.now() {
                        self.expire(now);
                    }
                    return Ok(match self.ready.pop_front() {
                        Some(example) => Pull::Ready(example),
                        None => Pull::Idle,
                    });
                }
                Err(err) => self.fail(err),
            }
        }
    }

    /// Stop reading and resolve everything still pending.
    pub fn finish(&mut self) {
        self.source_done = true;
        if !self.flushed && !self.aborted && self.failure.is_none() {
            self.flush();
        }
    }

    fn fail(&mut self, err: DecodeError) {
        error!(
            error = %err,
            pending = self.store.len(),
            "log is unreadable, abandoning pending joins"
        );
        self.source_done = true;
        self.failure = Some(err.into());
    }

    fn process(&mut self, record: Record) {
        self.metrics.records_read += 1;
        self.clock.observe(record.timestamp());

        // Deadlines that passed before this record resolve ahead of it.
        if let Some(now) = self.clock.now() {
            self.expire(now);
        }

        match record {
            Record::Checkpoint(checkpoint) => self.apply_checkpoint(checkpoint),
            Record::Interaction(interaction) => self.on_interaction(interaction),
            Record::Observation(observation) => self.on_observation(observation),
            Record::EpisodeBoundary(boundary) => self.on_boundary(boundary),
        }

        if let Some(now) = self.clock.now() {
            self.expire(now);
        }
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.metrics.checkpoints += 1;

        if let Some(declared) = checkpoint.problem_type {
            if declared != self.settings.problem_type {
                self.metrics.checkpoint_conflicts += 1;
                warn!(
                    declared = %declared,
                    configured = %self.settings.problem_type,
                    "checkpoint problem type ignored"
                );
            }
        }

        if self.settings.reward_function.is_none() {
            if let Some(function) = checkpoint.reward_function {
                self.defaults.reward_function = function;
            }
        }
        if self.settings.learning_mode.is_none() {
            if let Some(mode) = checkpoint.learning_mode {
                self.defaults.learning_mode = mode;
            }
        }
        if self.settings.default_reward.is_none() {
            match checkpoint.default_reward {
                Some(value) if value.is_finite() => self.defaults.default_reward = value,
                Some(value) => warn!(value, "checkpoint default reward is not finite"),
                None => {}
            }
        }

        debug!(
            reward_function = %self.defaults.reward_function,
            learning_mode = %self.defaults.learning_mode,
            default_reward = self.defaults.default_reward,
            "checkpoint applied"
        );
    }

    fn on_interaction(&mut self, interaction: Interaction) {
        self.metrics.interactions += 1;

        if let Err(err) = self.adapter.check(&interaction.payload) {
            self.metrics.malformed_interactions += 1;
            warn!(event_id = %interaction.event_id, error = %err, "interaction discarded");
            return;
        }

        let event_id = interaction.event_id.clone();
        let episode_key = interaction
            .episode_id
            .clone()
            .unwrap_or_else(|| event_id.clone());
        let created_at = self.clock.stamp(interaction.timestamp);

        match self.store.insert_interaction(interaction, created_at) {
            InsertOutcome::Duplicate => {
                self.metrics.duplicate_interactions += 1;
                warn!(event_id = %event_id, "duplicate interaction discarded");
                return;
            }
            InsertOutcome::Inserted { adopted } => {
                self.metrics.orphans_adopted += adopted as u64;
                if adopted > 0 {
                    debug!(event_id = %event_id, adopted, "adopted early observations");
                }
            }
        }

        let Grouping::Episodic(episodes) = &mut self.grouping else {
            self.resolve_if_final(&event_id);
            return;
        };

        if !episodes.contains(&episode_key) && episodes.was_closed(&episode_key) {
            self.metrics.episodes_reopened += 1;
            warn!(episode_id = %episode_key, "interaction reopened a closed episode");
        }
        if episodes.add_step(&episode_key, &event_id, created_at) {
            trace!(episode_id = %episode_key, "episode opened");
        }
        for observation in episodes.release_held(&episode_key) {
            self.store.append_observation(observation, created_at);
        }

        if episode_key != event_id {
            let early = self.store.take_orphans(&episode_key, created_at);
            self.metrics.orphans_adopted += early.len() as u64;
            for observation in early {
                self.route_to_episode(observation, created_at);
            }
        } else {
            self.close_singleton_if_final(&event_id);
        }
    }

    fn on_observation(&mut self, observation: Observation) {
        self.metrics.observations += 1;
        let now = self.clock.stamp(observation.timestamp);
        let event_id = observation.event_id.clone();

        let Grouping::Episodic(episodes) = &mut self.grouping else {
            match self.store.append_observation(observation, now) {
                AppendOutcome::Found => self.resolve_if_final(&event_id),
                AppendOutcome::Orphaned => trace!(event_id = %event_id, "observation buffered as orphan"),
                AppendOutcome::Late => self.late(&event_id),
            }
            return;
        };

        if self.store.contains(&event_id) {
            self.store.append_observation(observation, now);
            let owner = episodes.owner_of(&event_id).map(str::to_string);
            if let Some(owner) = owner {
                episodes.touch(&owner, now);
                if owner == event_id {
                    self.close_singleton_if_final(&event_id);
                }
            }
        } else if episodes.contains(&event_id) {
            self.route_to_episode(observation, now);
        } else if self.store.was_resolved(&event_id) || episodes.was_closed(&event_id) {
            self.late(&event_id);
        } else {
            self.store.buffer_orphan(observation, now);
            trace!(key = %event_id, "observation buffered as orphan");
        }
    }

    fn on_boundary(&mut self, boundary: EpisodeBoundary) {
        self.metrics.episode_boundaries += 1;

        let Grouping::Episodic(episodes) = &mut self.grouping else {
            trace!(episode_id = %boundary.episode_id, "episode boundary ignored outside multistep mode");
            return;
        };

        match episodes.close(&boundary.episode_id) {
            Some(episode) => self.emit_episode(episode, Resolution::EpisodeClosed),
            None => {
                self.metrics.unknown_boundaries += 1;
                debug!(episode_id = %boundary.episode_id, "boundary for unknown episode");
            }
        }
    }

    fn late(&mut self, event_id: &str) {
        self.metrics.late_observations += 1;
        debug!(event_id, "observation arrived after its join resolved");
    }

    /// Attach an observation addressed to an episode, or to one of its steps by index.
    fn route_to_episode(&mut self, observation: Observation, now: DateTime<Utc>) {
        let Grouping::Episodic(episodes) = &mut self.grouping else {
            return;
        };

        match episodes.route(observation, now) {
            Routed::Step(observation) => {
                self.store.append_observation(observation, now);
            }
            Routed::Episode => {}
            Routed::Held => trace!("step observation held until its step arrives"),
            Routed::Unknown(observation) => self.store.buffer_orphan(observation, now),
        }
    }

    fn resolve_if_final(&mut self, event_id: &str) {
        if let Some(entry) = self.store.take_if_resolvable(event_id) {
            self.emit_join(entry, Resolution::Signaled);
        }
    }

    /// A standalone interaction in multistep mode behaves like a per-event join.
    fn close_singleton_if_final(&mut self, event_id: &str) {
        let Grouping::Episodic(episodes) = &mut self.grouping else {
            return;
        };
        let is_final = self.store.get(event_id).is_some_and(|entry| entry.final_signal);
        let singleton = episodes
            .get(event_id)
            .is_some_and(|episode| episode.members.len() == 1);

        if is_final && singleton {
            if let Some(episode) = episodes.close(event_id) {
                self.emit_episode(episode, Resolution::Signaled);
            }
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let dropped = self.store.expire_orphans(now);
        if dropped > 0 {
            self.metrics.orphans_expired += dropped as u64;
            debug!(dropped, "orphan observations expired unmatched");
        }

        match &mut self.grouping {
            Grouping::PerEvent => {
                for entry in self.store.evict_expired(now, self.settings.ttl) {
                    self.emit_join(entry, Resolution::Expired);
                }
            }
            Grouping::Episodic(episodes) => {
                let closed = episodes.expire(now, self.settings.ttl, self.settings.episode_max_age);
                for (episode, reason) in closed {
                    let standalone = episode.members.len() == 1 && episode.members[0] == episode.episode_id;
                    if reason.is_forced() && !standalone {
                        self.metrics.episodes_forced_closed += 1;
                        warn!(
                            episode_id = %episode.episode_id,
                            steps = episode.members.len(),
                            reason = ?reason,
                            "episode closed without a boundary"
                        );
                    }
                    self.emit_episode(episode, Resolution::Expired);
                }
            }
        }
    }

    fn flush(&mut self) {
        self.flushed = true;

        match &mut self.grouping {
            Grouping::PerEvent => {
                for entry in self.store.drain_all() {
                    self.emit_join(entry, Resolution::EndOfStream);
                }
            }
            Grouping::Episodic(episodes) => {
                for episode in episodes.drain_all() {
                    trace!(episode_id = %episode.episode_id, reason = ?CloseReason::EndOfStream, "episode closed");
                    self.emit_episode(episode, Resolution::EndOfStream);
                }
            }
        }

        let unmatched = self.store.orphan_observations();
        self.metrics.orphans_expired += unmatched as u64;
        self.metrics.log_summary();
    }

    fn emit_episode(&mut self, episode: EpisodeState, resolution: Resolution) {
        if !episode.awaiting_step.is_empty() {
            self.metrics.malformed_observations += episode.awaiting_step.len() as u64;
            debug!(
                episode_id = %episode.episode_id,
                steps = episode.members.len(),
                unmatched = episode.awaiting_step.len(),
                "step index beyond the steps of the closed episode"
            );
        }
        let shared = timed(&episode.observations);

        for member in &episode.members {
            let Some(mut entry) = self.store.remove(member) else {
                continue;
            };

            let own = timed(&entry.observations);
            let values = if own.is_empty() { &shared } else { &own };
            let resolved = self
                .defaults
                .reward_function
                .resolve(values, self.defaults.default_reward);

            entry.observations.extend(episode.observations.iter().cloned());
            self.emit(entry, Reward::Scalar(resolved.value), resolved.defaulted, resolution);
        }
    }

    fn emit_join(&mut self, entry: PendingJoin, resolution: Resolution) {
        let stray = self.unmatched_slot_observations(&entry);
        if stray > 0 {
            self.metrics.malformed_observations += stray as u64;
            debug!(event_id = %entry.event_id(), stray, "observation slot index out of range");
        }
        let (reward, defaulted) = self.resolve_reward(&entry.interaction, &entry.observations);
        self.emit(entry, reward, defaulted, resolution);
    }

    /// Observations on a multi-slot join whose index names no slot.
    fn unmatched_slot_observations(&self, entry: &PendingJoin) -> usize {
        match (&entry.interaction.payload, self.settings.problem_type) {
            (DecisionPayload::Ccb { slots }, ProblemType::Ccb) => entry
                .observations
                .iter()
                .filter(|o| o.index.is_some_and(|i| i as usize >= slots.len()))
                .count(),
            _ => 0,
        }
    }

    /// CCB joins get one reward per slot; un-indexed observations count for slot 0.
    fn resolve_reward(&self, interaction: &Interaction, observations: &[Observation]) -> (Reward, bool) {
        let function = self.defaults.reward_function;
        let default_reward = self.defaults.default_reward;

        match (&interaction.payload, self.settings.problem_type) {
            (DecisionPayload::Ccb { slots }, ProblemType::Ccb) => {
                let mut defaulted = true;
                let rewards = (0..slots.len())
                    .map(|slot| {
                        let values: Vec<TimedReward> = observations
                            .iter()
                            .filter(|o| o.index.unwrap_or(0) as usize == slot)
                            .filter_map(|o| o.reward_value().map(|v| TimedReward::new(o.timestamp, v)))
                            .collect();
                        let resolved = function.resolve(&values, default_reward);
                        defaulted &= resolved.defaulted;
                        resolved.value
                    })
                    .collect();
                (Reward::PerSlot(rewards), defaulted)
            }
            _ => {
                let resolved = function.resolve(&timed(observations), default_reward);
                (Reward::Scalar(resolved.value), resolved.defaulted)
            }
        }
    }

    fn emit(&mut self, entry: PendingJoin, reward: Reward, defaulted: bool, resolution: Resolution) {
        let resolved_at = self.clock.now().unwrap_or(entry.created_at);
        let resolved = ResolvedExample {
            interaction: entry.interaction,
            observations: entry.observations,
            reward,
            defaulted,
            default_reward: self.defaults.default_reward,
            problem_type: self.settings.problem_type,
            learning_mode: self.defaults.learning_mode,
            resolution,
            resolved_at,
        };

        let event_id = resolved.event_id().to_string();
        match self.adapter.adapt(resolved) {
            Ok(example) => {
                self.metrics.examples_emitted += 1;
                if defaulted {
                    self.metrics.defaulted_rewards += 1;
                }
                match resolution {
                    Resolution::Signaled => self.metrics.resolved_signaled += 1,
                    Resolution::Expired => self.metrics.resolved_expired += 1,
                    Resolution::EndOfStream => self.metrics.resolved_end_of_stream += 1,
                    Resolution::EpisodeClosed => self.metrics.resolved_episode_closed += 1,
                }
                trace!(event_id = %event_id, ?resolution, defaulted, "example resolved");
                self.ready.push_back(example);
            }
            Err(err) => {
                self.metrics.malformed_interactions += 1;
                warn!(event_id = %event_id, error = %err, "resolved join could not be adapted");
            }
        }
    }
}

impl<S: RecordSource> Iterator for JoinEngine<S> {
    type Item = JoinerResult<TrainingExample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_example().transpose()
    }
}

fn timed(observations: &[Observation]) -> Vec<TimedReward> {
    observations
        .iter()
        .filter_map(|o| o.reward_value().map(|v| TimedReward::new(o.timestamp, v)))
        .collect()
}
