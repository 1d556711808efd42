//! The join engine's output before it is shaped for a problem type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Interaction, LearningMode, Observation, Outcome, ProblemType};

/// What made a join final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A final observation arrived.
    Signaled,
    /// Pending for longer than the TTL.
    Expired,
    /// Source exhausted while still pending.
    EndOfStream,
    /// Its episode closed.
    EpisodeClosed,
}

/// Finalized reward: one value, or one per slot for multi-slot decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reward {
    Scalar(f32),
    PerSlot(Vec<f32>),
}

impl Reward {
    /// Reward for slot `index`. A scalar applies to every slot.
    pub fn slot(&self, index: usize, fallback: f32) -> f32 {
        match self {
            Reward::Scalar(value) => *value,
            Reward::PerSlot(values) => values.get(index).copied().unwrap_or(fallback),
        }
    }

    pub fn scalar(&self) -> Option<f32> {
        match self {
            Reward::Scalar(value) => Some(*value),
            Reward::PerSlot(_) => None,
        }
    }
}

/// One interaction paired with its finalized reward.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedExample {
    pub interaction: Interaction,
    pub observations: Vec<Observation>,
    pub reward: Reward,
    /// Every reward value came from the default, not from observations.
    pub defaulted: bool,
    pub default_reward: f32,
    pub problem_type: ProblemType,
    pub learning_mode: LearningMode,
    pub resolution: Resolution,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedExample {
    pub fn event_id(&self) -> &str {
        &self.interaction.event_id
    }

    /// A deferred decision counts only once an activation was observed.
    pub fn activated(&self) -> bool {
        !self.interaction.deferred || self.observations.iter().any(Observation::is_activation)
    }

    /// Structured outcomes that did not contribute a numeric reward.
    pub fn structured_outcomes(&self) -> Vec<String> {
        self.observations
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Structured(text) if o.reward_value().is_none() => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}
