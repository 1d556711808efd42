//! Typed records decoded from the binary log.
//!
//! The same structs are the wire payloads (bincode) and the converter's
//! JSON output, so the field names here are part of both formats.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reward::RewardFunction;

/// The problem a decision was made for. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemType {
    Cb,
    Ccb,
    Slates,
    Ca,
}

impl ProblemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::Cb => "CB",
            ProblemType::Ccb => "CCB",
            ProblemType::Slates => "SLATES",
            ProblemType::Ca => "CA",
        }
    }

    /// Only single-action decisions can be chained into episodes.
    pub fn supports_episodes(&self) -> bool {
        matches!(self, ProblemType::Cb)
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProblemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cb" => Ok(ProblemType::Cb),
            "ccb" => Ok(ProblemType::Ccb),
            "slates" => Ok(ProblemType::Slates),
            "ca" => Ok(ProblemType::Ca),
            other => Err(format!(
                "unknown problem type '{other}', valid values: CB, CCB, SLATES, CA"
            )),
        }
    }
}

/// Whether a resolved example is meant for learning or only for the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Online,
    Apprentice,
    LoggingOnly,
}

impl LearningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningMode::Online => "online",
            LearningMode::Apprentice => "apprentice",
            LearningMode::LoggingOnly => "logging_only",
        }
    }
}

impl fmt::Display for LearningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LearningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(LearningMode::Online),
            "apprentice" => Ok(LearningMode::Apprentice),
            "loggingonly" | "logging-only" | "logging_only" => Ok(LearningMode::LoggingOnly),
            other => Err(format!(
                "unknown learning mode '{other}', valid values: online, apprentice, logging-only"
            )),
        }
    }
}

/// One slot of a multi-slot or slate decision. `actions[0]` is the chosen one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDecision {
    pub slot_id: Option<String>,
    pub actions: Vec<u64>,
    pub probabilities: Vec<f32>,
}

impl SlotDecision {
    pub fn chosen(&self) -> Option<(u64, f32)> {
        Some((*self.actions.first()?, *self.probabilities.first()?))
    }
}

/// Problem-specific shape of the decision that was served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionPayload {
    /// Ranked action ids; the first one was taken.
    Cb {
        actions: Vec<u64>,
        probabilities: Vec<f32>,
    },
    Ccb { slots: Vec<SlotDecision> },
    Slates { slots: Vec<SlotDecision> },
    Ca { action: f32, pdf_value: f32 },
}

impl DecisionPayload {
    pub fn problem_type(&self) -> ProblemType {
        match self {
            DecisionPayload::Cb { .. } => ProblemType::Cb,
            DecisionPayload::Ccb { .. } => ProblemType::Ccb,
            DecisionPayload::Slates { .. } => ProblemType::Slates,
            DecisionPayload::Ca { .. } => ProblemType::Ca,
        }
    }
}

/// A decision logged at request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub event_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub episode_id: Option<String>,
    pub context: String,
    /// The action may not have been applied; it needs an activation to count.
    pub deferred: bool,
    pub payload: DecisionPayload,
}

/// What an observation reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Numeric(f32),
    /// Free-form outcome text. Contributes to the reward only if it parses as a number.
    Structured(String),
    /// Activation of a deferred decision.
    ActionTaken,
}

/// An outcome tied to an earlier interaction (or episode) by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub event_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Slot index for multi-slot decisions, step index for episodes.
    pub index: Option<u32>,
    pub outcome: Outcome,
    /// Producer promises no further observations for this identity.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl Observation {
    pub fn reward_value(&self) -> Option<f32> {
        match &self.outcome {
            Outcome::Numeric(v) => Some(*v),
            Outcome::Structured(text) => text.trim().parse::<f32>().ok(),
            Outcome::ActionTaken => None,
        }
    }

    pub fn is_activation(&self) -> bool {
        matches!(self.outcome, Outcome::ActionTaken)
    }
}

/// Explicit end of an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeBoundary {
    pub episode_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Defaults declared by the log itself. Configuration overrides win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub problem_type: Option<ProblemType>,
    pub reward_function: Option<RewardFunction>,
    pub learning_mode: Option<LearningMode>,
    pub default_reward: Option<f32>,
}

/// Frame kind tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Checkpoint,
    Interaction,
    Observation,
    EpisodeBoundary,
    EndOfLog,
}

impl RecordKind {
    pub const fn tag(self) -> u32 {
        match self {
            RecordKind::Checkpoint => 1,
            RecordKind::Interaction => 2,
            RecordKind::Observation => 3,
            RecordKind::EpisodeBoundary => 4,
            RecordKind::EndOfLog => 0xAAAA_AAAA,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Checkpoint),
            2 => Some(RecordKind::Interaction),
            3 => Some(RecordKind::Observation),
            4 => Some(RecordKind::EpisodeBoundary),
            0xAAAA_AAAA => Some(RecordKind::EndOfLog),
            _ => None,
        }
    }
}

/// A decoded log record, owned by whichever stage is processing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Checkpoint(Checkpoint),
    Interaction(Interaction),
    Observation(Observation),
    EpisodeBoundary(EpisodeBoundary),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Checkpoint(_) => RecordKind::Checkpoint,
            Record::Interaction(_) => RecordKind::Interaction,
            Record::Observation(_) => RecordKind::Observation,
            Record::EpisodeBoundary(_) => RecordKind::EpisodeBoundary,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Checkpoint(c) => c.timestamp,
            Record::Interaction(i) => i.timestamp,
            Record::Observation(o) => o.timestamp,
            Record::EpisodeBoundary(b) => b.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_parsing_is_case_insensitive() {
        assert_eq!("ccb".parse::<ProblemType>().unwrap(), ProblemType::Ccb);
        assert_eq!("SLATES".parse::<ProblemType>().unwrap(), ProblemType::Slates);
        assert!("bandit".parse::<ProblemType>().is_err());

        assert_eq!(
            "LoggingOnly".parse::<LearningMode>().unwrap(),
            LearningMode::LoggingOnly
        );
        assert_eq!(
            "logging-only".parse::<LearningMode>().unwrap(),
            LearningMode::LoggingOnly
        );
        assert!("offline".parse::<LearningMode>().is_err());
    }

    #[test]
    fn test_structured_outcome_reward() {
        let mut obs = Observation {
            event_id: "e".into(),
            timestamp: Utc::now(),
            index: None,
            outcome: Outcome::Structured(" 1.5 ".into()),
            is_final: false,
        };
        assert_eq!(obs.reward_value(), Some(1.5));

        obs.outcome = Outcome::Structured("{\"clicked\":true}".into());
        assert_eq!(obs.reward_value(), None);

        obs.outcome = Outcome::ActionTaken;
        assert!(obs.is_activation());
        assert_eq!(obs.reward_value(), None);
    }

    #[test]
    fn test_kind_tags() {
        for kind in [
            RecordKind::Checkpoint,
            RecordKind::Interaction,
            RecordKind::Observation,
            RecordKind::EpisodeBoundary,
            RecordKind::EndOfLog,
        ] {
            assert_eq!(RecordKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(RecordKind::from_tag(0x55), None);
    }
}
