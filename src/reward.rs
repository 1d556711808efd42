//! Reward aggregation policies.
//!
//! Aggregation is a pure function of the ordered `(timestamp, reward)` values
//! of one join. An empty sequence never reaches a policy: [`RewardFunction::resolve`]
//! short-circuits to the default reward.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed reward value with the time it was logged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedReward {
    pub timestamp: DateTime<Utc>,
    pub value: f32,
}

impl TimedReward {
    pub fn new(timestamp: DateTime<Utc>, value: f32) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardFunction {
    Earliest,
    Average,
    /// Lower median on even counts.
    Median,
    Sum,
    Min,
    Max,
}

/// Final reward of a join and whether it came from observations at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedReward {
    pub value: f32,
    pub defaulted: bool,
}

impl RewardFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardFunction::Earliest => "earliest",
            RewardFunction::Average => "average",
            RewardFunction::Median => "median",
            RewardFunction::Sum => "sum",
            RewardFunction::Min => "min",
            RewardFunction::Max => "max",
        }
    }

    /// Aggregate a non-empty sequence. Returns `None` for empty input without
    /// evaluating the policy.
    pub fn aggregate(&self, values: &[TimedReward]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }

        let reward = match self {
            RewardFunction::Earliest => {
                // min_by keeps the first of equal elements, so ties go to arrival order
                values
                    .iter()
                    .min_by(|a, b| a.timestamp.cmp(&b.timestamp))
                    .map(|r| r.value)?
            }
            RewardFunction::Average => {
                let total: f64 = values.iter().map(|r| f64::from(r.value)).sum();
                (total / values.len() as f64) as f32
            }
            RewardFunction::Median => {
                let mut sorted: Vec<f32> = values.iter().map(|r| r.value).collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                sorted[(sorted.len() - 1) / 2]
            }
            RewardFunction::Sum => {
                let total: f64 = values.iter().map(|r| f64::from(r.value)).sum();
                total as f32
            }
            RewardFunction::Min => values
                .iter()
                .map(|r| r.value)
                .min_by(|a, b| a.total_cmp(b))?,
            RewardFunction::Max => values
                .iter()
                .map(|r| r.value)
                .max_by(|a, b| a.total_cmp(b))?,
        };

        Some(reward)
    }

    /// Aggregate, falling back to `default_reward` when nothing was observed.
    pub fn resolve(&self, values: &[TimedReward], default_reward: f32) -> ResolvedReward {
        match self.aggregate(values) {
            Some(value) => ResolvedReward {
                value,
                defaulted: false,
            },
            None => ResolvedReward {
                value: default_reward,
                defaulted: true,
            },
        }
    }
}

impl fmt::Display for RewardFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(RewardFunction::Earliest),
            "average" => Ok(RewardFunction::Average),
            "median" => Ok(RewardFunction::Median),
            "sum" => Ok(RewardFunction::Sum),
            "min" => Ok(RewardFunction::Min),
            "max" => Ok(RewardFunction::Max),
            other => Err(format!(
                "unknown reward function '{other}', valid values: earliest, average, median, sum, min, max"
            )),
        }
    }
}
