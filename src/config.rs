//! Joiner configuration.
//!
//! Raw values are layered with figment (defaults, then `joiner.toml`, then
//! `JOINER_*` environment variables) into [`JoinerConfig`]. Nothing is
//! interpreted until [`JoinerConfig::validate`], which is where every fatal
//! configuration error is raised, before a single record is read.

use std::path::Path;

use chrono::TimeDelta;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::binary_reader::DEFAULT_MAX_FRAME_LEN;
use crate::clock::ClockKind;
use crate::errors::{JoinerError, JoinerResult};
use crate::record::{LearningMode, ProblemType};
use crate::reward::RewardFunction;

pub const DEFAULT_CONFIG_FILE: &str = "joiner.toml";
pub const ENV_PREFIX: &str = "JOINER_";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JoinerConfig {
    pub problem_type: Option<String>,
    pub reward_function: Option<String>,
    pub learning_mode: Option<String>,
    pub default_reward: Option<f32>,
    #[serde(default)]
    pub multistep: bool,
    pub ttl_ms: u64,
    pub orphan_grace_ms: u64,
    pub episode_max_age_ms: u64,
    pub clock: String,
    pub max_frame_len: u32,
    pub resolved_memory: usize,
    /// Channel capacity of the decode-ahead thread; 0 decodes inline.
    pub read_ahead: usize,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            problem_type: None,
            reward_function: None,
            learning_mode: None,
            default_reward: None,
            multistep: false,
            ttl_ms: 60_000,
            orphan_grace_ms: 5_000,
            episode_max_age_ms: 600_000,
            clock: "event_time".to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            resolved_memory: 100_000,
            read_ahead: 0,
        }
    }
}

/// Validated, typed settings. Read-only for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSettings {
    pub problem_type: ProblemType,
    /// `Some` values are sticky: checkpoints in the log cannot change them.
    pub reward_function: Option<RewardFunction>,
    pub learning_mode: Option<LearningMode>,
    pub default_reward: Option<f32>,
    pub multistep: bool,
    pub ttl: TimeDelta,
    pub orphan_grace: TimeDelta,
    pub episode_max_age: TimeDelta,
    pub clock: ClockKind,
    pub max_frame_len: u32,
    pub resolved_memory: usize,
    pub read_ahead: usize,
}

impl Default for JoinSettings {
    fn default() -> Self {
        let config = JoinerConfig::default();
        Self {
            problem_type: ProblemType::Cb,
            reward_function: None,
            learning_mode: None,
            default_reward: None,
            multistep: false,
            ttl: TimeDelta::milliseconds(config.ttl_ms as i64),
            orphan_grace: TimeDelta::milliseconds(config.orphan_grace_ms as i64),
            episode_max_age: TimeDelta::milliseconds(config.episode_max_age_ms as i64),
            clock: ClockKind::EventTime,
            max_frame_len: config.max_frame_len,
            resolved_memory: config.resolved_memory,
            read_ahead: 0,
        }
    }
}

fn parse_field<T>(field: &str, value: Option<&str>) -> JoinerResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .map(|raw| raw.parse::<T>().map_err(|e| JoinerError::config(field, e)))
        .transpose()
}

fn millis(field: &str, value: u64) -> JoinerResult<TimeDelta> {
    if value == 0 {
        return Err(JoinerError::config(field, "must be greater than zero"));
    }
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| JoinerError::config(field, format!("{value} ms is out of range")))
}

impl JoinerConfig {
    pub fn validate(&self) -> JoinerResult<JoinSettings> {
        let problem_type = parse_field::<ProblemType>("problem_type", self.problem_type.as_deref())?;
        let reward_function =
            parse_field::<RewardFunction>("reward_function", self.reward_function.as_deref())?;
        let learning_mode = parse_field::<LearningMode>("learning_mode", self.learning_mode.as_deref())?;
        let clock = self
            .clock
            .parse::<ClockKind>()
            .map_err(|e| JoinerError::config("clock", e))?;

        if let Some(reward) = self.default_reward {
            if !reward.is_finite() {
                return Err(JoinerError::config("default_reward", "must be a finite number"));
            }
        }

        let problem_type = problem_type.unwrap_or(ProblemType::Cb);
        if self.multistep && !problem_type.supports_episodes() {
            return Err(JoinerError::config(
                "multistep",
                format!("multistep joining requires problem type CB, got {problem_type}"),
            ));
        }

        if self.max_frame_len == 0 {
            return Err(JoinerError::config("max_frame_len", "must be greater than zero"));
        }

        let ttl = millis("ttl_ms", self.ttl_ms)?;
        let episode_max_age = millis("episode_max_age_ms", self.episode_max_age_ms)?;
        if episode_max_age < ttl {
            return Err(JoinerError::config(
                "episode_max_age_ms",
                "must not be shorter than ttl_ms",
            ));
        }

        Ok(JoinSettings {
            problem_type,
            reward_function,
            learning_mode,
            default_reward: self.default_reward,
            multistep: self.multistep,
            ttl,
            orphan_grace: millis("orphan_grace_ms", self.orphan_grace_ms)?,
            episode_max_age,
            clock,
            max_frame_len: self.max_frame_len,
            resolved_memory: self.resolved_memory,
            read_ahead: self.read_ahead,
        })
    }
}

/// The layered figment, exposed so callers can merge further providers.
pub fn figment(path: Option<&Path>) -> Figment {
    let toml = match path {
        Some(path) => Toml::file(path),
        None => Toml::file(DEFAULT_CONFIG_FILE),
    };

    Figment::from(Serialized::defaults(JoinerConfig::default()))
        .merge(toml)
        .merge(Env::prefixed(ENV_PREFIX))
}

pub fn load_config(path: Option<&Path>) -> JoinerResult<JoinerConfig> {
    let config: JoinerConfig = figment(path).extract()?;
    Ok(config)
}
