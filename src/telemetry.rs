// Join telemetry: counters for outcomes and recoverable anomalies, plus a
// JSON-lines sink for run summaries.

use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Anomalies are absorbed by the engine and only surface here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMetrics {
    pub records_read: u64,
    pub checkpoints: u64,
    pub interactions: u64,
    pub observations: u64,
    pub episode_boundaries: u64,

    pub examples_emitted: u64,
    pub resolved_signaled: u64,
    pub resolved_expired: u64,
    pub resolved_end_of_stream: u64,
    pub resolved_episode_closed: u64,
    pub defaulted_rewards: u64,

    pub duplicate_interactions: u64,
    pub malformed_interactions: u64,
    /// Slot or step index that addresses nothing.
    pub malformed_observations: u64,
    pub orphans_adopted: u64,
    pub orphans_expired: u64,
    pub late_observations: u64,
    pub episodes_forced_closed: u64,
    pub episodes_reopened: u64,
    pub unknown_boundaries: u64,
    pub checkpoint_conflicts: u64,
    pub truncated_tail: bool,
}

impl JoinMetrics {
    /// Sum of every recoverable anomaly counter.
    pub fn anomalies(&self) -> u64 {
        self.duplicate_interactions
            + self.malformed_interactions
            + self.malformed_observations
            + self.orphans_expired
            + self.late_observations
            + self.episodes_forced_closed
            + self.episodes_reopened
            + self.unknown_boundaries
            + self.checkpoint_conflicts
    }

    pub fn log_summary(&self) {
        info!(
            interactions = self.interactions,
            observations = self.observations,
            examples = self.examples_emitted,
            defaulted = self.defaulted_rewards,
            anomalies = self.anomalies(),
            "join run summary"
        );
    }
}

/// One line of the metrics file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub metrics: JoinMetrics,
}

impl MetricsRecord {
    pub fn new(source: &str, metrics: &JoinMetrics) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.to_string(),
            metrics: metrics.clone(),
        }
    }

    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = std::io::BufWriter::new(file);
        let json = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        writeln!(writer, "{json}")?;
        writer.flush()?;

        Ok(())
    }
}
