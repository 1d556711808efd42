use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{load_config, JoinSettings, JoinerConfig};
use crate::converter::{convert_file, ConvertOptions};
use crate::joiner::JoinEngine;
use crate::telemetry::{JoinMetrics, MetricsRecord};

/// Top-level CLI interface for the reward joiner
#[derive(Parser, Debug)]
#[command(
    name = "reward_joiner",
    version,
    about = "Join logged decisions with their outcomes into training examples"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a binary log and write training examples as JSON lines
    Join {
        #[arg(short, long)]
        input: PathBuf,
        /// Defaults to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        overrides: JoinOverrides,
    },

    /// Convert a binary log into structured text for inspection
    Convert {
        #[arg(short, long)]
        input: PathBuf,
        /// Defaults to the input path with `.dsjson` appended
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write every decoded record
        #[arg(long)]
        include_raw: bool,
        #[command(flatten)]
        overrides: JoinOverrides,
    },
}

/// Flags that win over the config file and environment.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct JoinOverrides {
    /// Config file (default: joiner.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// CB, CCB, SLATES or CA
    #[arg(long)]
    pub problem_type: Option<String>,
    /// earliest, average, median, sum, min or max
    #[arg(long)]
    pub reward_function: Option<String>,
    /// online, apprentice or logging-only
    #[arg(long)]
    pub learning_mode: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    pub default_reward: Option<f32>,
    #[arg(long)]
    pub multistep: bool,
    #[arg(long)]
    pub ttl_ms: Option<u64>,
    /// Append run metrics to this JSON-lines file
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

impl JoinOverrides {
    pub fn apply(&self, config: &mut JoinerConfig) {
        if let Some(problem_type) = &self.problem_type {
            config.problem_type = Some(problem_type.clone());
        }
        if let Some(reward_function) = &self.reward_function {
            config.reward_function = Some(reward_function.clone());
        }
        if let Some(learning_mode) = &self.learning_mode {
            config.learning_mode = Some(learning_mode.clone());
        }
        if self.default_reward.is_some() {
            config.default_reward = self.default_reward;
        }
        if self.multistep {
            config.multistep = true;
        }
        if let Some(ttl_ms) = self.ttl_ms {
            config.ttl_ms = ttl_ms;
        }
    }

    pub fn settings(&self) -> anyhow::Result<JoinSettings> {
        let mut config = load_config(self.config.as_deref()).context("loading configuration")?;
        self.apply(&mut config);
        Ok(config.validate()?)
    }
}

pub fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Join {
            input,
            output,
            overrides,
        } => {
            let settings = overrides.settings()?;
            let metrics = run_join(&input, output.as_deref(), settings)?;
            export_metrics(&overrides, &input, &metrics)
        }
        Commands::Convert {
            input,
            output,
            include_raw,
            overrides,
        } => {
            let settings = overrides.settings()?;
            let summary = convert_file(
                &input,
                output.as_deref(),
                settings,
                ConvertOptions { include_raw },
            )?;
            if let Some(path) = &summary.output {
                println!("Converted {} examples to {}", summary.examples, path.display());
            }
            export_metrics(&overrides, &input, &summary.metrics)
        }
    }
}

fn run_join(input: &Path, output: Option<&Path>, settings: JoinSettings) -> anyhow::Result<JoinMetrics> {
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);

    let mut engine = JoinEngine::open(input, settings)?;
    let mut written = 0u64;
    let outcome = loop {
        match engine.next_example() {
            Ok(Some(example)) => {
                serde_json::to_writer(&mut writer, &example).context("serializing example")?;
                writer.write_all(b"\n")?;
                written += 1;
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    writer.flush()?;

    if let Err(err) = outcome {
        warn!(written, "join aborted");
        return Err(err).context(format!("joining {}", input.display()));
    }
    info!(input = %input.display(), written, "join finished");
    Ok(engine.metrics().clone())
}

fn export_metrics(overrides: &JoinOverrides, input: &Path, metrics: &JoinMetrics) -> anyhow::Result<()> {
    if let Some(path) = &overrides.metrics_out {
        MetricsRecord::new(&input.display().to_string(), metrics)
            .write_to_file(path)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_join_flags_parse() {
        let cli = Cli::try_parse_from([
            "reward_joiner",
            "join",
            "--input",
            "run.log",
            "--problem-type",
            "ccb",
            "--default-reward",
            "-1.5",
            "--multistep",
        ])
        .unwrap();

        match cli.command {
            Commands::Join {
                input, overrides, ..
            } => {
                assert_eq!(input, PathBuf::from("run.log"));
                assert_eq!(overrides.problem_type.as_deref(), Some("ccb"));
                assert_eq!(overrides.default_reward, Some(-1.5));
                assert!(overrides.multistep);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides_win_over_config() {
        let mut config = JoinerConfig {
            reward_function: Some("sum".into()),
            ..JoinerConfig::default()
        };
        let overrides = JoinOverrides {
            reward_function: Some("median".into()),
            ttl_ms: Some(5),
            ..JoinOverrides::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.reward_function.as_deref(), Some("median"));
        assert_eq!(config.ttl_ms, 5);
        assert!(!config.multistep);
    }
}
