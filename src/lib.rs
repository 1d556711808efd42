//! Library root for the `reward_joiner` crate
//! Joins logged decisions with their asynchronously logged outcomes

// Core error handling
pub mod errors;

// Log format
pub mod binary_reader;
pub mod binary_writer;
pub mod read_ahead;
pub mod record;

// Joining
pub mod clock;
pub mod episode;
pub mod join_store;
pub mod joiner;
pub mod reward;

// Output shapes & sinks
pub mod adapter;
pub mod converter;
pub mod example;

// Configuration, telemetry & CLI
pub mod cli;
pub mod config;
pub mod telemetry;

pub use adapter::{ExampleAdapter, Label, TrainingExample};
pub use binary_reader::{RecordReader, RecordSource};
pub use binary_writer::RecordWriter;
pub use config::{load_config, JoinSettings, JoinerConfig};
pub use errors::{DecodeError, JoinerError, JoinerResult};
pub use joiner::{JoinEngine, Pull};
pub use record::{LearningMode, ProblemType, Record};
pub use reward::RewardFunction;
pub use telemetry::JoinMetrics;
