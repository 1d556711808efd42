//! Multistep joining over encoded logs

use std::collections::HashMap;
use std::io::Cursor;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use reward_joiner::binary_writer::encode_log;
use reward_joiner::example::Resolution;
use reward_joiner::record::{DecisionPayload, EpisodeBoundary, Interaction, Observation, Outcome};
use reward_joiner::{JoinEngine, JoinSettings, Pull, Record, RecordReader, TrainingExample};

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn step(id: &str, episode: &str, at: i64) -> Record {
    Record::Interaction(Interaction {
        event_id: id.into(),
        timestamp: ts(at),
        episode_id: Some(episode.into()),
        context: String::new(),
        deferred: false,
        payload: DecisionPayload::Cb {
            actions: vec![1, 0],
            probabilities: vec![0.5, 0.5],
        },
    })
}

fn observe(key: &str, at: i64, index: Option<u32>, value: f32) -> Record {
    Record::Observation(Observation {
        event_id: key.into(),
        timestamp: ts(at),
        index,
        outcome: Outcome::Numeric(value),
        is_final: false,
    })
}

fn boundary(episode: &str, at: i64) -> Record {
    Record::EpisodeBoundary(EpisodeBoundary {
        episode_id: episode.into(),
        timestamp: ts(at),
    })
}

fn multistep() -> JoinSettings {
    JoinSettings {
        multistep: true,
        ttl: TimeDelta::milliseconds(500),
        orphan_grace: TimeDelta::milliseconds(100),
        episode_max_age: TimeDelta::seconds(5),
        ..JoinSettings::default()
    }
}

fn join(records: &[Record], settings: JoinSettings) -> Vec<TrainingExample> {
    let bytes = encode_log(records).unwrap();
    JoinEngine::new(RecordReader::new(Cursor::new(bytes)), settings)
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_three_steps_share_episode_reward() {
    let examples = join(
        &[
            step("a", "ep-1", 0),
            step("b", "ep-1", 10),
            step("c", "ep-1", 20),
            observe("ep-1", 30, None, 0.5),
            boundary("ep-1", 40),
        ],
        multistep(),
    );

    assert_eq!(examples.len(), 3);
    for example in &examples {
        assert_eq!(example.reward(), Some(0.5));
        assert_eq!(example.resolution, Resolution::EpisodeClosed);
    }
}

#[test]
fn test_nothing_emitted_before_boundary() {
    let bytes = encode_log(&[
        step("a", "ep", 0),
        step("b", "ep", 10),
        observe("ep", 20, None, 1.0),
    ])
    .unwrap();
    let mut engine = JoinEngine::new(RecordReader::new(Cursor::new(bytes)), multistep());

    assert_eq!(engine.poll_example().unwrap(), Pull::Idle);
    assert_eq!(engine.metrics().examples_emitted, 0);
    assert_eq!(engine.store_stats().pending, 2);
}

#[test]
fn test_interleaved_episodes_close_independently() {
    let examples = join(
        &[
            step("a1", "A", 0),
            step("b1", "B", 1),
            step("a2", "A", 2),
            observe("B", 3, None, 2.0),
            observe("A", 4, None, 1.0),
            boundary("B", 5),
            step("b-late", "B", 6),
            boundary("A", 7),
        ],
        multistep(),
    );

    let order: Vec<&str> = examples.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(order, vec!["b1", "a1", "a2", "b-late"]);

    let rewards: HashMap<&str, Option<f32>> = examples
        .iter()
        .map(|e| (e.event_id.as_str(), e.reward()))
        .collect();
    assert_eq!(rewards["a1"], Some(1.0));
    assert_eq!(rewards["b1"], Some(2.0));
    // Reopened episode gets no reward of its own
    assert_eq!(rewards["b-late"], Some(0.0));
    assert_eq!(examples[3].resolution, Resolution::EndOfStream);
}

#[test]
fn test_reopened_episode_is_counted() {
    let bytes = encode_log(&[step("a", "ep", 0), boundary("ep", 1), step("b", "ep", 2)]).unwrap();
    let mut engine = JoinEngine::new(RecordReader::new(Cursor::new(bytes)), multistep());
    let examples = engine.by_ref().collect::<Result<Vec<_>, _>>().unwrap();

    assert_eq!(examples.len(), 2);
    assert_eq!(engine.metrics().episodes_reopened, 1);
}

#[test]
fn test_max_age_closes_active_episode() {
    let mut records = Vec::new();
    for i in 0..30 {
        records.push(step(&format!("s{i}"), "long", i * 200));
    }
    let examples = join(&records, multistep());

    assert_eq!(examples.len(), 30);
    assert_eq!(examples[0].resolution, Resolution::Expired);
    assert!(examples.iter().any(|e| e.resolution == Resolution::EndOfStream));
}

#[test]
fn test_late_episode_observation_is_counted() {
    let bytes = encode_log(&[
        step("a", "ep", 0),
        boundary("ep", 1),
        observe("ep", 2, None, 1.0),
        observe("a", 3, None, 1.0),
    ])
    .unwrap();
    let mut engine = JoinEngine::new(RecordReader::new(Cursor::new(bytes)), multistep());
    let examples = engine.by_ref().collect::<Result<Vec<_>, _>>().unwrap();

    assert_eq!(examples.len(), 1);
    assert!(examples[0].defaulted);
    assert_eq!(engine.metrics().late_observations, 2);
}

#[test]
fn test_idle_episode_stays_closed_after_late_activity() {
    let bytes = encode_log(&[
        step("a", "ep", 0),
        step("b", "ep", 100),
        observe("ep", 900, None, 4.0),
        observe("ep", 950, Some(1), 2.0),
    ])
    .unwrap();
    let mut engine = JoinEngine::new(RecordReader::new(Cursor::new(bytes)), multistep());
    let examples = engine.by_ref().collect::<Result<Vec<_>, _>>().unwrap();

    assert_eq!(examples.len(), 2);
    for example in &examples {
        assert_eq!(example.resolution, Resolution::Expired);
        assert_eq!(example.reward(), Some(0.0));
    }
    assert_eq!(engine.metrics().episodes_forced_closed, 1);
    assert_eq!(engine.metrics().late_observations, 2);
}

#[test]
fn test_indexed_observation_before_its_step() {
    let examples = join(
        &[
            step("s1", "ep", 0),
            observe("ep", 1, Some(1), 9.0),
            step("s2", "ep", 2),
            boundary("ep", 3),
        ],
        multistep(),
    );

    assert_eq!(examples[0].event_id, "s1");
    assert_eq!(examples[0].reward(), Some(0.0));
    assert!(examples[0].defaulted);
    assert_eq!(examples[1].event_id, "s2");
    assert_eq!(examples[1].reward(), Some(9.0));
}
