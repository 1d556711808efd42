//! Problem-type adapter: turns a [`ResolvedExample`] into the example shape a
//! learner for that problem type expects.
//!
//! The adapter variant is picked once from the configured problem type and
//! never changes during a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::example::{Resolution, ResolvedExample};
use crate::record::{DecisionPayload, LearningMode, ProblemType, SlotDecision};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdaptError {
    #[error("payload is {found}, adapter expects {expected}")]
    PayloadMismatch {
        expected: ProblemType,
        found: ProblemType,
    },

    #[error("malformed decision: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotLabel {
    pub slot_id: Option<String>,
    pub action: u64,
    pub probability: f32,
    pub reward: f32,
    pub actions: Vec<u64>,
    pub probabilities: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlateSlot {
    pub slot_id: Option<String>,
    pub action: u64,
    pub probability: f32,
}

/// Label part of a training example, one shape per problem type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Label {
    SingleAction {
        action: u64,
        probability: f32,
        reward: f32,
        actions: Vec<u64>,
        probabilities: Vec<f32>,
    },
    MultiSlot {
        slots: Vec<SlotLabel>,
    },
    Slate {
        slots: Vec<SlateSlot>,
        reward: f32,
    },
    ContinuousAction {
        action: f32,
        pdf_value: f32,
        reward: f32,
    },
}

impl Label {
    /// The single reward of the example; `None` for multi-slot labels.
    pub fn reward(&self) -> Option<f32> {
        match self {
            Label::SingleAction { reward, .. }
            | Label::Slate { reward, .. }
            | Label::ContinuousAction { reward, .. } => Some(*reward),
            Label::MultiSlot { .. } => None,
        }
    }

    pub fn slot_rewards(&self) -> Vec<f32> {
        match self {
            Label::MultiSlot { slots } => slots.iter().map(|s| s.reward).collect(),
            other => other.reward().into_iter().collect(),
        }
    }
}

/// A completed example as handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingExample {
    pub event_id: String,
    pub episode_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub problem_type: ProblemType,
    pub learning_mode: LearningMode,
    /// Whether a learner should train on this example.
    pub learn: bool,
    pub defaulted: bool,
    pub resolution: Resolution,
    pub observation_count: usize,
    pub context: String,
    pub label: Label,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub structured_outcomes: Vec<String>,
}

impl TrainingExample {
    pub fn reward(&self) -> Option<f32> {
        self.label.reward()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExampleAdapter {
    SingleAction,
    MultiSlot,
    Slate,
    ContinuousAction,
}

impl ExampleAdapter {
    pub fn for_problem(problem_type: ProblemType) -> Self {
        match problem_type {
            ProblemType::Cb => ExampleAdapter::SingleAction,
            ProblemType::Ccb => ExampleAdapter::MultiSlot,
            ProblemType::Slates => ExampleAdapter::Slate,
            ProblemType::Ca => ExampleAdapter::ContinuousAction,
        }
    }

    pub fn problem_type(&self) -> ProblemType {
        match self {
            ExampleAdapter::SingleAction => ProblemType::Cb,
            ExampleAdapter::MultiSlot => ProblemType::Ccb,
            ExampleAdapter::Slate => ProblemType::Slates,
            ExampleAdapter::ContinuousAction => ProblemType::Ca,
        }
    }

    /// Reject decisions this adapter cannot shape, before they enter the join.
    pub fn check(&self, payload: &DecisionPayload) -> Result<(), AdaptError> {
        let found = payload.problem_type();
        if found != self.problem_type() {
            return Err(AdaptError::PayloadMismatch {
                expected: self.problem_type(),
                found,
            });
        }

        match payload {
            DecisionPayload::Cb {
                actions,
                probabilities,
            } => check_distribution(actions, probabilities, "cb"),
            DecisionPayload::Ccb { slots } | DecisionPayload::Slates { slots } => {
                if slots.is_empty() {
                    return Err(AdaptError::Malformed("decision has no slots".into()));
                }
                slots
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, slot)| check_distribution(&slot.actions, &slot.probabilities, &format!("slot {i}")))
            }
            DecisionPayload::Ca { action, pdf_value } => {
                if action.is_finite() && pdf_value.is_finite() {
                    Ok(())
                } else {
                    Err(AdaptError::Malformed("continuous action is not finite".into()))
                }
            }
        }
    }

    pub fn adapt(&self, resolved: ResolvedExample) -> Result<TrainingExample, AdaptError> {
        self.check(&resolved.interaction.payload)?;

        let mode = resolved.learning_mode;
        let fallback = resolved.default_reward;
        let (label, baseline_played) = match &resolved.interaction.payload {
            DecisionPayload::Cb {
                actions,
                probabilities,
            } => {
                let action = actions[0];
                (
                    Label::SingleAction {
                        action,
                        probability: apprentice_probability(mode, probabilities[0]),
                        reward: resolved.reward.slot(0, fallback),
                        actions: actions.clone(),
                        probabilities: probabilities.clone(),
                    },
                    action == 0,
                )
            }
            DecisionPayload::Ccb { slots } => {
                let labels: Vec<SlotLabel> = slots
                    .iter()
                    .enumerate()
                    .map(|(i, slot)| slot_label(slot, resolved.reward.slot(i, fallback), mode))
                    .collect();
                let baseline = labels.iter().enumerate().all(|(i, s)| s.action == i as u64);
                (Label::MultiSlot { slots: labels }, baseline)
            }
            DecisionPayload::Slates { slots } => {
                let chosen: Vec<SlateSlot> = slots
                    .iter()
                    .map(|slot| SlateSlot {
                        slot_id: slot.slot_id.clone(),
                        action: slot.actions[0],
                        probability: apprentice_probability(mode, slot.probabilities[0]),
                    })
                    .collect();
                let baseline = chosen.iter().all(|s| s.action == 0);
                (
                    Label::Slate {
                        slots: chosen,
                        reward: resolved.reward.slot(0, fallback),
                    },
                    baseline,
                )
            }
            DecisionPayload::Ca { action, pdf_value } => (
                Label::ContinuousAction {
                    action: *action,
                    pdf_value: *pdf_value,
                    reward: resolved.reward.slot(0, fallback),
                },
                true,
            ),
        };

        let learn = resolved.activated()
            && match mode {
                LearningMode::Online => true,
                LearningMode::Apprentice => baseline_played,
                LearningMode::LoggingOnly => false,
            };

        let structured_outcomes = resolved.structured_outcomes();
        let ResolvedExample {
            interaction,
            observations,
            defaulted,
            problem_type,
            resolution,
            ..
        } = resolved;

        Ok(TrainingExample {
            event_id: interaction.event_id,
            episode_id: interaction.episode_id,
            timestamp: interaction.timestamp,
            problem_type,
            learning_mode: mode,
            learn,
            defaulted,
            resolution,
            observation_count: observations.len(),
            context: interaction.context,
            label,
            structured_outcomes,
        })
    }
}

fn check_distribution(actions: &[u64], probabilities: &[f32], what: &str) -> Result<(), AdaptError> {
    if actions.is_empty() {
        return Err(AdaptError::Malformed(format!("{what}: no actions")));
    }
    if actions.len() != probabilities.len() {
        return Err(AdaptError::Malformed(format!(
            "{what}: {} actions but {} probabilities",
            actions.len(),
            probabilities.len()
        )));
    }
    Ok(())
}

// The baseline policy is deterministic in apprentice mode.
fn apprentice_probability(mode: LearningMode, logged: f32) -> f32 {
    match mode {
        LearningMode::Apprentice => 1.0,
        _ => logged,
    }
}

fn slot_label(slot: &SlotDecision, reward: f32, mode: LearningMode) -> SlotLabel {
    SlotLabel {
        slot_id: slot.slot_id.clone(),
        action: slot.actions[0],
        probability: apprentice_probability(mode, slot.probabilities[0]),
        reward,
        actions: slot.actions.clone(),
        probabilities: slot.probabilities.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::Reward;
    use crate::record::{Interaction, Observation, Outcome};
    use chrono::TimeZone;

    fn resolved(payload: DecisionPayload, reward: Reward, mode: LearningMode) -> ResolvedExample {
        let ts = Utc.timestamp_millis_opt(1_000).unwrap();
        ResolvedExample {
            problem_type: payload.problem_type(),
            interaction: Interaction {
                event_id: "e1".into(),
                timestamp: ts,
                episode_id: None,
                context: "{}".into(),
                deferred: false,
                payload,
            },
            observations: Vec::new(),
            reward,
            defaulted: false,
            default_reward: 0.0,
            learning_mode: mode,
            resolution: Resolution::Signaled,
            resolved_at: ts,
        }
    }

    fn slot(actions: Vec<u64>) -> SlotDecision {
        let p = 1.0 / actions.len() as f32;
        SlotDecision {
            slot_id: None,
            probabilities: vec![p; actions.len()],
            actions,
        }
    }

    #[test]
    fn test_single_action_shape() {
        let payload = DecisionPayload::Cb {
            actions: vec![2, 0, 1],
            probabilities: vec![0.8, 0.1, 0.1],
        };
        let example = ExampleAdapter::SingleAction
            .adapt(resolved(payload, Reward::Scalar(0.7), LearningMode::Online))
            .unwrap();

        assert_eq!(example.reward(), Some(0.7));
        assert!(example.learn);
        match example.label {
            Label::SingleAction {
                action,
                probability,
                ..
            } => {
                assert_eq!(action, 2);
                assert_eq!(probability, 0.8);
            }
            other => panic!("unexpected label {other:?}"),
        }
    }

    #[test]
    fn test_multi_slot_gets_per_slot_rewards() {
        let payload = DecisionPayload::Ccb {
            slots: vec![slot(vec![1, 0]), slot(vec![0, 1])],
        };
        let example = ExampleAdapter::MultiSlot
            .adapt(resolved(payload, Reward::PerSlot(vec![1.0, -1.0]), LearningMode::Online))
            .unwrap();

        assert_eq!(example.reward(), None);
        assert_eq!(example.label.slot_rewards(), vec![1.0, -1.0]);
    }

    #[test]
    fn test_slate_has_one_reward() {
        let payload = DecisionPayload::Slates {
            slots: vec![slot(vec![3, 4]), slot(vec![5, 6]), slot(vec![7, 8])],
        };
        let example = ExampleAdapter::Slate
            .adapt(resolved(payload, Reward::Scalar(2.5), LearningMode::Online))
            .unwrap();
        match &example.label {
            Label::Slate { slots, reward } => {
                assert_eq!(slots.len(), 3);
                assert_eq!(*reward, 2.5);
                assert_eq!(slots[2].action, 7);
            }
            other => panic!("unexpected label {other:?}"),
        }
    }

    #[test]
    fn test_continuous_action_shape() {
        let payload = DecisionPayload::Ca {
            action: 1.25,
            pdf_value: 0.4,
        };
        let example = ExampleAdapter::ContinuousAction
            .adapt(resolved(payload, Reward::Scalar(-0.5), LearningMode::Online))
            .unwrap();
        assert_eq!(
            example.label,
            Label::ContinuousAction {
                action: 1.25,
                pdf_value: 0.4,
                reward: -0.5
            }
        );
    }

    #[test]
    fn test_learning_modes() {
        let baseline = DecisionPayload::Cb {
            actions: vec![0, 1],
            probabilities: vec![0.6, 0.4],
        };
        let other = DecisionPayload::Cb {
            actions: vec![1, 0],
            probabilities: vec![0.6, 0.4],
        };

        let adapter = ExampleAdapter::SingleAction;
        let example = adapter
            .adapt(resolved(baseline.clone(), Reward::Scalar(1.0), LearningMode::Apprentice))
            .unwrap();
        assert!(example.learn);
        assert_eq!(example.learning_mode, LearningMode::Apprentice);
        match example.label {
            Label::SingleAction { probability, .. } => assert_eq!(probability, 1.0),
            other => panic!("unexpected label {other:?}"),
        }

        let example = adapter
            .adapt(resolved(other, Reward::Scalar(1.0), LearningMode::Apprentice))
            .unwrap();
        assert!(!example.learn);

        let example = adapter
            .adapt(resolved(baseline, Reward::Scalar(1.0), LearningMode::LoggingOnly))
            .unwrap();
        assert!(!example.learn);
        assert_eq!(example.learning_mode, LearningMode::LoggingOnly);
    }

    #[test]
    fn test_deferred_decision_needs_activation() {
        let payload = DecisionPayload::Cb {
            actions: vec![1],
            probabilities: vec![1.0],
        };
        let mut input = resolved(payload, Reward::Scalar(1.0), LearningMode::Online);
        input.interaction.deferred = true;
        assert!(!ExampleAdapter::SingleAction.adapt(input.clone()).unwrap().learn);

        input.observations.push(Observation {
            event_id: "e1".into(),
            timestamp: input.resolved_at,
            index: None,
            outcome: Outcome::ActionTaken,
            is_final: false,
        });
        assert!(ExampleAdapter::SingleAction.adapt(input).unwrap().learn);
    }

    #[test]
    fn test_check_rejects_mismatch_and_malformed() {
        let ca = DecisionPayload::Ca {
            action: 0.0,
            pdf_value: 1.0,
        };
        assert_eq!(
            ExampleAdapter::SingleAction.check(&ca),
            Err(AdaptError::PayloadMismatch {
                expected: ProblemType::Cb,
                found: ProblemType::Ca
            })
        );

        let lopsided = DecisionPayload::Cb {
            actions: vec![0, 1],
            probabilities: vec![1.0],
        };
        assert!(matches!(
            ExampleAdapter::SingleAction.check(&lopsided),
            Err(AdaptError::Malformed(_))
        ));

        let empty = DecisionPayload::Ccb { slots: vec![] };
        assert!(ExampleAdapter::MultiSlot.check(&empty).is_err());
    }
}
