//! Layer 3: behavioral evolution driven by user feedback.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

use crate::engine::EvolutionEngine;
use crate::error::Result;
use crate::genome::BehaviorFeedback;

pub const FEEDBACK_APPROVAL: &str = "approval";
pub const FEEDBACK_COMPLETION: &str = "completion";
pub const FEEDBACK_ENGAGEMENT: &str = "engagement";

/// Trait keys accepted by [`EvolutionEngine::mutate_behavior`].
pub const TRAIT_RISK: &str = "risk";
pub const TRAIT_VERBOSITY: &str = "verbosity";
pub const TRAIT_AUTONOMY: &str = "autonomy";

/// Below this behavioral fitness the prompt style is rotated.
pub const PROMPT_ROTATION_THRESHOLD: f64 = 50.0;

/// What each feedback rate is divided by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackDenominator {
    /// All feedback entries, whatever their type
    #[default]
    Total,
    /// Entries of the rate's own type; neutral 0.5 when there are none
    PerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehaviorMetrics {
    pub approval_rate: f64,
    pub completion_rate: f64,
    pub cost_efficiency: f64,
    pub engagement_score: f64,
}

impl Default for BehaviorMetrics {
    fn default() -> Self {
        Self {
            approval_rate: 0.5,
            completion_rate: 0.5,
            cost_efficiency: 1.0,
            engagement_score: 0.5,
        }
    }
}

impl BehaviorMetrics {
    pub fn from_feedback<'a, I>(feedback: I, denominator: FeedbackDenominator) -> Self
    where
        I: IntoIterator<Item = &'a BehaviorFeedback>,
    {
        #[derive(Default)]
        struct Tally {
            seen: usize,
            positive: usize,
        }

        let mut total = 0usize;
        let mut approval = Tally::default();
        let mut completion = Tally::default();
        let mut engagement = Tally::default();

        for fb in feedback {
            total += 1;
            let tally = match fb.feedback_type.as_str() {
                FEEDBACK_APPROVAL => &mut approval,
                FEEDBACK_COMPLETION => &mut completion,
                FEEDBACK_ENGAGEMENT => &mut engagement,
                _ => continue,
            };
            tally.seen += 1;
            if fb.score > 0.0 {
                tally.positive += 1;
            }
        }

        if total == 0 {
            return Self::default();
        }

        let neutral = Self::default();
        match denominator {
            FeedbackDenominator::Total => {
                let total = total as f64;
                Self {
                    approval_rate: approval.positive as f64 / total,
                    // Any completion event counts, whatever its score
                    completion_rate: completion.seen as f64 / total,
                    cost_efficiency: neutral.cost_efficiency,
                    engagement_score: engagement.positive as f64 / total,
                }
            }
            FeedbackDenominator::PerType => {
                let rate = |t: &Tally, default: f64| {
                    if t.seen == 0 {
                        default
                    } else {
                        t.positive as f64 / t.seen as f64
                    }
                };
                Self {
                    approval_rate: rate(&approval, neutral.approval_rate),
                    completion_rate: rate(&completion, neutral.completion_rate),
                    cost_efficiency: neutral.cost_efficiency,
                    engagement_score: rate(&engagement, neutral.engagement_score),
                }
            }
        }
    }

    /// Weighted score on a 0-100 scale.
    pub fn fitness(&self) -> f64 {
        self.approval_rate * 40.0
            + self.completion_rate * 30.0
            + self.cost_efficiency * 20.0
            + self.engagement_score * 10.0
    }
}

type FeedbackSlot = Arc<Mutex<VecDeque<BehaviorFeedback>>>;

/// Rolling window of the most recent feedback per agent.
pub struct FeedbackStore {
    capacity: usize,
    denominator: FeedbackDenominator,
    agents: RwLock<HashMap<String, FeedbackSlot>>,
}

impl FeedbackStore {
    pub fn new(capacity: usize, denominator: FeedbackDenominator) -> Self {
        Self {
            capacity: capacity.max(1),
            denominator,
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn existing(&self, agent_id: &str) -> Option<FeedbackSlot> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn push(&self, feedback: BehaviorFeedback) {
        let slot = match self.existing(&feedback.agent_id) {
            Some(slot) => slot,
            None => self
                .agents
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(feedback.agent_id.clone())
                .or_default()
                .clone(),
        };
        let mut entries = slot.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(feedback);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Feedback for an agent, oldest first. Empty when none was submitted.
    pub fn history(&self, agent_id: &str) -> Vec<BehaviorFeedback> {
        self.existing(agent_id)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metrics(&self, agent_id: &str) -> BehaviorMetrics {
        match self.existing(agent_id) {
            Some(slot) => {
                let entries = slot.lock().unwrap_or_else(|e| e.into_inner());
                BehaviorMetrics::from_feedback(entries.iter(), self.denominator)
            }
            None => BehaviorMetrics::default(),
        }
    }
}

impl EvolutionEngine {
    /// Record a feedback event. The score is clamped to [-1, 1]; NaN counts
    /// as 0.
    pub fn submit_feedback(&self, agent_id: &str, feedback_type: &str, score: f64, context: &str) {
        let score = if score.is_nan() { 0.0 } else { score.clamp(-1.0, 1.0) };
        self.feedback.push(BehaviorFeedback {
            agent_id: agent_id.to_string(),
            timestamp: self.now(),
            feedback_type: feedback_type.to_string(),
            score,
            context: context.to_string(),
        });
        info!(agent = %agent_id, feedback_type, score, "feedback submitted");
    }

    pub fn behavior_metrics(&self, agent_id: &str) -> BehaviorMetrics {
        self.feedback.metrics(agent_id)
    }

    pub fn behavioral_fitness(&self, agent_id: &str) -> f64 {
        let metrics = self.behavior_metrics(agent_id);
        let fitness = metrics.fitness();
        info!(
            agent = %agent_id,
            fitness,
            approval_rate = metrics.approval_rate,
            completion_rate = metrics.completion_rate,
            engagement = metrics.engagement_score,
            "behavioral fitness calculated"
        );
        fitness
    }

    pub fn behavior_history(&self, agent_id: &str) -> Vec<BehaviorFeedback> {
        self.feedback.history(agent_id)
    }

    /// Nudge behavioral traits from per-trait feedback scores.
    ///
    /// For each of `risk`, `verbosity` and `autonomy` present in `scores`, a
    /// positive score perturbs the trait within [0, 1] while anything else
    /// decays it by the behavior rate. A behavioral fitness below 50 also
    /// rotates the prompt style.
    pub fn mutate_behavior(&self, agent_id: &str, scores: &HashMap<String, f64>) -> Result<()> {
        let rate = self.config.mutation.behavior_rate;

        self.modify_genome(agent_id, true, |genome| {
            let behavior = &mut genome.behavior;
            let traits = [
                (TRAIT_RISK, &mut behavior.risk_tolerance),
                (TRAIT_VERBOSITY, &mut behavior.verbosity),
                (TRAIT_AUTONOMY, &mut behavior.autonomy),
            ];
            for (key, value) in traits {
                let Some(score) = scores.get(key) else {
                    continue;
                };
                if *score > 0.0 {
                    let mut mutator = self.mutator.lock().unwrap_or_else(|e| e.into_inner());
                    *value = mutator.mutate_float(*value, rate, 0.0, 1.0);
                } else {
                    *value = (*value * (1.0 - rate)).max(0.0);
                }
            }

            let fitness = self.behavioral_fitness(agent_id);
            if fitness < PROMPT_ROTATION_THRESHOLD {
                let from = behavior.prompt_style;
                behavior.prompt_style = from.next();
                info!(
                    agent = %agent_id,
                    from = %from,
                    to = %behavior.prompt_style,
                    fitness,
                    "mutated prompt style"
                );
            }

            info!(
                agent = %agent_id,
                risk_tolerance = behavior.risk_tolerance,
                verbosity = behavior.verbosity,
                autonomy = behavior.autonomy,
                prompt_style = %behavior.prompt_style,
                "behavior mutated"
            );
            Ok(())
        })
    }
}
