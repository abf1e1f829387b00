//! Governance overlays: VBR (verify before reporting), ADL (anti-divergence
//! limit) and VFM (value for money).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::EvolutionEngine;
use crate::error::{EvolutionError, Result};
use crate::fitness::{compute_fitness, Metrics};
use crate::genome::GenomeConstraints;

/// Complexity floor used when a mutation costs nothing.
pub const MIN_COMPLEXITY: f64 = 0.001;

/// Value-for-money breakdown for one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VfmScore {
    pub fitness_improvement: f64,
    pub token_cost_increase: f64,
    pub latency_increase: f64,
    pub param_count_increase: f64,
    /// fitness_improvement / complexity
    pub score: f64,
}

impl VfmScore {
    /// Whether the mutation meets the genome's minimum VFM score.
    pub fn passes(&self, constraints: &GenomeConstraints) -> bool {
        self.score >= constraints.min_vfm_score
    }
}

/// Score a mutation's fitness gain against the complexity it added. A free
/// improvement yields a very large score rather than an error.
pub fn evaluate_vfm(
    fitness_improvement: f64,
    token_cost_increase: f64,
    latency_increase: f64,
    param_count_increase: f64,
) -> VfmScore {
    let mut complexity = token_cost_increase + latency_increase + param_count_increase;
    if complexity <= 0.0 {
        complexity = MIN_COMPLEXITY;
    }
    VfmScore {
        fitness_improvement,
        token_cost_increase,
        latency_increase,
        param_count_increase,
        score: fitness_improvement / complexity,
    }
}

impl EvolutionEngine {
    /// Re-score a mutated skill from fresh metrics and check that it did not
    /// regress. The `verified` flag is only persisted when the check passes.
    pub fn verify_mutation(
        &self,
        agent_id: &str,
        skill_name: &str,
        metrics: &Metrics,
    ) -> Result<bool> {
        self.genomes.with_slot(agent_id, |slot| {
            let mut genome = slot
                .clone()
                .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
            let skill = genome
                .get_skill_mut(skill_name)
                .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;

            let pre_fitness = skill.parent_fitness.unwrap_or(skill.fitness);
            let post_fitness = compute_fitness(metrics);
            let verified = post_fitness >= pre_fitness;

            if verified {
                skill.verified = true;
                self.genomes.commit(agent_id, slot, genome)?;
            }

            info!(
                agent = %agent_id,
                skill = %skill_name,
                pre_fitness,
                post_fitness,
                verified,
                "mutation verification"
            );
            Ok(verified)
        })
    }

    /// Strategy-level VBR: fresh metrics must score at least what the
    /// strategy it was mutated from had. Only a pass is persisted.
    pub fn verify_strategy_mutation(&self, agent_id: &str, metrics: &Metrics) -> Result<bool> {
        self.strategies.verify_against_parent(agent_id, compute_fitness(metrics))
    }

    /// Store a VFM score on the current strategy and report whether it
    /// meets the agent's genome `min_vfm_score` (0 without a genome).
    pub fn record_strategy_vfm(&self, agent_id: &str, vfm: &VfmScore) -> Result<bool> {
        let constraints = self
            .get_genome(agent_id)
            .map(|g| g.constraints)
            .unwrap_or_default();
        self.strategies.record_vfm_score(agent_id, vfm.score)?;
        Ok(vfm.passes(&constraints))
    }

    /// Cumulative mutation distance: the current strategy version, 0 when
    /// the agent has no strategy.
    pub fn divergence_score(&self, agent_id: &str) -> f64 {
        self.get_strategy(agent_id)
            .map(|s| f64::from(s.version))
            .unwrap_or(0.0)
    }

    /// True once the agent has diverged past `max_divergence`. A limit of 0
    /// or less disables the check.
    pub fn check_adl(&self, agent_id: &str, max_divergence: f64) -> bool {
        if max_divergence <= 0.0 {
            return false;
        }
        self.divergence_score(agent_id) > max_divergence
    }

    /// [`Self::check_adl`] against the limit in the agent's own genome
    /// constraints.
    pub fn exceeds_divergence_limit(&self, agent_id: &str) -> bool {
        let max = self
            .get_genome(agent_id)
            .map(|g| g.constraints.max_divergence)
            .unwrap_or(0.0);
        self.check_adl(agent_id, max)
    }
}
