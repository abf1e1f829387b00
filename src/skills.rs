//! Layer 2: skill evolution within an agent's genome.

use tracing::{info, warn};

use crate::engine::EvolutionEngine;
use crate::error::{EvolutionError, Result};
use crate::fitness::{compute_fitness, fold_ema, Metrics};
use crate::genome::SkillGenome;
use crate::governance::VfmScore;

/// A skill is only considered for disabling after this many evaluations.
pub const DISABLE_MIN_EVALS: u32 = 10;
pub const DISABLE_MAX_FITNESS: f64 = 0.2;
pub const DISABLE_MAX_WEIGHT: f64 = 0.1;

impl EvolutionEngine {
    /// Fold fresh metrics into one skill's fitness.
    pub fn evaluate_skill(
        &self,
        agent_id: &str,
        skill_name: &str,
        metrics: &Metrics,
    ) -> Result<f64> {
        let alpha = self.config.mutation.ema_alpha;
        self.modify_genome(agent_id, false, |genome| {
            let skill = genome
                .get_skill_mut(skill_name)
                .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;

            let raw = compute_fitness(metrics);
            skill.fitness = fold_ema(skill.fitness, raw, alpha, skill.eval_count == 0);
            skill.eval_count += 1;

            info!(
                agent = %agent_id,
                skill = %skill_name,
                fitness = skill.fitness,
                eval_count = skill.eval_count,
                "skill evaluated"
            );
            Ok(skill.fitness)
        })
    }

    /// Perturb a skill's parameters and start a new version. Refuses to run
    /// on a genome whose constraint signature does not verify.
    pub fn mutate_skill(
        &self,
        agent_id: &str,
        skill_name: &str,
        mutation_rate: f64,
    ) -> Result<SkillGenome> {
        self.modify_genome(agent_id, true, |genome| {
            let skill = genome
                .get_skill_mut(skill_name)
                .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;

            {
                let mut mutator = self.mutator.lock().unwrap_or_else(|e| e.into_inner());
                for value in skill.params.values_mut() {
                    *value = mutator.mutate_param(value, mutation_rate);
                }
            }

            skill.version += 1;
            skill.parent_fitness = Some(skill.fitness);
            skill.fitness = 0.0;
            skill.eval_count = 0;
            skill.verified = false;

            info!(
                agent = %agent_id,
                skill = %skill_name,
                version = skill.version,
                mutation_rate,
                "skill mutated"
            );
            Ok(skill.clone())
        })
    }

    /// Whether an enabled skill with at least `min_samples` evaluations has
    /// fallen below `min_fitness`.
    pub fn should_evolve_skill(
        &self,
        agent_id: &str,
        skill_name: &str,
        min_fitness: f64,
        min_samples: u32,
    ) -> Result<bool> {
        let genome = self
            .get_genome(agent_id)
            .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
        let skill = genome
            .get_skill(skill_name)
            .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;

        if !skill.enabled || skill.eval_count < min_samples {
            return Ok(false);
        }
        Ok(skill.fitness < min_fitness)
    }

    /// Advisory contribution score:
    /// `0.4 * fitness + 0.3 * weight + 0.3 * dependency satisfaction`.
    /// Missing genome or skill scores 0.
    pub fn evaluate_skill_contribution(&self, agent_id: &str, skill_name: &str) -> f64 {
        let Some(genome) = self.get_genome(agent_id) else {
            return 0.0;
        };
        let Some(skill) = genome.get_skill(skill_name) else {
            return 0.0;
        };

        let contribution =
            0.4 * skill.fitness + 0.3 * skill.weight + 0.3 * genome.dependency_satisfaction(skill);

        info!(
            agent = %agent_id,
            skill = %skill_name,
            contribution,
            fitness = skill.fitness,
            weight = skill.weight,
            "evaluated skill contribution"
        );
        contribution
    }

    /// Rebalance the weights of enabled, evaluated skills in proportion to
    /// their fitness.
    pub fn optimize_skill_weights(&self, agent_id: &str) -> Result<()> {
        self.genomes.with_slot(agent_id, |slot| {
            let mut genome = slot
                .clone()
                .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
            genome.verify_constraints()?;

            let total: f64 = genome
                .skills
                .values()
                .filter(|s| s.enabled && s.eval_count > 0)
                .map(|s| s.fitness)
                .sum();

            if total <= 0.0 {
                warn!(agent = %agent_id, "no fitness data for weight optimization");
                return Ok(());
            }

            for (name, skill) in genome.skills.iter_mut() {
                if !skill.enabled || skill.eval_count == 0 {
                    continue;
                }
                skill.weight = (skill.fitness / total).clamp(0.0, 1.0);
                info!(
                    agent = %agent_id,
                    skill = %name,
                    weight = skill.weight,
                    fitness = skill.fitness,
                    "optimized skill weight"
                );
            }

            self.genomes.commit(agent_id, slot, genome)
        })
    }

    /// True for an enabled skill that is consistently underperforming.
    pub fn should_disable_skill(&self, agent_id: &str, skill_name: &str) -> bool {
        let Some(genome) = self.get_genome(agent_id) else {
            return false;
        };
        let Some(skill) = genome.get_skill(skill_name) else {
            return false;
        };

        let disable = skill.enabled
            && skill.eval_count >= DISABLE_MIN_EVALS
            && skill.fitness < DISABLE_MAX_FITNESS
            && skill.weight < DISABLE_MAX_WEIGHT;

        if disable {
            warn!(
                agent = %agent_id,
                skill = %skill_name,
                fitness = skill.fitness,
                weight = skill.weight,
                eval_count = skill.eval_count,
                "skill marked for disabling"
            );
        }
        disable
    }

    /// True for a disabled skill whose dependencies are all enabled.
    pub fn should_enable_skill(&self, agent_id: &str, skill_name: &str) -> bool {
        let Some(genome) = self.get_genome(agent_id) else {
            return false;
        };
        let Some(skill) = genome.get_skill(skill_name) else {
            return false;
        };
        if skill.enabled {
            return false;
        }

        let deps_enabled = skill
            .dependencies
            .iter()
            .all(|dep| genome.get_skill(dep).is_some_and(|d| d.enabled));
        if deps_enabled {
            info!(
                agent = %agent_id,
                skill = %skill_name,
                reason = "dependencies satisfied",
                "skill marked for re-enabling"
            );
        }
        deps_enabled
    }

    /// Apply an enable/disable decision to a skill.
    pub fn set_skill_enabled(&self, agent_id: &str, skill_name: &str, enabled: bool) -> Result<()> {
        self.modify_genome(agent_id, true, |genome| {
            let skill = genome
                .get_skill_mut(skill_name)
                .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;
            skill.enabled = enabled;
            info!(agent = %agent_id, skill = %skill_name, enabled, "skill toggled");
            Ok(())
        })
    }

    /// Overall fitness minus the mean fitness of the enabled skills.
    /// Positive means the skills synergize. 0 when nothing is enabled.
    pub fn composition_fitness(&self, agent_id: &str, metrics: &Metrics) -> f64 {
        let Some(genome) = self.get_genome(agent_id) else {
            return 0.0;
        };
        let enabled: Vec<f64> = genome
            .skills
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.fitness)
            .collect();
        if enabled.is_empty() {
            return 0.0;
        }

        let avg_individual = enabled.iter().sum::<f64>() / enabled.len() as f64;
        let overall = compute_fitness(metrics);
        let score = overall - avg_individual;

        info!(
            agent = %agent_id,
            overall_fitness = overall,
            avg_individual_fitness = avg_individual,
            composition_score = score,
            "composition fitness evaluated"
        );
        score
    }

    /// Store a skill's VFM score and report whether it meets the genome's
    /// `min_vfm_score`.
    pub fn record_skill_vfm(
        &self,
        agent_id: &str,
        skill_name: &str,
        vfm: &VfmScore,
    ) -> Result<bool> {
        self.modify_genome(agent_id, false, |genome| {
            let passes = vfm.passes(&genome.constraints);
            let skill = genome
                .get_skill_mut(skill_name)
                .ok_or_else(|| EvolutionError::skill_not_found(agent_id, skill_name))?;
            skill.vfm_score = vfm.score;
            info!(
                agent = %agent_id,
                skill = %skill_name,
                vfm_score = vfm.score,
                passes,
                "skill vfm recorded"
            );
            Ok(passes)
        })
    }
}
