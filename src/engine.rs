//! The evolution engine.
//!
//! Owns every per-agent table (strategies, genomes, feedback), the seeded
//! mutator and the evolution firewall. Layer 1 and genome operations live
//! here; Layer 2 is in `skills`, Layer 3 in `behavior` and the governance
//! overlays in `governance`.
//!
//! Lock order within one call: strategy or genome slot, then the feedback
//! table, then the mutator.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::behavior::FeedbackStore;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EvolutionError, Result};
use crate::firewall::EvolutionFirewall;
use crate::fitness::Metrics;
use crate::genome::Genome;
use crate::mutation::Mutator;
use crate::store::{GenomeStore, HealthTracker, PersistenceHealth};
use crate::strategy::{Strategy, StrategyStore};

pub struct EvolutionEngine {
    pub(crate) config: Config,
    pub(crate) strategies: StrategyStore,
    pub(crate) genomes: GenomeStore,
    pub(crate) feedback: FeedbackStore,
    pub(crate) mutator: Mutex<Mutator>,
    pub(crate) clock: Arc<dyn Clock>,
    firewall: EvolutionFirewall,
    health: Arc<HealthTracker>,
    dir: PathBuf,
}

impl EvolutionEngine {
    /// Open the engine over `config.data_dir`, reloading persisted
    /// strategies, genomes and firewall snapshots.
    pub fn open(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let dir = config.evolution_dir();
        let health = Arc::new(HealthTracker::default());

        let strategies = StrategyStore::open(&dir, config.strict_persistence, health.clone())?;
        let genomes = GenomeStore::open(&dir, health.clone())?;
        let feedback = FeedbackStore::new(
            config.behavior.feedback_capacity,
            config.behavior.denominator,
        );
        let mutator = match config.mutation.seed {
            Some(seed) => Mutator::seeded(seed),
            None => Mutator::from_entropy(),
        };

        let firewall = EvolutionFirewall::with_clock(config.firewall.clone(), clock.clone());
        if let Err(e) = firewall.snapshots().load(&dir) {
            warn!(error = %e, "failed to load firewall snapshots, starting empty");
        }

        info!(
            dir = %dir.display(),
            genomes = genomes.agents().len(),
            firewall_enabled = config.firewall.enabled,
            "evolution engine opened"
        );

        Ok(Self {
            config,
            strategies,
            genomes,
            feedback,
            mutator: Mutex::new(mutator),
            clock,
            firewall,
            health,
            dir,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Directory holding all evolution files.
    pub fn evolution_dir(&self) -> &Path {
        &self.dir
    }

    pub fn firewall(&self) -> &EvolutionFirewall {
        &self.firewall
    }

    pub fn persistence_health(&self) -> PersistenceHealth {
        self.health.snapshot()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- Layer 1: strategies ----

    pub fn set_strategy(&self, agent_id: &str, strategy: Strategy) -> Result<()> {
        self.strategies.set(agent_id, strategy, self.now())
    }

    pub fn get_strategy(&self, agent_id: &str) -> Option<Strategy> {
        self.strategies.get(agent_id)
    }

    /// Score the agent's strategy against fresh metrics. Unknown agents
    /// score 0.
    pub fn evaluate(&self, agent_id: &str, metrics: &Metrics) -> f64 {
        self.strategies
            .evaluate(agent_id, metrics, self.config.mutation.ema_alpha)
    }

    pub fn mutate(&self, agent_id: &str, mutation_rate: f64) -> Result<Strategy> {
        self.strategies
            .mutate(agent_id, mutation_rate, &self.mutator, self.now())
    }

    pub fn revert(&self, agent_id: &str) -> Result<Strategy> {
        self.strategies.revert(agent_id)
    }

    pub fn should_evolve(&self, agent_id: &str, min_fitness: f64) -> bool {
        self.strategies.should_evolve(agent_id, min_fitness)
    }

    pub fn strategy_history(&self, agent_id: &str) -> Vec<Strategy> {
        self.strategies.history(agent_id)
    }

    // ---- Genomes ----

    pub fn get_genome(&self, agent_id: &str) -> Option<Genome> {
        self.genomes.get(agent_id)
    }

    /// Validate and persist `genome` as the agent's current genome.
    pub fn update_genome(&self, agent_id: &str, genome: Genome) -> Result<()> {
        self.genomes.put(agent_id, genome)
    }

    /// Install a genome after checking its constraint signature.
    pub fn set_genome(&self, agent_id: &str, genome: Genome) -> Result<()> {
        genome.verify_constraints()?;
        self.genomes.put(agent_id, genome)
    }

    pub fn genome_agents(&self) -> Vec<String> {
        self.genomes.agents()
    }

    /// Clone the current genome, check its constraints when `verify` is set,
    /// apply `f` and commit the result. Any error leaves the stored genome
    /// untouched.
    pub(crate) fn modify_genome<T>(
        &self,
        agent_id: &str,
        verify: bool,
        f: impl FnOnce(&mut Genome) -> Result<T>,
    ) -> Result<T> {
        self.genomes.with_slot(agent_id, |slot| {
            let mut genome = slot
                .clone()
                .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
            if verify {
                genome.verify_constraints()?;
            }
            let out = f(&mut genome)?;
            self.genomes.commit(agent_id, slot, genome)?;
            Ok(out)
        })
    }

    // ---- Snapshots ----

    /// Snapshot the agent's current genome into the firewall ring buffer.
    pub fn snapshot_genome(&self, agent_id: &str, fitness: f64) -> Result<()> {
        let genome = self
            .get_genome(agent_id)
            .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
        self.firewall.snapshots().take_snapshot(agent_id, &genome, fitness);
        Ok(())
    }

    /// Restore the most recent snapshot as the agent's genome.
    pub fn rollback_and_restore(&self, agent_id: &str) -> Result<Genome> {
        let genome = self.firewall.snapshots().rollback(agent_id)?;
        self.update_genome(agent_id, genome.clone())?;
        info!(agent = %agent_id, "genome restored from snapshot");
        Ok(genome)
    }

    /// Persist all firewall snapshots.
    pub fn save_snapshots(&self) -> Result<()> {
        self.firewall.snapshots().save(&self.dir)
    }
}
