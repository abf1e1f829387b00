//! Evolution Firewall (Security Layer 3).
//!
//! Three independent mechanisms composed into one gate that every mutation
//! path passes through:
//!
//! - a sliding one-hour mutation rate limiter,
//! - a per-agent circuit breaker keyed on fitness drop,
//! - a bounded ring buffer of genome snapshots for rollback.
//!
//! Each mechanism keeps its own lock, so a status query on one never waits
//! on another.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{EvolutionError, Result};
use crate::genome::Genome;
use crate::store;

/// File holding every agent's snapshots, inside the evolution directory.
pub const SNAPSHOT_FILE: &str = "firewall-snapshots.json";

/// Cooldowns longer than this are treated as this (about 100 years).
const MAX_COOLDOWN_SECS: u64 = 100 * 365 * 24 * 3600;

fn rate_window() -> Duration {
    Duration::hours(1)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration for the evolution firewall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_mutations_per_hour")]
    pub max_mutations_per_hour: usize,
    /// Fractional drop that trips the breaker, e.g. 0.30 = 30%
    #[serde(default = "default_fitness_drop_threshold")]
    pub fitness_drop_threshold: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_max_mutations_per_hour() -> usize {
    10
}

fn default_fitness_drop_threshold() -> f64 {
    0.30
}

fn default_cooldown_secs() -> u64 {
    3600
}

fn default_max_snapshots() -> usize {
    10
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_mutations_per_hour: default_max_mutations_per_hour(),
            fitness_drop_threshold: default_fitness_drop_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

impl FirewallConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs.min(MAX_COOLDOWN_SECS) as i64)
    }
}

/// Outcome of a pre-mutation check. Being blocked is an expected steady
/// state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed(String),
    Blocked(String),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            GateDecision::Allowed(r) | GateDecision::Blocked(r) => r,
        }
    }
}

// ---- Rate Limiter ----

/// Tracks mutations per agent over a sliding one-hour window.
pub struct MutationRateLimiter {
    records: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    max_per_hour: usize,
    clock: Arc<dyn Clock>,
}

impl MutationRateLimiter {
    pub fn new(max_per_hour: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_per_hour,
            clock,
        }
    }

    /// Consume one unit of the agent's hourly budget if any is left.
    pub fn allow_mutation(&self, agent_id: &str) -> bool {
        let now = self.clock.now();
        let cutoff = now - rate_window();

        let mut records = lock(&self.records);
        let timestamps = records.entry(agent_id.to_string()).or_default();
        while timestamps.front().is_some_and(|t| *t <= cutoff) {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.max_per_hour {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Mutations left in the current window, without consuming any.
    pub fn remaining(&self, agent_id: &str) -> usize {
        let cutoff = self.clock.now() - rate_window();
        let records = lock(&self.records);
        let used = records
            .get(agent_id)
            .map(|ts| ts.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0);
        self.max_per_hour.saturating_sub(used)
    }

    pub fn max_per_hour(&self) -> usize {
        self.max_per_hour
    }

    pub fn reset(&self, agent_id: &str) {
        lock(&self.records).remove(agent_id);
    }
}

// ---- Circuit Breaker ----

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "half-open")]
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
struct AgentCircuit {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    last_fitness: f64,
    /// HalfOpen only: when the single trial mutation was handed out. A
    /// trial with no result after one cooldown is handed out again.
    trial_taken_at: Option<DateTime<Utc>>,
}

impl AgentCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            last_fitness: 0.0,
            trial_taken_at: None,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_taken_at = None;
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.opened_at.map_or(true, |t| now - t >= cooldown)
    }

    fn trial_pending(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.trial_taken_at.is_some_and(|t| now - t < cooldown)
    }
}

/// Blocks mutations for an agent after a severe fitness regression until a
/// cooldown passes and one trial mutation holds its ground.
pub struct CircuitBreaker {
    agents: Mutex<HashMap<String, AgentCircuit>>,
    fitness_threshold: f64,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(fitness_drop_threshold: f64, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            fitness_threshold: fitness_drop_threshold,
            cooldown,
            clock,
        }
    }

    /// Check whether a mutation may proceed. An Open circuit whose cooldown
    /// has elapsed moves to HalfOpen here and hands out its one trial.
    pub fn should_allow_mutation(&self, agent_id: &str) -> GateDecision {
        let now = self.clock.now();
        let mut agents = lock(&self.agents);
        let Some(ac) = agents.get_mut(agent_id) else {
            return GateDecision::Allowed("no circuit state".to_string());
        };

        match ac.state {
            CircuitState::Closed => GateDecision::Allowed("circuit closed".to_string()),
            CircuitState::Open => {
                if ac.cooldown_elapsed(now, self.cooldown) {
                    ac.state = CircuitState::HalfOpen;
                    ac.trial_taken_at = Some(now);
                    info!(agent = %agent_id, "circuit half-open, cooldown elapsed");
                    GateDecision::Allowed("circuit half-open (cooldown elapsed)".to_string())
                } else {
                    let since = ac
                        .opened_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    GateDecision::Blocked(format!("circuit open since {since}"))
                }
            }
            CircuitState::HalfOpen => {
                if ac.trial_pending(now, self.cooldown) {
                    return GateDecision::Blocked(
                        "circuit half-open, trial mutation pending".to_string(),
                    );
                }
                if ac.trial_taken_at.is_some() {
                    warn!(agent = %agent_id, "trial mutation never reported, re-arming trial");
                }
                ac.trial_taken_at = Some(now);
                GateDecision::Allowed("circuit half-open (trial mutation)".to_string())
            }
        }
    }

    /// Hand a HalfOpen trial back without recording a result, for when the
    /// mutation it was reserved for never ran.
    pub fn release_trial(&self, agent_id: &str) {
        if let Some(ac) = lock(&self.agents).get_mut(agent_id) {
            if ac.state == CircuitState::HalfOpen {
                ac.trial_taken_at = None;
            }
        }
    }

    /// Record the result of a mutation. Returns true if the breaker tripped.
    pub fn record_result(&self, agent_id: &str, old_fitness: f64, new_fitness: f64) -> bool {
        let now = self.clock.now();
        let mut agents = lock(&self.agents);
        let ac = agents
            .entry(agent_id.to_string())
            .or_insert_with(AgentCircuit::new);

        ac.last_fitness = new_fitness;

        match ac.state {
            CircuitState::HalfOpen => {
                if new_fitness >= old_fitness {
                    ac.state = CircuitState::Closed;
                    ac.opened_at = None;
                    ac.trial_taken_at = None;
                    info!(agent = %agent_id, "circuit closed after successful trial");
                    false
                } else {
                    ac.open(now);
                    warn!(
                        agent = %agent_id,
                        old_fitness,
                        new_fitness,
                        "trial mutation regressed, circuit reopened"
                    );
                    true
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                if old_fitness <= 0.0 {
                    return false;
                }
                let drop = (old_fitness - new_fitness) / old_fitness;
                if drop > self.fitness_threshold {
                    ac.open(now);
                    warn!(
                        agent = %agent_id,
                        old_fitness,
                        new_fitness,
                        drop,
                        "circuit breaker tripped"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current state. An Open circuit past its cooldown reads as HalfOpen;
    /// the transition itself happens on the next allow check.
    pub fn state(&self, agent_id: &str) -> CircuitState {
        let now = self.clock.now();
        match lock(&self.agents).get(agent_id) {
            None => CircuitState::Closed,
            Some(ac)
                if ac.state == CircuitState::Open && ac.cooldown_elapsed(now, self.cooldown) =>
            {
                CircuitState::HalfOpen
            }
            Some(ac) => ac.state,
        }
    }

    /// Fitness reported by the most recent result, if any.
    pub fn last_fitness(&self, agent_id: &str) -> Option<f64> {
        lock(&self.agents).get(agent_id).map(|ac| ac.last_fitness)
    }

    /// Force the circuit closed for an agent.
    pub fn reset(&self, agent_id: &str) {
        lock(&self.agents).remove(agent_id);
    }
}

// ---- Genome Snapshots / Rollback ----

/// A complete genome state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeSnapshot {
    pub timestamp: DateTime<Utc>,
    pub genome: Genome,
    pub fitness: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AgentSnapshots {
    snapshots: VecDeque<GenomeSnapshot>,
}

impl AgentSnapshots {
    fn push(&mut self, snap: GenomeSnapshot, max: usize) {
        self.snapshots.push_back(snap);
        self.trim(max);
    }

    fn trim(&mut self, max: usize) {
        while self.snapshots.len() > max {
            self.snapshots.pop_front();
        }
    }
}

/// Per-agent ring buffer of genome snapshots.
pub struct SnapshotStore {
    agents: Mutex<HashMap<String, AgentSnapshots>>,
    max_snaps: usize,
    clock: Arc<dyn Clock>,
}

impl SnapshotStore {
    pub fn new(max_snapshots: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            max_snaps: max_snapshots.max(1),
            clock,
        }
    }

    /// Save a copy of `genome`. The oldest snapshot is evicted once the
    /// buffer is full.
    pub fn take_snapshot(&self, agent_id: &str, genome: &Genome, fitness: f64) {
        let snap = GenomeSnapshot {
            timestamp: self.clock.now(),
            genome: genome.clone(),
            fitness,
        };
        let mut agents = lock(&self.agents);
        agents
            .entry(agent_id.to_string())
            .or_default()
            .push(snap, self.max_snaps);
        debug!(agent = %agent_id, fitness, "genome snapshot taken");
    }

    /// The most recent snapshot's genome for the agent.
    pub fn rollback(&self, agent_id: &str) -> Result<Genome> {
        self.latest(agent_id)
            .map(|s| s.genome)
            .ok_or_else(|| EvolutionError::NoSnapshots(agent_id.to_string()))
    }

    pub fn latest(&self, agent_id: &str) -> Option<GenomeSnapshot> {
        lock(&self.agents)
            .get(agent_id)
            .and_then(|a| a.snapshots.back().cloned())
    }

    /// All snapshots for an agent, oldest first.
    pub fn snapshots(&self, agent_id: &str) -> Vec<GenomeSnapshot> {
        lock(&self.agents)
            .get(agent_id)
            .map(|a| a.snapshots.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_snapshot_time(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.agents)
            .get(agent_id)
            .and_then(|a| a.snapshots.back().map(|s| s.timestamp))
    }

    pub fn snapshot_count(&self, agent_id: &str) -> usize {
        lock(&self.agents)
            .get(agent_id)
            .map(|a| a.snapshots.len())
            .unwrap_or(0)
    }

    /// Persist all snapshots to `<dir>/firewall-snapshots.json`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let agents = lock(&self.agents);
        store::write_json(&dir.join(SNAPSHOT_FILE), &*agents)
    }

    /// Restore snapshots from `<dir>/firewall-snapshots.json`. A missing file
    /// leaves the store untouched.
    pub fn load(&self, dir: &Path) -> Result<()> {
        let Some(mut loaded) =
            store::read_json::<HashMap<String, AgentSnapshots>>(&dir.join(SNAPSHOT_FILE))?
        else {
            return Ok(());
        };
        for snaps in loaded.values_mut() {
            snaps.trim(self.max_snaps);
        }
        info!(agents = loaded.len(), "loaded firewall snapshots");
        *lock(&self.agents) = loaded;
        Ok(())
    }
}

// ---- Evolution Firewall (combines all three) ----

/// Firewall status returned for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallStatus {
    pub enabled: bool,
    pub rate_limit_remaining: usize,
    pub max_mutations_per_hour: usize,
    pub circuit_breaker_state: CircuitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub snapshot_count: usize,
}

/// Rate limiter, circuit breaker and snapshot store behind one gate.
pub struct EvolutionFirewall {
    config: FirewallConfig,
    limiter: MutationRateLimiter,
    breaker: CircuitBreaker,
    snapshots: SnapshotStore,
}

impl EvolutionFirewall {
    pub fn new(config: FirewallConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FirewallConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: MutationRateLimiter::new(config.max_mutations_per_hour, clock.clone()),
            breaker: CircuitBreaker::new(
                config.fitness_drop_threshold,
                config.cooldown(),
                clock.clone(),
            ),
            snapshots: SnapshotStore::new(config.max_snapshots, clock),
            config,
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn limiter(&self) -> &MutationRateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Circuit breaker first, then the rate limiter. A blocked circuit
    /// short-circuits without touching the rate budget.
    pub fn pre_mutation_check(&self, agent_id: &str) -> GateDecision {
        if !self.config.enabled {
            return GateDecision::Allowed("firewall disabled".to_string());
        }

        let breaker = self.breaker.should_allow_mutation(agent_id);
        if let GateDecision::Blocked(reason) = breaker {
            debug!(agent = %agent_id, reason = %reason, "mutation blocked by circuit breaker");
            return GateDecision::Blocked(format!("circuit breaker: {reason}"));
        }

        if !self.limiter.allow_mutation(agent_id) {
            self.breaker.release_trial(agent_id);
            debug!(agent = %agent_id, "mutation blocked by rate limiter");
            return GateDecision::Blocked("rate limit exceeded".to_string());
        }

        breaker
    }

    /// Feed a mutation result to the breaker. A trip comes back as
    /// [`EvolutionError::CircuitTripped`]; the caller should roll back.
    pub fn post_mutation_check(
        &self,
        agent_id: &str,
        old_fitness: f64,
        new_fitness: f64,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.breaker.record_result(agent_id, old_fitness, new_fitness) {
            let drop_pct = if old_fitness > 0.0 {
                (old_fitness - new_fitness) / old_fitness * 100.0
            } else {
                0.0
            };
            return Err(EvolutionError::CircuitTripped {
                old_fitness,
                new_fitness,
                drop_pct,
                threshold_pct: self.config.fitness_drop_threshold * 100.0,
            });
        }
        Ok(())
    }

    /// Clear breaker and rate-limit state for an agent.
    pub fn reset(&self, agent_id: &str) {
        self.breaker.reset(agent_id);
        self.limiter.reset(agent_id);
        info!(agent = %agent_id, "firewall state reset");
    }

    pub fn status(&self, agent_id: &str) -> FirewallStatus {
        FirewallStatus {
            enabled: self.config.enabled,
            rate_limit_remaining: self.limiter.remaining(agent_id),
            max_mutations_per_hour: self.config.max_mutations_per_hour,
            circuit_breaker_state: self.breaker.state(agent_id),
            last_snapshot_time: self.snapshots.last_snapshot_time(agent_id),
            snapshot_count: self.snapshots.snapshot_count(agent_id),
        }
    }
}
