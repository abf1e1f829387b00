//! Layer 1: the per-agent strategy record.
//!
//! Each agent has one current [`Strategy`] and an unbounded history of
//! archived versions. `mutate` pushes onto the history, `revert` pops it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{EvolutionError, Result};
use crate::fitness::{compute_fitness, fold_ema, Metrics};
use crate::mutation::{Mutator, STRATEGY_PARAM_MAX, STRATEGY_PARAM_MIN};
use crate::store::{self, HealthTracker};

/// Evaluations required before `should_evolve` will consider a strategy.
pub const MIN_EVALS_BEFORE_EVOLVE: u32 = 5;

pub const TEMPERATURE_MIN: f64 = 0.0;
pub const TEMPERATURE_MAX: f64 = 2.0;

/// An agent's current strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Strategy {
    pub id: String,
    pub agent_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub system_prompt: String,
    pub preferred_model: String,
    pub fallback_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Agent-type specific numeric parameters
    pub params: HashMap<String, f64>,
    pub fitness: f64,
    pub eval_count: u32,
    /// Last VBR outcome
    pub verified: bool,
    pub vfm_score: f64,
}

impl Strategy {
    /// The next version of this strategy: temperature and every param
    /// perturbed, track record cleared.
    fn mutated(&self, rate: f64, mutator: &mut Mutator, now: DateTime<Utc>) -> Strategy {
        let version = self.version + 1;
        let params = self
            .params
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    mutator.mutate_float(*v, rate, STRATEGY_PARAM_MIN, STRATEGY_PARAM_MAX),
                )
            })
            .collect();

        Strategy {
            id: format!("{}-v{}", self.agent_id, version),
            agent_id: self.agent_id.clone(),
            version,
            created_at: now,
            system_prompt: self.system_prompt.clone(),
            preferred_model: self.preferred_model.clone(),
            fallback_model: self.fallback_model.clone(),
            temperature: mutator.mutate_float(
                self.temperature,
                rate,
                TEMPERATURE_MIN,
                TEMPERATURE_MAX,
            ),
            max_tokens: self.max_tokens,
            params,
            fitness: 0.0,
            eval_count: 0,
            verified: false,
            vfm_score: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct StrategySlot {
    current: Option<Strategy>,
    history: Vec<Strategy>,
}

/// Current strategy plus history for every agent, persisted as
/// `<agent>.json`.
pub struct StrategyStore {
    dir: PathBuf,
    slots: RwLock<HashMap<String, Arc<Mutex<StrategySlot>>>>,
    health: Arc<HealthTracker>,
    strict: bool,
}

impl StrategyStore {
    /// Open the store, loading every strategy file in `dir`. Genome and
    /// snapshot files living alongside are ignored.
    pub fn open(
        dir: impl Into<PathBuf>,
        strict: bool,
        health: Arc<HealthTracker>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EvolutionError::Persistence {
            path: dir.clone(),
            source: e,
        })?;

        let mut slots = HashMap::new();
        for path in store::json_files(&dir)? {
            if !is_strategy_file(&path) {
                continue;
            }
            match store::read_json::<Strategy>(&path) {
                Ok(Some(s)) if store::validate_agent_id(&s.agent_id).is_ok() => {
                    info!(agent = %s.agent_id, version = s.version, "loaded strategy");
                    let slot = StrategySlot {
                        current: Some(s.clone()),
                        history: Vec::new(),
                    };
                    slots.insert(s.agent_id, Arc::new(Mutex::new(slot)));
                }
                Ok(_) => {
                    warn!(path = %path.display(), "skipping strategy file without valid agentId")
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable strategy file")
                }
            }
        }

        Ok(Self {
            dir,
            slots: RwLock::new(slots),
            health,
            strict,
        })
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}.json"))
    }

    fn slot(&self, agent_id: &str) -> Arc<Mutex<StrategySlot>> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, agent_id: &str) -> Option<Arc<Mutex<StrategySlot>>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    /// Write `s` to disk. Failures are recorded and only returned in strict
    /// mode.
    fn save(&self, s: &Strategy) -> Result<()> {
        match store::write_json(&self.path_for(&s.agent_id), s) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(agent = %s.agent_id, error = %e, "failed to save strategy");
                self.health.record_failure(&e, Utc::now());
                if self.strict {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Install `strategy` as the agent's current strategy. History is kept.
    pub fn set(&self, agent_id: &str, mut strategy: Strategy, now: DateTime<Utc>) -> Result<()> {
        store::validate_agent_id(agent_id)?;
        strategy.agent_id = agent_id.to_string();
        strategy.created_at = now;

        let slot = self.slot(agent_id);
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.save(&strategy)?;
        info!(agent = %agent_id, version = strategy.version, "strategy set");
        slot.current = Some(strategy);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<Strategy> {
        let slot = self.existing_slot(agent_id)?;
        let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.current.clone()
    }

    /// Fold fresh metrics into the agent's fitness. Unknown agents score 0.
    pub fn evaluate(&self, agent_id: &str, metrics: &Metrics, alpha: f64) -> f64 {
        let Some(slot) = self.existing_slot(agent_id) else {
            return 0.0;
        };
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let Some(s) = slot.current.as_mut() else {
            return 0.0;
        };

        let raw = compute_fitness(metrics);
        s.fitness = fold_ema(s.fitness, raw, alpha, s.eval_count == 0);
        s.eval_count += 1;

        info!(
            agent = %agent_id,
            fitness = s.fitness,
            eval_count = s.eval_count,
            raw_fitness = raw,
            "strategy evaluated"
        );

        let fitness = s.fitness;
        if let Some(s) = slot.current.as_ref() {
            // Evaluate has no error channel; save() has already logged and
            // recorded any failure.
            let _ = self.save(s);
        }
        fitness
    }

    /// Archive the current strategy and install a mutated successor.
    pub fn mutate(
        &self,
        agent_id: &str,
        rate: f64,
        mutator: &Mutex<Mutator>,
        now: DateTime<Utc>,
    ) -> Result<Strategy> {
        let slot = self
            .existing_slot(agent_id)
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let current = slot
            .current
            .clone()
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;

        let mutated = {
            let mut mutator = mutator.lock().unwrap_or_else(|e| e.into_inner());
            current.mutated(rate, &mut mutator, now)
        };
        self.save(&mutated)?;

        slot.history.push(current);
        slot.current = Some(mutated.clone());

        info!(
            agent = %agent_id,
            version = mutated.version,
            mutation_rate = rate,
            "strategy mutated"
        );
        Ok(mutated)
    }

    /// Restore the most recently archived strategy.
    pub fn revert(&self, agent_id: &str) -> Result<Strategy> {
        let slot = self
            .existing_slot(agent_id)
            .ok_or_else(|| EvolutionError::NoHistory(agent_id.to_string()))?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let prev = slot
            .history
            .last()
            .cloned()
            .ok_or_else(|| EvolutionError::NoHistory(agent_id.to_string()))?;

        self.save(&prev)?;
        slot.history.pop();
        slot.current = Some(prev.clone());

        info!(agent = %agent_id, version = prev.version, "strategy reverted");
        Ok(prev)
    }

    pub fn should_evolve(&self, agent_id: &str, min_fitness: f64) -> bool {
        match self.get(agent_id) {
            Some(s) if s.eval_count >= MIN_EVALS_BEFORE_EVOLVE => s.fitness < min_fitness,
            _ => false,
        }
    }

    pub fn history_len(&self, agent_id: &str) -> usize {
        self.existing_slot(agent_id)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).history.len())
            .unwrap_or(0)
    }

    /// Archived strategies, oldest first.
    pub fn history(&self, agent_id: &str) -> Vec<Strategy> {
        self.existing_slot(agent_id)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).history.clone())
            .unwrap_or_default()
    }

    /// VBR for the current strategy: `post_fitness` must reach the fitness
    /// of the strategy it was mutated from (its own fitness when there is no
    /// history). Compare and write happen under one lock; only a pass is
    /// persisted.
    pub fn verify_against_parent(&self, agent_id: &str, post_fitness: f64) -> Result<bool> {
        let slot = self
            .existing_slot(agent_id)
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = slot
            .current
            .clone()
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;

        let pre_fitness = slot.history.last().map_or(updated.fitness, |s| s.fitness);
        let verified = post_fitness >= pre_fitness;
        if verified {
            updated.verified = true;
            self.save(&updated)?;
            slot.current = Some(updated.clone());
        }

        info!(
            agent = %agent_id,
            version = updated.version,
            pre_fitness,
            post_fitness,
            verified,
            "strategy mutation verification"
        );
        Ok(verified)
    }

    /// Store a VFM score on the current strategy.
    pub fn record_vfm_score(&self, agent_id: &str, score: f64) -> Result<()> {
        let slot = self
            .existing_slot(agent_id)
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = slot
            .current
            .clone()
            .ok_or_else(|| EvolutionError::strategy_not_found(agent_id))?;
        updated.vfm_score = score;
        self.save(&updated)?;
        slot.current = Some(updated);
        Ok(())
    }
}

fn is_strategy_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.ends_with("-genome.json") && n != crate::firewall::SNAPSHOT_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitness::{
        METRIC_AVG_RESPONSE_MS, METRIC_COST_USD, METRIC_PROFIT_LOSS, METRIC_SUCCESS_RATE,
    };

    fn open(dir: &Path) -> StrategyStore {
        StrategyStore::open(dir, false, Arc::new(HealthTracker::default())).unwrap()
    }

    fn base_strategy() -> Strategy {
        Strategy {
            system_prompt: "You are a trading assistant.".to_string(),
            preferred_model: "claude-sonnet".to_string(),
            fallback_model: "local-small".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            params: HashMap::from([
                ("threshold".to_string(), 100.0),
                ("window".to_string(), -20.0),
            ]),
            ..Default::default()
        }
    }

    fn good_metrics() -> Metrics {
        Metrics::from([
            (METRIC_SUCCESS_RATE.to_string(), 0.9),
            (METRIC_COST_USD.to_string(), 0.1),
            (METRIC_AVG_RESPONSE_MS.to_string(), 500.0),
            (METRIC_PROFIT_LOSS.to_string(), 0.5),
        ])
    }

    #[test]
    fn test_set_stamps_agent_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let now = Utc::now();
        store.set("a1", base_strategy(), now).unwrap();

        let s = store.get("a1").unwrap();
        assert_eq!(s.agent_id, "a1");
        assert_eq!(s.created_at, now);
        assert!(store.path_for("a1").exists());
        assert!(store.get("a2").is_none());
    }

    #[test]
    fn test_evaluate_ema() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.set("a1", base_strategy(), Utc::now()).unwrap();

        let raw = compute_fitness(&good_metrics());
        assert_eq!(store.evaluate("a1", &good_metrics(), 0.3), raw);
        assert_eq!(store.get("a1").unwrap().eval_count, 1);

        let poor = Metrics::from([(METRIC_PROFIT_LOSS.to_string(), -2.0)]);
        let second = store.evaluate("a1", &poor, 0.3);
        let expected = 0.3 * compute_fitness(&poor) + 0.7 * raw;
        assert!((second - expected).abs() < 1e-12);
        assert_eq!(store.get("a1").unwrap().eval_count, 2);
    }

    #[test]
    fn test_evaluate_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(store.evaluate("ghost", &good_metrics(), 0.3), 0.0);
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn test_mutate_archives_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(11));
        store.set("a1", base_strategy(), Utc::now()).unwrap();
        store.evaluate("a1", &good_metrics(), 0.3);

        let m = store.mutate("a1", 0.5, &mutator, Utc::now()).unwrap();
        assert_eq!(m.version, 1);
        assert_eq!(m.id, "a1-v1");
        assert_eq!(m.fitness, 0.0);
        assert_eq!(m.eval_count, 0);
        assert!((m.temperature - 0.735).abs() < 1e-12 || (m.temperature - 0.665).abs() < 1e-12);
        let threshold = m.params["threshold"];
        assert!(threshold == 105.0 || threshold == 95.0);
        assert_eq!(m.system_prompt, base_strategy().system_prompt);
        assert_eq!(m.max_tokens, 2048);
        assert_eq!(store.history_len("a1"), 1);

        let m2 = store.mutate("a1", 0.5, &mutator, Utc::now()).unwrap();
        assert_eq!(m2.id, "a1-v2");
        assert_eq!(store.history_len("a1"), 2);
    }

    #[test]
    fn test_mutate_temperature_stays_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(3));
        store
            .set(
                "a1",
                Strategy {
                    temperature: 1.99,
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();
        for _ in 0..30 {
            let m = store.mutate("a1", 1.0, &mutator, Utc::now()).unwrap();
            assert!((TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&m.temperature));
        }
    }

    #[test]
    fn test_mutate_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(1));
        let err = store.mutate("ghost", 0.1, &mutator, Utc::now()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.history_len("ghost"), 0);
    }

    #[test]
    fn test_mutate_then_revert_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(8));
        store.set("a1", base_strategy(), Utc::now()).unwrap();
        store.evaluate("a1", &good_metrics(), 0.3);
        let before = store.get("a1").unwrap();

        store.mutate("a1", 0.3, &mutator, Utc::now()).unwrap();
        let restored = store.revert("a1").unwrap();
        assert_eq!(restored, before);
        assert_eq!(store.get("a1").unwrap(), before);
        assert_eq!(store.history_len("a1"), 0);

        assert!(matches!(store.revert("a1"), Err(EvolutionError::NoHistory(_))));
        assert!(matches!(store.revert("ghost"), Err(EvolutionError::NoHistory(_))));
    }

    #[test]
    fn test_should_evolve_needs_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.set("a1", base_strategy(), Utc::now()).unwrap();
        let bad = Metrics::from([
            (METRIC_PROFIT_LOSS.to_string(), -5.0),
            (METRIC_COST_USD.to_string(), 99.0),
        ]);

        for _ in 0..4 {
            store.evaluate("a1", &bad, 0.3);
            assert!(!store.should_evolve("a1", 0.9));
        }
        store.evaluate("a1", &bad, 0.3);
        assert!(store.should_evolve("a1", 0.9));
        assert!(!store.should_evolve("a1", 0.0));
        assert!(!store.should_evolve("ghost", 0.9));
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set("a1", base_strategy(), Utc::now()).unwrap();
            store.evaluate("a1", &good_metrics(), 0.3);
        }
        fs::write(dir.path().join("a2-genome.json"), "{}").unwrap();
        fs::write(dir.path().join("junk.json"), "[1,2").unwrap();

        let store = open(dir.path());
        let s = store.get("a1").unwrap();
        assert_eq!(s.eval_count, 1);
        assert_eq!(s.params["threshold"], 100.0);
        assert!(store.get("a2").is_none());
        assert_eq!(store.history_len("a1"), 0);
    }

    #[test]
    fn test_camel_case_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.set("a1", base_strategy(), Utc::now()).unwrap();
        let raw = fs::read_to_string(store.path_for("a1")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["agentId"], "a1");
        assert_eq!(json["maxTokens"], 2048);
        assert_eq!(json["evalCount"], 0);
        assert!(json.get("systemPrompt").is_some());
        assert!(json.get("vfmScore").is_some());
    }

    #[test]
    fn test_strict_mode_propagates_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let health = Arc::new(HealthTracker::default());
        let strict = StrategyStore::open(dir.path(), true, health.clone()).unwrap();
        fs::create_dir_all(strict.path_for("a1")).unwrap();

        let err = strict.set("a1", base_strategy(), Utc::now()).unwrap_err();
        assert!(matches!(err, EvolutionError::Persistence { .. }));
        assert!(strict.get("a1").is_none());
        assert_eq!(health.snapshot().failures, 1);

        let lenient = StrategyStore::open(dir.path(), false, health.clone()).unwrap();
        lenient.set("a1", base_strategy(), Utc::now()).unwrap();
        assert!(lenient.get("a1").is_some());
        assert_eq!(health.snapshot().failures, 2);
    }

    #[test]
    fn test_concurrent_mutate_keeps_history_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(3));
        store.set("a1", base_strategy(), Utc::now()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        store.mutate("a1", 0.1, &mutator, Utc::now()).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get("a1").unwrap().version, 400);
        let versions: Vec<u32> = store.history("a1").iter().map(|s| s.version).collect();
        assert_eq!(versions, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_mutate_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(5));
        store.set("a1", base_strategy(), Utc::now()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        store.mutate("a1", 0.1, &mutator, Utc::now()).unwrap();
                        store.mutate("a1", 0.1, &mutator, Utc::now()).unwrap();
                        // Another thread may have emptied the history first
                        let _ = store.revert("a1");
                    }
                });
            }
        });

        // Starting from version 0, the current version always equals the
        // number of archived ancestors
        let current = store.get("a1").unwrap();
        let history = store.history("a1");
        assert_eq!(current.version as usize, history.len());
        for (i, s) in history.iter().enumerate() {
            assert_eq!(s.version as usize, i);
        }
    }

    #[test]
    fn test_verify_against_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mutator = Mutex::new(Mutator::seeded(11));
        assert!(store.verify_against_parent("a1", 1.0).unwrap_err().is_not_found());

        store.set("a1", base_strategy(), Utc::now()).unwrap();
        store.evaluate("a1", &good_metrics(), 0.3);
        let parent = store.get("a1").unwrap().fitness;
        store.mutate("a1", 0.1, &mutator, Utc::now()).unwrap();

        assert!(!store.verify_against_parent("a1", parent - 0.01).unwrap());
        assert!(!store.get("a1").unwrap().verified);
        assert!(store.verify_against_parent("a1", parent).unwrap());
        assert!(store.get("a1").unwrap().verified);

        let reopened = open(dir.path());
        assert!(reopened.get("a1").unwrap().verified);
    }

    #[test]
    fn test_set_rejects_path_like_agent_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        for bad in ["../a1", "firewall-snapshots", "a1-genome", ""] {
            assert!(matches!(
                store.set(bad, base_strategy(), Utc::now()),
                Err(EvolutionError::InvalidAgentId(..))
            ));
            assert!(store.get(bad).is_none());
        }
    }

    #[test]
    fn test_open_skips_invalid_agent_id_in_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.json"), r#"{"agentId": "../escape"}"#).unwrap();
        let store = open(dir.path());
        assert!(store.get("../escape").is_none());
    }
}
