use evoclaw_evolution::clock::ManualClock;
use evoclaw_evolution::config::Config;
use evoclaw_evolution::firewall::{CircuitState, GateDecision};
use evoclaw_evolution::fitness::{compute_fitness, Metrics};
use evoclaw_evolution::genome::{Genome, ParamValue, SkillGenome};
use evoclaw_evolution::strategy::Strategy;
use evoclaw_evolution::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn engine_at(dir: &Path, clock: Arc<ManualClock>) -> EvolutionEngine {
    let mut config = Config::with_data_dir(dir);
    config.mutation.seed = Some(7);
    config.firewall.max_mutations_per_hour = 3;
    EvolutionEngine::with_clock(config, clock).unwrap()
}

fn metrics(success: f64, cost: f64, latency_ms: f64, pnl: f64) -> Metrics {
    Metrics::from([
        ("successRate".to_string(), success),
        ("costUSD".to_string(), cost),
        ("avgResponseMs".to_string(), latency_ms),
        ("profitLoss".to_string(), pnl),
    ])
}

fn trading_genome() -> Genome {
    let mut g = Genome::default();
    g.identity.name = "trader-1".to_string();
    g.set_skill(
        "trading",
        SkillGenome::new(HashMap::from([
            ("threshold".to_string(), ParamValue::Float(0.02)),
            ("max_positions".to_string(), ParamValue::Int(4)),
            ("hedge".to_string(), ParamValue::Bool(false)),
        ])),
    );
    g
}

/// First evaluation installs the raw fitness, the second blends via EMA
#[test]
fn test_evaluate_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), Arc::new(ManualClock::default()));
    engine.set_strategy("agent-1", Strategy::default()).unwrap();

    let m = metrics(0.9, 0.1, 500.0, 0.5);
    let raw = compute_fitness(&m);
    assert_eq!(engine.evaluate("agent-1", &m), raw);
    let s = engine.get_strategy("agent-1").unwrap();
    assert_eq!(s.eval_count, 1);

    let m2 = metrics(0.5, 0.0, 0.0, 0.0);
    let blended = engine.evaluate("agent-1", &m2);
    assert!((blended - (0.3 * compute_fitness(&m2) + 0.7 * raw)).abs() < 1e-12);
    assert_eq!(engine.get_strategy("agent-1").unwrap().eval_count, 2);
}

/// Mutate then Revert restores the exact previous strategy
#[test]
fn test_mutate_revert_restores_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), Arc::new(ManualClock::default()));
    engine
        .set_strategy(
            "agent-1",
            Strategy {
                temperature: 0.8,
                params: HashMap::from([("risk".to_string(), 10.0)]),
                ..Default::default()
            },
        )
        .unwrap();
    engine.evaluate("agent-1", &metrics(0.7, 0.2, 100.0, 0.0));
    let before = engine.get_strategy("agent-1").unwrap();

    let mutated = engine.mutate("agent-1", 0.5).unwrap();
    assert_eq!(mutated.version, before.version + 1);
    assert_ne!(mutated, before);

    engine.revert("agent-1").unwrap();
    assert_eq!(engine.get_strategy("agent-1").unwrap(), before);
    assert!(engine.strategy_history("agent-1").is_empty());
}

/// Orchestrator loop: evaluate, gate, mutate, post-check, roll back on collapse
#[test]
fn test_orchestrator_cycle_with_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = engine_at(dir.path(), clock.clone());
    let agent = "agent-1";
    engine.update_genome(agent, trading_genome()).unwrap();

    // Warm up the skill
    for _ in 0..5 {
        engine
            .evaluate_skill(agent, "trading", &metrics(0.2, 2.0, 3000.0, -0.8))
            .unwrap();
    }
    assert!(engine.should_evolve_skill(agent, "trading", 0.6, 5).unwrap());
    let old_fitness = engine.get_genome(agent).unwrap().skills["trading"].fitness;

    // Gate, snapshot, mutate
    assert!(engine.firewall().pre_mutation_check(agent).is_allowed());
    engine.snapshot_genome(agent, old_fitness).unwrap();
    let mutated = engine.mutate_skill(agent, "trading", 0.3).unwrap();
    assert_eq!(mutated.version, 1);
    assert_eq!(mutated.parent_fitness, Some(old_fitness));

    // The mutation collapses fitness
    let new_fitness = engine
        .evaluate_skill(agent, "trading", &metrics(0.0, 50.0, 20_000.0, -5.0))
        .unwrap();
    assert!(new_fitness < old_fitness * 0.7);

    let err = engine
        .firewall()
        .post_mutation_check(agent, old_fitness, new_fitness)
        .unwrap_err();
    assert!(matches!(err, EvolutionError::CircuitTripped { .. }));
    assert_eq!(engine.firewall().breaker().state(agent), CircuitState::Open);

    let restored = engine.rollback_and_restore(agent).unwrap();
    assert_eq!(restored.skills["trading"].version, 0);
    assert_eq!(engine.get_genome(agent).unwrap().skills["trading"].fitness, old_fitness);

    // Blocked until the cooldown passes, then exactly one trial
    match engine.firewall().pre_mutation_check(agent) {
        GateDecision::Blocked(reason) => assert!(reason.starts_with("circuit breaker")),
        other => panic!("expected block, got {other:?}"),
    }
    clock.advance(chrono::Duration::hours(1));
    assert!(engine.firewall().pre_mutation_check(agent).is_allowed());
    assert!(!engine.firewall().pre_mutation_check(agent).is_allowed());

    let status = engine.firewall().status(agent);
    assert_eq!(status.snapshot_count, 1);
    assert_eq!(status.circuit_breaker_state, CircuitState::HalfOpen);
}

/// Rate limiter caps mutations per agent per hour
#[test]
fn test_rate_limit_across_hour() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = engine_at(dir.path(), clock.clone());

    for _ in 0..3 {
        assert!(engine.firewall().pre_mutation_check("a").is_allowed());
    }
    assert_eq!(
        engine.firewall().pre_mutation_check("a"),
        GateDecision::Blocked("rate limit exceeded".to_string())
    );
    assert!(engine.firewall().pre_mutation_check("b").is_allowed());

    clock.advance(chrono::Duration::minutes(61));
    assert_eq!(engine.firewall().status("a").rate_limit_remaining, 3);
}

/// Strategies, genomes and snapshots all survive a restart
#[test]
fn test_reload_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = engine_at(dir.path(), Arc::new(ManualClock::default()));
        engine.set_strategy("agent-1", Strategy::default()).unwrap();
        engine.mutate("agent-1", 0.1).unwrap();
        engine.update_genome("agent-1", trading_genome()).unwrap();
        engine.snapshot_genome("agent-1", 0.5).unwrap();
        engine.save_snapshots().unwrap();
    }

    let engine = engine_at(dir.path(), Arc::new(ManualClock::default()));
    assert_eq!(engine.get_strategy("agent-1").unwrap().version, 1);
    assert_eq!(engine.get_genome("agent-1"), Some(trading_genome()));
    assert_eq!(engine.firewall().snapshots().snapshot_count("agent-1"), 1);
    // History is in-memory only
    assert!(matches!(engine.revert("agent-1"), Err(EvolutionError::NoHistory(_))));
}

/// A signed genome whose constraints were edited refuses every mutation path
#[test]
fn test_tampered_genome_blocks_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), Arc::new(ManualClock::default()));
    let (public_key, secret_key) = security::generate_owner_keypair().unwrap();

    let mut g = trading_genome();
    g.sign_constraints(&secret_key).unwrap();
    assert_eq!(g.owner_public_key, public_key.to_vec());
    engine.set_genome("agent-1", g.clone()).unwrap();

    // Signed genome mutates fine
    engine.mutate_skill("agent-1", "trading", 0.2).unwrap();

    let mut tampered = engine.get_genome("agent-1").unwrap();
    tampered.constraints.max_loss_usd = 1e9;
    engine.update_genome("agent-1", tampered.clone()).unwrap();

    assert!(matches!(
        engine.mutate_skill("agent-1", "trading", 0.2),
        Err(EvolutionError::InvalidSignature)
    ));
    assert!(engine.optimize_skill_weights("agent-1").is_err());
    assert!(engine.mutate_behavior("agent-1", &HashMap::new()).is_err());
    assert_eq!(engine.get_genome("agent-1"), Some(tampered));
}

/// Unsigned genomes are accepted in legacy mode
#[test]
fn test_unsigned_genome_passes_verification() {
    let g = trading_genome();
    assert!(g.is_unsigned());
    assert!(g.verify_constraints().is_ok());
}
