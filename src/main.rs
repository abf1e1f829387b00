use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use evoclaw_evolution::config::Config;
use evoclaw_evolution::engine::EvolutionEngine;
use evoclaw_evolution::genome::Genome;
use evoclaw_evolution::security;

/// EvoClaw evolution core - owner key tooling and state inspection
#[derive(Parser, Debug)]
#[command(name = "evoclaw-evolve", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new Ed25519 owner keypair (hex)
    Keygen,

    /// Sign a genome's constraints and embed the signature and public key
    Sign {
        /// Genome JSON file, rewritten in place
        #[arg(short, long)]
        genome: PathBuf,

        /// Owner secret key (hex, optional 0x prefix)
        #[arg(short, long)]
        secret_key: String,
    },

    /// Validate a genome and verify its constraint signature
    Verify {
        #[arg(short, long)]
        genome: PathBuf,
    },

    /// Print strategy, genome summary and firewall status for an agent
    Status {
        /// Root data directory
        #[arg(short, long, default_value = "./data")]
        data_dir: PathBuf,

        /// TOML config file; overrides --data-dir
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Agent ID
        #[arg(short, long)]
        agent: String,
    },
}

fn read_genome(path: &Path) -> Result<Genome, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn keygen() -> Result<(), Box<dyn std::error::Error>> {
    let (public_key, secret_key) = security::generate_owner_keypair()?;
    let out = json!({
        "public_key": hex::encode(public_key),
        "secret_key": hex::encode(secret_key),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn sign(genome_path: &Path, secret_hex: &str) -> Result<(), Box<dyn std::error::Error>> {
    let secret = security::key_from_hex(secret_hex)?;
    let mut genome = read_genome(genome_path)?;
    genome.validate()?;
    genome.sign_constraints(&secret)?;
    std::fs::write(genome_path, serde_json::to_string_pretty(&genome)?)?;
    info!(
        genome = %genome_path.display(),
        public_key = %hex::encode(&genome.owner_public_key),
        "constraints signed"
    );
    Ok(())
}

fn verify(genome_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let genome = read_genome(genome_path)?;
    genome.validate()?;
    genome.verify_constraints()?;
    if genome.is_unsigned() {
        println!("unsigned (legacy mode)");
    } else {
        println!("constraints verified");
    }
    Ok(())
}

fn status(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    agent_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::with_data_dir(data_dir),
    };
    let engine = EvolutionEngine::open(config)?;

    let genome = engine.get_genome(agent_id).map(|g| {
        json!({
            "name": g.identity.name,
            "skills": g.skills.len(),
            "enabled_skills": g.enabled_skills(),
            "prompt_style": g.behavior.prompt_style,
            "signed": !g.is_unsigned(),
        })
    });

    let out = json!({
        "agent": agent_id,
        "strategy": engine.get_strategy(agent_id),
        "strategy_history": engine.strategy_history(agent_id).len(),
        "divergence": engine.divergence_score(agent_id),
        "genome": genome,
        "firewall": engine.firewall().status(agent_id),
        "persistence": engine.persistence_health(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Keygen => keygen(),
        Command::Sign { genome, secret_key } => sign(&genome, &secret_key),
        Command::Verify { genome } => verify(&genome),
        Command::Status {
            data_dir,
            config,
            agent,
        } => status(data_dir, config, &agent),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
