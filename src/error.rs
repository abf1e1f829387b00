use std::path::PathBuf;

use crate::security::SecurityError;

/// Errors surfaced by the evolution core.
///
/// Rate limiting and an open circuit are not errors; they come back from
/// [`crate::firewall::EvolutionFirewall::pre_mutation_check`] as a
/// [`crate::firewall::GateDecision`].
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("no {kind} found for agent {agent_id}{}", name_suffix(.name))]
    NotFound {
        kind: &'static str,
        agent_id: String,
        name: Option<String>,
    },

    #[error("no history for agent {0}")]
    NoHistory(String),

    #[error("no snapshots for agent {0}")]
    NoSnapshots(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid agent id {0:?}: {1}")]
    InvalidAgentId(String, &'static str),

    #[error("invalid constraint signature")]
    InvalidSignature,

    #[error("constraint verification failed: {0}")]
    VerificationFailed(#[from] SecurityError),

    #[error(
        "circuit breaker tripped: fitness dropped from {old_fitness:.4} to {new_fitness:.4} \
         ({drop_pct:.1}% drop, threshold {threshold_pct:.0}%)"
    )]
    CircuitTripped {
        old_fitness: f64,
        new_fitness: f64,
        drop_pct: f64,
        threshold_pct: f64,
    },

    #[error("persistence failed for {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl EvolutionError {
    pub fn strategy_not_found(agent_id: &str) -> Self {
        Self::NotFound {
            kind: "strategy",
            agent_id: agent_id.to_string(),
            name: None,
        }
    }

    pub fn genome_not_found(agent_id: &str) -> Self {
        Self::NotFound {
            kind: "genome",
            agent_id: agent_id.to_string(),
            name: None,
        }
    }

    pub fn skill_not_found(agent_id: &str, skill_name: &str) -> Self {
        Self::NotFound {
            kind: "skill",
            agent_id: agent_id.to_string(),
            name: Some(skill_name.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::NoHistory(_) | Self::NoSnapshots(_)
        )
    }
}

fn name_suffix(name: &Option<String>) -> String {
    name.as_deref().map(|n| format!(": {n}")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, EvolutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_messages() {
        let e = EvolutionError::strategy_not_found("a1");
        assert_eq!(e.to_string(), "no strategy found for agent a1");

        let e = EvolutionError::skill_not_found("a1", "trading");
        assert_eq!(e.to_string(), "no skill found for agent a1: trading");
        assert!(e.is_not_found());
        assert!(!EvolutionError::InvalidSignature.is_not_found());
    }

    #[test]
    fn test_circuit_tripped_message() {
        let e = EvolutionError::CircuitTripped {
            old_fitness: 1.0,
            new_fitness: 0.5,
            drop_pct: 50.0,
            threshold_pct: 30.0,
        };
        let msg = e.to_string();
        assert!(msg.contains("1.0000"));
        assert!(msg.contains("0.5000"));
        assert!(msg.contains("50.0% drop"));
    }
}
