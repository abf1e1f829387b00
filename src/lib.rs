pub mod behavior;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod fitness;
pub mod genome;
pub mod governance;
pub mod mutation;
pub mod security;
pub mod skills;
pub mod store;
pub mod strategy;

pub use engine::EvolutionEngine;
pub use error::{EvolutionError, Result};
