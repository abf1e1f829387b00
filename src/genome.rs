use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::error::{EvolutionError, Result};
use crate::security;

/// Complete genome defining an agent's identity, skills, behavior, and constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub identity: GenomeIdentity,
    #[serde(default, deserialize_with = "null_as_default")]
    pub skills: HashMap<String, SkillGenome>,
    pub behavior: GenomeBehavior,
    #[serde(default)]
    pub constraints: GenomeConstraints,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub constraint_signature: Vec<u8>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub owner_public_key: Vec<u8>,
}

/// Agent identity layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeIdentity {
    pub name: String,
    pub persona: String,
    pub voice: String, // concise, verbose, balanced, etc.
}

/// A single skill parameter. Numbers keep their integer/float distinction
/// through a JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Other(serde_json::Value),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Other(v) => v.as_str(),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Other(serde_json::Value::String(v.to_string()))
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64().filter(|_| !n.is_f64()) {
                    Self::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    Self::Other(serde_json::Value::Number(n))
                }
            }
            other => Self::Other(other),
        }
    }
}

/// Per-skill genome with evolvable parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillGenome {
    pub enabled: bool,
    #[serde(default)]
    pub weight: f64, // Layer 2: skill importance weight (0.0-1.0)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: HashMap<String, ParamValue>,
    #[serde(default)]
    pub fitness: f64,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>, // Layer 2: skills this skill depends on
    #[serde(default)]
    pub eval_count: u32, // Layer 2: number of evaluations
    #[serde(default)]
    pub verified: bool, // VBR: last mutation verified
    #[serde(default)]
    pub vfm_score: f64, // VFM: value-for-money of last mutation
    /// Fitness the skill had right before its last mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fitness: Option<f64>,
}

/// Prompt styles in rotation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Concise,
    #[default]
    Balanced,
    Detailed,
    Socratic,
}

impl PromptStyle {
    pub const ROTATION: [PromptStyle; 4] = [
        PromptStyle::Concise,
        PromptStyle::Balanced,
        PromptStyle::Detailed,
        PromptStyle::Socratic,
    ];

    /// The style after this one in [`Self::ROTATION`], wrapping around.
    pub fn next(self) -> Self {
        let idx = Self::ROTATION
            .iter()
            .position(|s| *s == self)
            .unwrap_or(0);
        Self::ROTATION[(idx + 1) % Self::ROTATION.len()]
    }
}

impl std::str::FromStr for PromptStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "concise" => Ok(Self::Concise),
            "balanced" => Ok(Self::Balanced),
            "detailed" => Ok(Self::Detailed),
            "socratic" => Ok(Self::Socratic),
            other => Err(format!("unknown prompt style: {other}")),
        }
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concise => write!(f, "concise"),
            Self::Balanced => write!(f, "balanced"),
            Self::Detailed => write!(f, "detailed"),
            Self::Socratic => write!(f, "socratic"),
        }
    }
}

/// Behavioral traits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeBehavior {
    pub risk_tolerance: f64, // 0.0-1.0
    pub verbosity: f64,      // 0.0-1.0
    pub autonomy: f64,       // 0.0-1.0
    #[serde(default, deserialize_with = "lenient_prompt_style")]
    pub prompt_style: PromptStyle, // Layer 3
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_preferences: HashMap<String, f64>, // Layer 3: tool usage weights
    #[serde(default, deserialize_with = "null_as_default")]
    pub response_patterns: Vec<String>, // Layer 3: evolved response templates
}

/// Hard constraints (non-evolvable)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenomeConstraints {
    #[serde(default)]
    pub max_loss_usd: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allowed_assets: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub blocked_actions: Vec<String>,
    #[serde(default)]
    pub max_divergence: f64, // ADL: max mutation distance from original
    #[serde(default)]
    pub min_vfm_score: f64, // VFM: minimum value-for-money threshold
}

/// User feedback on agent behavior (Layer 3)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorFeedback {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    /// "approval", "completion", "engagement", "correction", "dismissal", ...
    #[serde(rename = "type")]
    pub feedback_type: String,
    /// -1.0 to 1.0
    pub score: f64,
    pub context: String,
}

impl Default for Genome {
    fn default() -> Self {
        Self {
            identity: GenomeIdentity {
                name: "unnamed-agent".to_string(),
                persona: "helpful, reliable".to_string(),
                voice: "balanced".to_string(),
            },
            skills: HashMap::new(),
            behavior: GenomeBehavior {
                risk_tolerance: 0.3,
                verbosity: 0.5,
                autonomy: 0.5,
                prompt_style: PromptStyle::Balanced,
                tool_preferences: HashMap::new(),
                response_patterns: vec![],
            },
            constraints: GenomeConstraints {
                max_loss_usd: 1000.0,
                allowed_assets: vec![],
                blocked_actions: vec![],
                max_divergence: 0.0,
                min_vfm_score: 0.0,
            },
            constraint_signature: vec![],
            owner_public_key: vec![],
        }
    }
}

impl Genome {
    /// Validate genome structure
    pub fn validate(&self) -> Result<()> {
        let traits = [
            ("risk_tolerance", self.behavior.risk_tolerance),
            ("verbosity", self.behavior.verbosity),
            ("autonomy", self.behavior.autonomy),
        ];
        for (name, value) in traits {
            if !(0.0..=1.0).contains(&value) {
                return Err(EvolutionError::InvalidRange(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if self.constraints.max_loss_usd < 0.0 {
            return Err(EvolutionError::InvalidRange(
                "max_loss_usd cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// True when neither a signature nor an owner key is attached.
    pub fn is_unsigned(&self) -> bool {
        self.constraint_signature.is_empty() && self.owner_public_key.is_empty()
    }

    /// Check the owner's signature over the constraint block.
    ///
    /// Unsigned genomes pass with a warning (legacy mode). A half-signed
    /// genome (only one of key/signature present) fails.
    pub fn verify_constraints(&self) -> Result<()> {
        if self.is_unsigned() {
            warn!(
                agent = %self.identity.name,
                "genome has unsigned constraints, backward-compat mode"
            );
            return Ok(());
        }
        let ok = security::verify_constraints(
            &self.constraints,
            &self.constraint_signature,
            &self.owner_public_key,
        )?;
        if !ok {
            return Err(EvolutionError::InvalidSignature);
        }
        Ok(())
    }

    /// Sign the current constraints with the owner's secret key and embed
    /// the signature together with the matching public key.
    pub fn sign_constraints(&mut self, secret_key: &[u8; 32]) -> Result<()> {
        let signature = security::sign_constraints(&self.constraints, secret_key)?;
        self.constraint_signature = signature;
        self.owner_public_key = security::public_key_for(secret_key).to_vec();
        Ok(())
    }

    /// Get a skill by name, enabled or not
    pub fn get_skill(&self, skill_name: &str) -> Option<&SkillGenome> {
        self.skills.get(skill_name)
    }

    /// Get mutable reference to a skill
    pub fn get_skill_mut(&mut self, skill_name: &str) -> Option<&mut SkillGenome> {
        self.skills.get_mut(skill_name)
    }

    /// Set or update a skill
    pub fn set_skill(&mut self, skill_name: impl Into<String>, skill: SkillGenome) {
        self.skills.insert(skill_name.into(), skill);
    }

    /// List all enabled skill names, sorted
    pub fn enabled_skills(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .skills
            .iter()
            .filter(|(_, skill)| skill.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Fraction of a skill's dependencies that are present and enabled.
    /// 1.0 when the skill has no dependencies.
    pub fn dependency_satisfaction(&self, skill: &SkillGenome) -> f64 {
        if skill.dependencies.is_empty() {
            return 1.0;
        }
        let satisfied = skill
            .dependencies
            .iter()
            .filter(|dep| self.skills.get(*dep).is_some_and(|d| d.enabled))
            .count();
        satisfied as f64 / skill.dependencies.len() as f64
    }
}

impl SkillGenome {
    /// Enabled skill with weight 1.0 and the given parameters
    pub fn new(params: HashMap<String, ParamValue>) -> Self {
        Self {
            enabled: true,
            weight: 1.0,
            params,
            ..Default::default()
        }
    }

    /// Get a parameter as a float64
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| v.as_f64())
    }

    /// Get a parameter as an integer
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_i64())
    }

    /// Get a parameter as a string
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Get a parameter as a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Hub-written genomes may carry an empty or unknown style; those load as
/// the default.
fn lenient_prompt_style<'de, D>(deserializer: D) -> std::result::Result<PromptStyle, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
}

/// Byte fields travel as standard base64 strings, the encoding the hub uses.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(de::Error::custom),
        }
    }
}
