//! Constraint signing: Ed25519 signatures over a deterministic JSON encoding
//! of [`GenomeConstraints`].
//!
//! The owner holds the secret key. The evolution engine only ever sees the
//! public key and the signature embedded in the genome, so it can detect a
//! tampered constraint block but never produce a valid one.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::genome::GenomeConstraints;

/// Errors from constraint signing/verification.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("missing constraint signature")]
    MissingSignature,
    #[error("missing owner public key")]
    MissingPublicKey,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("key error: {0}")]
    KeyError(String),
}

/// Generate a new Ed25519 key pair. Returns (public_key_bytes, secret_key_bytes).
pub fn generate_owner_keypair() -> Result<([u8; 32], [u8; 32]), SecurityError> {
    let mut csprng = rand::thread_rng();
    let signing_key = SigningKey::generate(&mut csprng);
    let verifying_key = signing_key.verifying_key();
    Ok((verifying_key.to_bytes(), signing_key.to_bytes()))
}

/// Derive the public key belonging to a secret key.
pub fn public_key_for(secret_key_bytes: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(secret_key_bytes)
        .verifying_key()
        .to_bytes()
}

/// Parse a hex-encoded 32-byte key (with or without 0x prefix).
pub fn key_from_hex(hex_str: &str) -> Result<[u8; 32], SecurityError> {
    let s = hex_str.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| SecurityError::KeyError(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| SecurityError::KeyError("key must be 32 bytes".into()))
}

/// Deterministic JSON serialization of constraints.
///
/// Keys are emitted in alphabetical order, list fields are sorted, and
/// integral floats are written without a fractional part (`1000`, not
/// `1000.0`) so that signatures produced by the hub verify here.
pub fn serialize_constraints(c: &GenomeConstraints) -> Result<Vec<u8>, SecurityError> {
    let mut allowed = c.allowed_assets.clone();
    allowed.sort();
    let mut blocked = c.blocked_actions.clone();
    blocked.sort();

    // serde_json::Map is a BTreeMap without the preserve_order feature.
    let ordered = serde_json::json!({
        "allowed_assets": allowed,
        "blocked_actions": blocked,
        "max_divergence": canonical_number(c.max_divergence),
        "max_loss_usd": canonical_number(c.max_loss_usd),
        "min_vfm_score": canonical_number(c.min_vfm_score),
    });
    serde_json::to_vec(&ordered).map_err(|e| SecurityError::Serialization(e.to_string()))
}

fn canonical_number(v: f64) -> serde_json::Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        serde_json::Value::from(v as i64)
    } else {
        serde_json::Value::from(v)
    }
}

/// Sign constraints with the owner's secret key bytes (32 bytes).
pub fn sign_constraints(
    c: &GenomeConstraints,
    secret_key_bytes: &[u8; 32],
) -> Result<Vec<u8>, SecurityError> {
    let signing_key = SigningKey::from_bytes(secret_key_bytes);
    let msg = serialize_constraints(c)?;
    let sig = signing_key.sign(&msg);
    Ok(sig.to_bytes().to_vec())
}

/// Verify a constraint signature against the owner's public key bytes (32 bytes).
///
/// `Ok(false)` means the check ran and the signature does not match;
/// `Err` means the check could not run at all.
pub fn verify_constraints(
    c: &GenomeConstraints,
    signature: &[u8],
    public_key_bytes: &[u8],
) -> Result<bool, SecurityError> {
    if public_key_bytes.len() != 32 {
        return Err(SecurityError::MissingPublicKey);
    }
    if signature.is_empty() {
        return Err(SecurityError::MissingSignature);
    }

    let pk_bytes: [u8; 32] = public_key_bytes
        .try_into()
        .map_err(|_| SecurityError::KeyError("invalid public key length".into()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&pk_bytes).map_err(|e| SecurityError::KeyError(e.to_string()))?;

    // A signature of the wrong length simply does not match
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return Ok(false);
    };
    let sig = Signature::from_bytes(&sig_bytes);

    let msg = serialize_constraints(c)?;
    Ok(verifying_key.verify(&msg, &sig).is_ok())
}
