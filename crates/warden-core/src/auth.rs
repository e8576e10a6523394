//! Credential gate: local-only verification of request identity.
//!
//! Two credential shapes are accepted: a static shared secret bound 1:1 to a
//! persona, or a signed bearer token carrying persona/scope/expiry claims and
//! verified against a pre-shared symmetric key. No network call is ever made to
//! verify a credential; the gate works entirely from configuration.
//!
//! Credentials live only for the duration of one request and are never persisted.

use crate::config::CoreConfig;
use crate::error::{WardenError, WardenResult};
use crate::persona::Persona;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Capability scope a token must carry to submit goals.
pub const REQUIRED_SCOPE: &str = "tools:invoke";

/// Credential extracted from request headers. Ephemeral; dropped after the gate.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Value of the static key header.
    StaticKey(String),
    /// Value of the `Authorization: Bearer` token.
    Bearer(String),
    /// No credential present on the request.
    Missing,
}

/// Claims carried by a signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Persona this token is issued for.
    pub persona: String,
    /// Capability scopes, e.g. ["tools:invoke"].
    pub scopes: Vec<String>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

/// Validates inbound credentials and resolves them to a persona.
pub struct CredentialGate {
    auth_required: bool,
    static_keys: Vec<(Persona, String)>,
    token_key: Option<String>,
}

impl CredentialGate {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            auth_required: config.auth_required,
            static_keys: config.static_keys.clone(),
            token_key: config.token_key.clone(),
        }
    }

    /// Verify a credential against the claimed persona.
    ///
    /// Success returns the resolved persona. Every failure path returns
    /// `AuthDenied` with a reason; the caller records the audit event so that
    /// denial and record stay in one place.
    pub fn verify(&self, credential: &Credential, claimed: Persona) -> WardenResult<Persona> {
        if !self.auth_required {
            return Ok(claimed);
        }
        match credential {
            Credential::Missing => Err(WardenError::AuthDenied(
                "credential required but none presented".into(),
            )),
            Credential::StaticKey(key) => self.verify_static_key(key, claimed),
            Credential::Bearer(token) => self.verify_token(token, claimed),
        }
    }

    fn verify_static_key(&self, presented: &str, claimed: Persona) -> WardenResult<Persona> {
        let configured = self
            .static_keys
            .iter()
            .find(|(p, _)| *p == claimed)
            .map(|(_, k)| k.as_str())
            .ok_or_else(|| {
                WardenError::AuthDenied(format!("no static key configured for persona '{claimed}'"))
            })?;
        if constant_time_eq(configured.as_bytes(), presented.as_bytes()) {
            Ok(claimed)
        } else {
            Err(WardenError::AuthDenied(format!(
                "static key mismatch for persona '{claimed}'"
            )))
        }
    }

    fn verify_token(&self, token: &str, claimed: Persona) -> WardenResult<Persona> {
        let key = self
            .token_key
            .as_deref()
            .ok_or_else(|| WardenError::AuthDenied("token auth not configured".into()))?;

        let (payload_b64, sig_hex) = token
            .split_once('.')
            .ok_or_else(|| WardenError::AuthDenied("malformed token".into()))?;
        let expected = sign_payload(key, payload_b64);
        if !constant_time_eq(expected.as_bytes(), sig_hex.as_bytes()) {
            return Err(WardenError::AuthDenied("token signature mismatch".into()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| WardenError::AuthDenied("malformed token payload".into()))?;
        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|_| WardenError::AuthDenied("malformed token claims".into()))?;

        if claims.exp < chrono::Utc::now().timestamp() {
            return Err(WardenError::AuthDenied("token expired".into()));
        }
        let token_persona = Persona::from_str(&claims.persona)
            .ok_or_else(|| WardenError::AuthDenied("token persona unknown".into()))?;
        if token_persona != claimed {
            return Err(WardenError::AuthDenied(format!(
                "token persona '{token_persona}' does not match claimed '{claimed}'"
            )));
        }
        if !claims.scopes.iter().any(|s| s == REQUIRED_SCOPE) {
            return Err(WardenError::AuthDenied(format!(
                "token missing required scope '{REQUIRED_SCOPE}'"
            )));
        }
        Ok(token_persona)
    }
}

/// Mint a signed token. Operator tooling and tests; the broker never issues
/// tokens on the request path.
pub fn issue_token(key: &str, claims: &TokenClaims) -> WardenResult<String> {
    let payload = serde_json::to_vec(claims)
        .map_err(|e| WardenError::Config(format!("token claims not serializable: {e}")))?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
    let sig = sign_payload(key, &payload_b64);
    Ok(format!("{payload_b64}.{sig}"))
}

fn sign_payload(key: &str, payload_b64: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b".");
    hasher.update(payload_b64.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
