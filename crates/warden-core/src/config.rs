//! Broker configuration loaded from `.env` / environment.
//!
//! | Env | Default | Description |
//! |-----|---------|--------------|
//! | WARDEN_AUTH_REQUIRED | true | Reject requests without a credential. |
//! | WARDEN_KEY_SRE / _SECOPS / _ANALYST | unset | Static shared secret per persona. |
//! | WARDEN_TOKEN_KEY | unset | Symmetric key for signed-token verification. |
//! | WARDEN_STORAGE_DIR | .warden | Root for tier-2/3 stores and the audit log. |
//! | WARDEN_L1_CAPACITY | 1024 | Tier-1 LRU capacity in record count. |
//! | WARDEN_SANDBOX | false | Run tools inside a bubblewrap namespace sandbox. |
//! | WARDEN_SANDBOX_NET | false | Permit loopback-only network inside the sandbox. |
//! | WARDEN_TOOL_TIMEOUT_SECS | 300 | Hard bound on one tool invocation. |
//! | WARDEN_MAX_CONCURRENT_TOOLS | 8 | Global ceiling on concurrent invocations. |
//! | WARDEN_WATCHDOG_INTERVAL_SECS | 5 | Egress watchdog sweep interval. |
//! | WARDEN_EGRESS_ALLOW | unset | Extra allow-listed CIDRs, comma separated. |
//! | WARDEN_WHITELIST_FILE | unset | TOML file with per-persona whitelist overrides. |

use crate::persona::Persona;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration. Unset or invalid values fall back to the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// When true, a request without a valid credential is rejected before any
    /// whitelist check runs.
    pub auth_required: bool,
    /// Static shared secret per persona (1:1 binding). Unset personas cannot
    /// authenticate with a static key.
    pub static_keys: Vec<(Persona, String)>,
    /// Symmetric verification key for signed bearer tokens. Unset disables token auth.
    pub token_key: Option<String>,
    /// Root directory for durable state: tier-2 SQLite, tier-3 sled, audit log.
    pub storage_dir: PathBuf,
    /// Tier-1 LRU capacity, in records.
    pub l1_capacity: usize,
    /// Run tool invocations inside a bubblewrap namespace sandbox.
    pub sandbox_enabled: bool,
    /// Permit loopback-only network inside the sandbox (opt-in per deployment).
    pub sandbox_allow_network: bool,
    /// Hard timeout for one tool invocation.
    pub tool_timeout: Duration,
    /// Global ceiling on concurrently running tool invocations.
    pub max_concurrent_tools: usize,
    /// Egress watchdog sweep interval.
    pub watchdog_interval: Duration,
    /// Extra allow-listed egress CIDRs on top of loopback/private/link-local.
    pub egress_allow: Vec<String>,
    /// Optional TOML file with per-persona whitelist overrides.
    pub whitelist_file: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            auth_required: true,
            static_keys: Vec::new(),
            token_key: None,
            storage_dir: PathBuf::from(".warden"),
            l1_capacity: 1024,
            sandbox_enabled: false,
            sandbox_allow_network: false,
            tool_timeout: Duration::from_secs(300),
            max_concurrent_tools: 8,
            watchdog_interval: Duration::from_secs(5),
            egress_allow: Vec::new(),
            whitelist_file: None,
        }
    }
}

impl CoreConfig {
    /// Load from environment. Unset or invalid => defaults (see module docs).
    pub fn from_env() -> Self {
        let mut static_keys = Vec::new();
        for (persona, var) in [
            (Persona::Sre, "WARDEN_KEY_SRE"),
            (Persona::Secops, "WARDEN_KEY_SECOPS"),
            (Persona::Analyst, "WARDEN_KEY_ANALYST"),
        ] {
            if let Some(key) = env_opt_string(var) {
                static_keys.push((persona, key));
            }
        }
        Self {
            auth_required: env_bool("WARDEN_AUTH_REQUIRED", true),
            static_keys,
            token_key: env_opt_string("WARDEN_TOKEN_KEY"),
            storage_dir: env_opt_string("WARDEN_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".warden")),
            l1_capacity: env_usize("WARDEN_L1_CAPACITY", 1024),
            sandbox_enabled: env_bool("WARDEN_SANDBOX", false),
            sandbox_allow_network: env_bool("WARDEN_SANDBOX_NET", false),
            tool_timeout: Duration::from_secs(env_u64("WARDEN_TOOL_TIMEOUT_SECS", 300)),
            max_concurrent_tools: env_usize("WARDEN_MAX_CONCURRENT_TOOLS", 8).max(1),
            watchdog_interval: Duration::from_secs(env_u64("WARDEN_WATCHDOG_INTERVAL_SECS", 5).max(1)),
            egress_allow: env_opt_string("WARDEN_EGRESS_ALLOW")
                .map(|s| {
                    s.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            whitelist_file: env_opt_string("WARDEN_WHITELIST_FILE").map(PathBuf::from),
        }
    }

    /// Static key configured for a persona, if any.
    pub fn static_key_for(&self, persona: Persona) -> Option<&str> {
        self.static_keys
            .iter()
            .find(|(p, _)| *p == persona)
            .map(|(_, k)| k.as_str())
    }

    /// Tier-2 SQLite path under the storage root.
    pub fn facts_db_path(&self) -> PathBuf {
        self.storage_dir.join("memory_facts.sqlite3")
    }

    /// Tier-3 sled directory under the storage root.
    pub fn semantic_db_path(&self) -> PathBuf {
        self.storage_dir.join("memory_semantic")
    }

    /// Audit log directory under the storage root.
    pub fn audit_dir(&self) -> PathBuf {
        self.storage_dir.join("audit")
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let t = v.trim();
            if t.is_empty() {
                default
            } else {
                t.eq_ignore_ascii_case("true") || t == "1" || t.eq_ignore_ascii_case("yes")
            }
        }
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let c = CoreConfig::default();
        assert!(c.auth_required);
        assert!(!c.sandbox_enabled);
        assert!(!c.sandbox_allow_network);
        assert!(c.max_concurrent_tools >= 1);
    }

    #[test]
    fn paths_live_under_storage_root() {
        let c = CoreConfig {
            storage_dir: PathBuf::from("/tmp/wtest"),
            ..Default::default()
        };
        assert!(c.facts_db_path().starts_with("/tmp/wtest"));
        assert!(c.semantic_db_path().starts_with("/tmp/wtest"));
        assert!(c.audit_dir().starts_with("/tmp/wtest"));
    }
}
