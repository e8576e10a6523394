//! Persona tool whitelists: the only source of truth for what may run.
//!
//! Pure lookup, no runtime state. Everything not enumerated is denied; there is no
//! deny list and no wildcard persona. The default table is static; operators may
//! replace individual persona entries from a TOML file, but never with an empty list.

use crate::error::{WardenError, WardenResult};
use crate::persona::{Persona, ALL_PERSONAS};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Default whitelist per persona. Authored explicitly; reviewed on change.
const SRE_TOOLS: &[&str] = &[
    "kubectl-get",
    "kubectl get",
    "terraform-plan",
    "terraform plan",
    "log-aggregator",
    "prometheus-query",
];

const SECOPS_TOOLS: &[&str] = &[
    "nmap",
    "bandit-scan",
    "bandit",
    "iam-inspect",
    "vault-read",
];

const ANALYST_TOOLS: &[&str] = &[
    "sql-query",
    "csv-report",
    "metrics-export",
];

/// Normalizes a tool name for matching: lowercase, single internal spaces.
fn norm(tool: &str) -> String {
    tool.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when `tool` matches `pattern`: exact, or the pattern is a prefix
/// terminated by a separator. "kubectl-get" matches "kubectl-get" and
/// "kubectl-get pods", never "kubectl-delete".
fn pattern_matches(pattern: &str, tool: &str) -> bool {
    if tool == pattern {
        return true;
    }
    if let Some(rest) = tool.strip_prefix(pattern) {
        return rest.starts_with(' ') || rest.starts_with('-');
    }
    false
}

#[derive(Debug, Deserialize)]
struct WhitelistFile {
    #[serde(default)]
    personas: HashMap<String, Vec<String>>,
}

/// Persona → ordered tool-pattern table. Cheap to clone at startup, read-only after.
#[derive(Debug, Clone)]
pub struct WhitelistTable {
    entries: HashMap<Persona, Vec<String>>,
}

impl WhitelistTable {
    /// The static build-time table.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(Persona::Sre, to_owned(SRE_TOOLS));
        entries.insert(Persona::Secops, to_owned(SECOPS_TOOLS));
        entries.insert(Persona::Analyst, to_owned(ANALYST_TOOLS));
        Self { entries }
    }

    /// Builtin table with per-persona replacements from a TOML file:
    ///
    /// ```toml
    /// [personas]
    /// sre = ["kubectl-get", "helm-status"]
    /// ```
    ///
    /// An override that would leave a persona with an empty list is a hard
    /// configuration error, never a silent fallback.
    pub fn load_with_overrides(path: &Path) -> WardenResult<Self> {
        let mut table = Self::builtin();
        let content = std::fs::read_to_string(path)?;
        let file: WhitelistFile = toml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("whitelist file {}: {e}", path.display())))?;
        for (name, patterns) in file.personas {
            let persona = Persona::from_str(&name)
                .ok_or_else(|| WardenError::UnknownPersona(name.clone()))?;
            let patterns: Vec<String> = patterns
                .iter()
                .map(|p| norm(p))
                .filter(|p| !p.is_empty())
                .collect();
            if patterns.is_empty() {
                return Err(WardenError::Config(format!(
                    "whitelist override for '{persona}' is empty; every persona needs an explicit non-empty list"
                )));
            }
            table.entries.insert(persona, patterns);
        }
        Ok(table)
    }

    /// Replaces one persona's entry. Test and operator tooling only; empty lists are rejected.
    pub fn with_entry(mut self, persona: Persona, patterns: &[&str]) -> WardenResult<Self> {
        if patterns.is_empty() {
            return Err(WardenError::Config(format!(
                "whitelist entry for '{persona}' must not be empty"
            )));
        }
        self.entries.insert(persona, to_owned(patterns));
        Ok(self)
    }

    /// The ordered pattern list for a persona. Invariant: never empty.
    pub fn allowed_tools(&self, persona: Persona) -> Vec<String> {
        self.entries.get(&persona).cloned().unwrap_or_default()
    }

    /// Best-matching whitelist pattern for a tool name, or None (= denial).
    ///
    /// When multiple patterns match, the most specific (longest) literal wins.
    /// Matching patterns are all prefixes of the normalized tool name, so two
    /// distinct patterns of equal length can never both match; there is no
    /// ambiguous tie to resolve.
    pub fn match_entry(&self, persona: Persona, tool: &str) -> Option<String> {
        let tool = norm(tool);
        if tool.is_empty() {
            return None;
        }
        let patterns = self.entries.get(&persona)?;
        patterns
            .iter()
            .filter(|p| pattern_matches(p, &tool))
            .max_by_key(|p| p.len())
            .cloned()
    }

    /// Pure allow check: true iff the tool matches an entry configured for the persona.
    pub fn is_allowed(&self, persona: Persona, tool: &str) -> bool {
        self.match_entry(persona, tool).is_some()
    }

    /// Sanity check: every persona has a non-empty, explicitly authored list.
    pub fn validate(&self) -> WardenResult<()> {
        for p in ALL_PERSONAS {
            match self.entries.get(&p) {
                Some(list) if !list.is_empty() => {}
                _ => {
                    return Err(WardenError::Config(format!(
                        "persona '{p}' has no whitelist entry"
                    )))
                }
            }
        }
        Ok(())
    }
}

fn to_owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| norm(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_allows() {
        let t = WhitelistTable::builtin();
        assert!(t.is_allowed(Persona::Sre, "kubectl-get"));
        assert!(t.is_allowed(Persona::Sre, "Kubectl-Get"));
        assert!(t.is_allowed(Persona::Secops, "nmap"));
    }

    #[test]
    fn prefix_needs_separator() {
        let t = WhitelistTable::builtin();
        assert!(t.is_allowed(Persona::Sre, "kubectl-get pods"));
        assert!(t.is_allowed(Persona::Sre, "kubectl-get-pods"));
        assert!(!t.is_allowed(Persona::Sre, "kubectl-getx"));
        assert!(!t.is_allowed(Persona::Sre, "kubectl-delete"));
    }

    #[test]
    fn default_is_deny() {
        let t = WhitelistTable::builtin();
        assert!(!t.is_allowed(Persona::Sre, "nmap"));
        assert!(!t.is_allowed(Persona::Secops, "kubectl-get"));
        assert!(!t.is_allowed(Persona::Sre, ""));
        assert!(!t.is_allowed(Persona::Analyst, "delete-deployment"));
    }

    #[test]
    fn most_specific_literal_wins() {
        let t = WhitelistTable::builtin()
            .with_entry(Persona::Sre, &["kubectl", "kubectl-get"])
            .unwrap();
        assert_eq!(
            t.match_entry(Persona::Sre, "kubectl-get"),
            Some("kubectl-get".to_string())
        );
    }

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        let t = WhitelistTable::builtin();
        assert!(t.is_allowed(Persona::Sre, "  Terraform   Plan "));
        assert_eq!(
            t.match_entry(Persona::Sre, "TERRAFORM PLAN"),
            Some("terraform plan".to_string())
        );
    }

    #[test]
    fn empty_override_rejected() {
        let err = WhitelistTable::builtin().with_entry(Persona::Sre, &[]);
        assert!(err.is_err());
    }

    #[test]
    fn builtin_validates() {
        WhitelistTable::builtin().validate().unwrap();
    }
}
