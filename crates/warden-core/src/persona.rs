//! Operator personas: the closed set of identities the broker brokers for.
//!
//! A persona is fixed at build time. It owns a whitelist entry and a memory
//! namespace. There is no open-ended string-keyed persona lookup and no implicit
//! default: an unknown persona name is a hard error at the gate.

use serde::{Deserialize, Serialize};

/// Fixed operator identity. Each variant owns a tool whitelist and a memory namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    /// Site reliability: read-only infrastructure tooling.
    Sre,
    /// Security operations: scanning and inspection tooling.
    Secops,
    /// Data analysis: query and aggregation tooling.
    Analyst,
}

/// All personas, in declaration order. The whitelist table iterates this.
pub const ALL_PERSONAS: [Persona; 3] = [Persona::Sre, Persona::Secops, Persona::Analyst];

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Sre => "sre",
            Persona::Secops => "secops",
            Persona::Analyst => "analyst",
        }
    }

    /// Parses a persona name. "ops" is accepted as a legacy alias of "sre".
    /// Unknown or empty names return None; callers treat that as a denial.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sre" | "ops" => Some(Persona::Sre),
            "secops" | "security" => Some(Persona::Secops),
            "analyst" | "data" => Some(Persona::Analyst),
            _ => None,
        }
    }

    /// Memory namespace for this persona. Tier 2 and 3 records are keyed by it,
    /// so personas never read each other's durable state.
    #[inline]
    pub fn namespace(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
