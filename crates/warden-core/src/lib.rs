//! warden-core: local security broker between an untrusted planner and host
//! capabilities (credential gate, persona whitelists, isolated tool execution,
//! egress watchdog, tiered memory, append-only audit).
//!
//! Re-exported as one flat surface so the gateway and operator tooling share a
//! consistent public API.

mod audit;
mod auth;
mod config;
mod error;
mod executor;
mod intake;
mod memory;
mod persona;
mod sandbox;
mod watchdog;
mod whitelist;
mod wipe;

// Error taxonomy
pub use error::{WardenError, WardenResult};

// Personas + whitelists (the policy surface)
pub use persona::{Persona, ALL_PERSONAS};
pub use whitelist::WhitelistTable;

// Credential gate
pub use auth::{issue_token, Credential, CredentialGate, TokenClaims, REQUIRED_SCOPE};

// Configuration
pub use config::CoreConfig;

// Audit / metrics sink
pub use audit::{AuditEvent, AuditSink, EventKind};

// Isolated tool execution + sandbox probing
pub use executor::{ToolExecutor, ToolOutcome};
pub use sandbox::bwrap_available;

// Egress watchdog (fail-closed)
pub use watchdog::{EgressPolicy, EgressViolationInfo, EgressWatchdog};

// Tiered memory
pub use memory::{clean_telemetry, MemoryEngine, MemoryStatus, Retrieval};

// Goal intake orchestration
pub use intake::{GoalIntake, GoalRequest, GoalResponse, GoalState};

// Destructive wipe (operator kill switch; never routed)
pub use wipe::{wipe_all, WipeReport};
