//! Broker error taxonomy.
//!
//! Security-relevant denials (`AuthDenied`, `ToolNotWhitelisted`) are always local,
//! always audited, and never retried. `EgressViolation` is the only condition that is
//! deliberately fatal to the whole process.

use crate::persona::Persona;

/// Result type for broker operations.
pub type WardenResult<T> = Result<T, WardenError>;

/// Errors that can occur on the authorization/execution path.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Missing or invalid credential. Recorded as `auth_denied`; no further processing.
    #[error("authentication denied: {0}")]
    AuthDenied(String),

    /// Tool is not on the persona whitelist. Recorded as `security_violation`;
    /// guaranteed zero side effects (no child process is spawned).
    #[error("tool '{tool}' is not in the {persona} whitelist; execution blocked")]
    ToolNotWhitelisted { tool: String, persona: Persona },

    /// Child process exceeded the execution bound and was force-killed.
    #[error("tool '{tool}' timed out after {timeout_secs}s")]
    ToolExecutionTimeout { tool: String, timeout_secs: u64 },

    /// Child process could not be spawned or failed at runtime.
    #[error("tool execution failed: {0}")]
    ToolExecutionFailure(String),

    /// Outbound connection outside the allow-list. Fatal by design: the watchdog
    /// logs an `egress_block` event and terminates the process.
    #[error("egress violation: connection to {remote} is outside the allow-list")]
    EgressViolation { remote: String },

    /// Local I/O error on a durable memory tier. Surfaced to the caller; other
    /// tiers are unaffected.
    #[error("memory write failed: {0}")]
    MemoryWriteFailure(String),

    #[error("unknown persona: {0}")]
    UnknownPersona(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// True when this error is a policy or credential denial (rejected, not crashed).
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            WardenError::AuthDenied(_) | WardenError::ToolNotWhitelisted { .. }
        )
    }
}
