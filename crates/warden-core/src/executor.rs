//! Isolated tool execution behind the whitelist.
//!
//! The executor is the only place a child process is spawned. A denial returns
//! before any process machinery runs, so a rejected tool has zero side
//! effects. Accepted invocations run with a scrubbed environment, captured
//! stdio, a hard timeout, and optionally inside the bubblewrap sandbox.

use crate::audit::{AuditSink, EventKind};
use crate::config::CoreConfig;
use crate::error::{WardenError, WardenResult};
use crate::persona::Persona;
use crate::sandbox;
use crate::whitelist::WhitelistTable;
use serde::Serialize;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Captured output is clipped to this many bytes per stream.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Result of one completed (non-denied) tool run.
#[derive(Debug, Serialize)]
pub struct ToolOutcome {
    pub tool: String,
    /// Whitelist pattern that authorized the run.
    pub matched_entry: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

pub struct ToolExecutor {
    whitelist: WhitelistTable,
    audit: Arc<AuditSink>,
    permits: Arc<Semaphore>,
    timeout: std::time::Duration,
    sandbox_enabled: bool,
    sandbox_allow_network: bool,
}

impl ToolExecutor {
    /// Fails at construction when the sandbox is enabled but bubblewrap is
    /// missing; running tools unconfined by accident is not an option.
    pub fn new(
        config: &CoreConfig,
        whitelist: WhitelistTable,
        audit: Arc<AuditSink>,
    ) -> WardenResult<Self> {
        if config.sandbox_enabled && !sandbox::bwrap_available() {
            return Err(WardenError::Config(
                "sandbox enabled but bwrap is not on PATH; install bubblewrap or unset WARDEN_SANDBOX"
                    .into(),
            ));
        }
        Ok(Self {
            whitelist,
            audit,
            permits: Arc::new(Semaphore::new(config.max_concurrent_tools)),
            timeout: config.tool_timeout,
            sandbox_enabled: config.sandbox_enabled,
            sandbox_allow_network: config.sandbox_allow_network,
        })
    }

    pub fn whitelist(&self) -> &WhitelistTable {
        &self.whitelist
    }

    /// Run one whitelisted tool. Denials are audited as `security_violation`
    /// and return before any spawn; every run emits exactly one `tool_call`
    /// event whatever its outcome.
    pub async fn execute(
        &self,
        persona: Persona,
        tool: &str,
        args: &[String],
    ) -> WardenResult<ToolOutcome> {
        let Some(matched) = self.whitelist.match_entry(persona, tool) else {
            self.audit.record(
                EventKind::SecurityViolation,
                Some(persona.as_str()),
                json!({ "tool": tool, "reason": "not in persona whitelist" }),
            );
            return Err(WardenError::ToolNotWhitelisted {
                tool: tool.to_string(),
                persona,
            });
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| WardenError::ToolExecutionFailure(format!("executor shutting down: {e}")))?;

        let start = Instant::now();
        let result = self.run_isolated(tool, args).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let (stdout, out_clipped) = clip_output(&output.stdout);
                let (stderr, err_clipped) = clip_output(&output.stderr);
                let outcome = ToolOutcome {
                    tool: tool.to_string(),
                    matched_entry: matched,
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    stdout,
                    stderr,
                    truncated: out_clipped || err_clipped,
                    duration_ms,
                };
                self.audit.record(
                    EventKind::ToolCall,
                    Some(persona.as_str()),
                    json!({
                        "tool": tool,
                        "matched": outcome.matched_entry,
                        "outcome": if outcome.success { "ok" } else { "failed" },
                        "exit_code": outcome.exit_code,
                        "duration_ms": duration_ms,
                    }),
                );
                Ok(outcome)
            }
            Err(err) => {
                let outcome_label = match &err {
                    WardenError::ToolExecutionTimeout { .. } => "timeout",
                    _ => "spawn_error",
                };
                self.audit.record(
                    EventKind::ToolCall,
                    Some(persona.as_str()),
                    json!({
                        "tool": tool,
                        "matched": matched,
                        "outcome": outcome_label,
                        "error": err.to_string(),
                        "duration_ms": duration_ms,
                    }),
                );
                Err(err)
            }
        }
    }

    async fn run_isolated(&self, tool: &str, args: &[String]) -> WardenResult<std::process::Output> {
        let mut argv: Vec<String> = tool.split_whitespace().map(String::from).collect();
        argv.extend(args.iter().cloned());
        if argv.is_empty() {
            return Err(WardenError::ToolExecutionFailure("empty tool argv".into()));
        }

        let mut cmd = if self.sandbox_enabled {
            let mut c = Command::new(sandbox::BWRAP_BIN);
            c.args(sandbox::bwrap_args(self.sandbox_allow_network, None));
            c.arg("--");
            c.args(&argv);
            c.current_dir(sandbox::sandbox_cwd(None));
            c
        } else {
            let mut c = Command::new(&argv[0]);
            c.args(&argv[1..]);
            c
        };

        // Minimal environment. Nothing from the broker's own environment —
        // API keys and credentials must never reach a tool child.
        cmd.env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()),
            )
            .env("HOME", "/tmp")
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| WardenError::ToolExecutionFailure(format!("spawn '{}': {e}", argv[0])))?;

        // Dropping the future on timeout kills the child via kill_on_drop.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(WardenError::ToolExecutionFailure(format!(
                "wait '{}': {e}",
                argv[0]
            ))),
            Err(_) => Err(WardenError::ToolExecutionTimeout {
                tool: argv[0].clone(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// Lossy UTF-8 decode clipped to `MAX_OUTPUT_BYTES`, cut on a char boundary.
fn clip_output(bytes: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_BYTES {
        return (text.into_owned(), false);
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
