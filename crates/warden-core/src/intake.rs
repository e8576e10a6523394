//! Goal intake: the orchestration path for one submitted goal.
//!
//! A caller never names a tool with authority; it sends a goal (plus an
//! optional tool hint) and the broker alone decides what may run. Each request
//! walks received → authenticated → context-enriched → whitelist-checked →
//! executing → completed, or stops at a terminal denied/errored state. A
//! denied request is never retried here; the caller must submit a new goal.
//!
//! Audit contract: an accepted goal produces exactly one `goal` event and
//! exactly one of `tool_call` / `security_violation`. A credential failure
//! produces a single `auth_denied` event and nothing else.

use crate::audit::{AuditSink, EventKind};
use crate::auth::{Credential, CredentialGate};
use crate::error::{WardenError, WardenResult};
use crate::executor::{ToolExecutor, ToolOutcome};
use crate::memory::MemoryEngine;
use crate::persona::Persona;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Request lifecycle states. Denied and Errored are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    Received,
    Authenticated,
    ContextEnriched,
    WhitelistChecked,
    Executing,
    Completed,
    Denied,
    Errored,
}

/// Inbound goal. `tool` is a hint, never an authorization: it still passes the
/// persona whitelist like any resolved tool would.
#[derive(Debug, Clone, Deserialize)]
pub struct GoalRequest {
    pub goal: String,
    pub persona: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Outcome of a fully completed goal.
#[derive(Debug, Serialize)]
pub struct GoalResponse {
    pub goal_id: String,
    pub goal: String,
    pub persona: String,
    pub state: GoalState,
    pub allowed_tools: Vec<String>,
    pub tool: String,
    pub outcome: ToolOutcome,
    /// Number of stored facts retrieved as context for this goal.
    pub context_facts: usize,
    pub message: String,
}

pub struct GoalIntake {
    gate: CredentialGate,
    executor: Arc<ToolExecutor>,
    memory: Arc<MemoryEngine>,
    audit: Arc<AuditSink>,
}

impl GoalIntake {
    pub fn new(
        gate: CredentialGate,
        executor: Arc<ToolExecutor>,
        memory: Arc<MemoryEngine>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            gate,
            executor,
            memory,
            audit,
        }
    }

    /// Drive one goal through the full lifecycle.
    pub async fn handle(
        &self,
        credential: &Credential,
        request: GoalRequest,
    ) -> WardenResult<GoalResponse> {
        let claimed = Persona::from_str(&request.persona)
            .ok_or_else(|| WardenError::UnknownPersona(request.persona.clone()))?;

        let goal_id = uuid::Uuid::new_v4().to_string();
        let mut state = GoalState::Received;

        let persona = match self.gate.verify(credential, claimed) {
            Ok(p) => p,
            Err(err) => {
                transition(&goal_id, &mut state, GoalState::Denied);
                self.audit.record(
                    EventKind::AuthDenied,
                    Some(claimed.as_str()),
                    json!({ "goal_id": goal_id, "reason": err.to_string(), "state": state }),
                );
                return Err(err);
            }
        };
        transition(&goal_id, &mut state, GoalState::Authenticated);

        self.audit.record(
            EventKind::Goal,
            Some(persona.as_str()),
            json!({ "goal_id": goal_id, "goal": request.goal }),
        );

        if let Err(err) = self
            .memory
            .remember_goal(persona, &goal_id, &request.goal)
            .await
        {
            transition(&goal_id, &mut state, GoalState::Errored);
            return Err(err);
        }
        let context = match self.memory.retrieve(persona, &request.goal, 5).await {
            Ok(c) => c,
            Err(err) => {
                transition(&goal_id, &mut state, GoalState::Errored);
                return Err(err);
            }
        };
        transition(&goal_id, &mut state, GoalState::ContextEnriched);

        let allowed_tools = self.executor.whitelist().allowed_tools(persona);
        let tool = match &request.tool {
            Some(hint) => hint.clone(),
            None => match resolve_tool(&request.goal, &allowed_tools) {
                Some(t) => t,
                None => {
                    // No hint and nothing in the goal names a whitelisted
                    // tool: the whitelist check fails before any execution.
                    transition(&goal_id, &mut state, GoalState::Denied);
                    self.audit.record(
                        EventKind::SecurityViolation,
                        Some(persona.as_str()),
                        json!({
                            "goal_id": goal_id,
                            "reason": "goal resolves to no whitelisted tool",
                            "state": state,
                        }),
                    );
                    return Err(WardenError::ToolNotWhitelisted {
                        tool: "(unresolved)".to_string(),
                        persona,
                    });
                }
            },
        };
        transition(&goal_id, &mut state, GoalState::WhitelistChecked);

        // The executor re-checks the whitelist and records the tool-level
        // event, including the security_violation on a bad hint.
        transition(&goal_id, &mut state, GoalState::Executing);
        let outcome = match self.executor.execute(persona, &tool, &request.args).await {
            Ok(o) => o,
            Err(err) => {
                let terminal = match &err {
                    WardenError::ToolNotWhitelisted { .. } => GoalState::Denied,
                    _ => GoalState::Errored,
                };
                transition(&goal_id, &mut state, terminal);
                return Err(err);
            }
        };
        transition(&goal_id, &mut state, GoalState::Completed);

        Ok(GoalResponse {
            goal_id,
            goal: request.goal,
            persona: persona.to_string(),
            state,
            allowed_tools,
            tool,
            context_facts: context.facts.len(),
            outcome,
            message: "goal accepted; tool selection is broker-authoritative".to_string(),
        })
    }
}

/// Advance the lifecycle, leaving a trace of every step a goal took.
fn transition(goal_id: &str, state: &mut GoalState, next: GoalState) {
    tracing::debug!(goal_id, from = ?state, to = ?next, "goal state");
    *state = next;
}

/// Pick the whitelisted pattern the goal text names, longest match first.
/// Returns None when the goal mentions no whitelisted tool at all.
fn resolve_tool(goal: &str, allowed: &[String]) -> Option<String> {
    let goal = goal
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    allowed
        .iter()
        .filter(|pattern| goal.contains(pattern.as_str()))
        .max_by_key(|pattern| pattern.len())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::whitelist::WhitelistTable;

    struct Fixture {
        intake: GoalIntake,
        audit: Arc<AuditSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            storage_dir: dir.path().join("state"),
            static_keys: vec![(Persona::Sre, "sre-key".to_string())],
            ..Default::default()
        };
        let audit = Arc::new(AuditSink::new(&config.audit_dir()));
        let whitelist = WhitelistTable::builtin()
            .with_entry(Persona::Sre, &["echo", "sleep"])
            .unwrap();
        let executor =
            Arc::new(ToolExecutor::new(&config, whitelist, Arc::clone(&audit)).unwrap());
        let memory = Arc::new(MemoryEngine::open(&config, Arc::clone(&audit)).unwrap());
        let intake = GoalIntake::new(
            CredentialGate::new(&config),
            executor,
            memory,
            Arc::clone(&audit),
        );
        Fixture {
            intake,
            audit,
            _dir: dir,
        }
    }

    fn request(goal: &str, tool: Option<&str>, args: &[&str]) -> GoalRequest {
        GoalRequest {
            goal: goal.to_string(),
            persona: "sre".to_string(),
            tool: tool.map(String::from),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn accepted_goal_completes_with_one_goal_and_one_tool_event() {
        let f = fixture();
        let resp = f
            .intake
            .handle(
                &Credential::StaticKey("sre-key".into()),
                request("print a greeting", Some("echo"), &["hello"]),
            )
            .await
            .unwrap();
        assert_eq!(resp.state, GoalState::Completed);
        assert!(resp.outcome.stdout.contains("hello"));
        assert!(resp.allowed_tools.contains(&"echo".to_string()));
        assert_eq!(f.audit.count(EventKind::Goal), 1);
        assert_eq!(f.audit.count(EventKind::ToolCall), 1);
        assert_eq!(f.audit.count(EventKind::SecurityViolation), 0);
    }

    #[tokio::test]
    async fn bad_credential_is_terminal_with_a_single_auth_event() {
        let f = fixture();
        let err = f
            .intake
            .handle(
                &Credential::StaticKey("wrong".into()),
                request("anything", Some("echo"), &[]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::AuthDenied(_)));
        assert_eq!(f.audit.count(EventKind::AuthDenied), 1);
        assert_eq!(f.audit.count(EventKind::Goal), 0);
        assert_eq!(f.audit.count(EventKind::ToolCall), 0);
    }

    #[tokio::test]
    async fn non_whitelisted_hint_is_denied_after_the_goal_event() {
        let f = fixture();
        let err = f
            .intake
            .handle(
                &Credential::StaticKey("sre-key".into()),
                request("remove everything", Some("rm -rf /"), &[]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ToolNotWhitelisted { .. }));
        assert_eq!(f.audit.count(EventKind::Goal), 1);
        assert_eq!(f.audit.count(EventKind::SecurityViolation), 1);
        assert_eq!(f.audit.count(EventKind::ToolCall), 0);
    }

    #[tokio::test]
    async fn goal_text_resolves_a_whitelisted_tool_without_a_hint() {
        let f = fixture();
        let resp = f
            .intake
            .handle(
                &Credential::StaticKey("sre-key".into()),
                request("use echo to confirm the broker is alive", None, &["ok"]),
            )
            .await
            .unwrap();
        assert_eq!(resp.tool, "echo");
        assert_eq!(resp.state, GoalState::Completed);
    }

    #[tokio::test]
    async fn unresolvable_goal_is_a_security_violation() {
        let f = fixture();
        let err = f
            .intake
            .handle(
                &Credential::StaticKey("sre-key".into()),
                request("do something vague", None, &[]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ToolNotWhitelisted { .. }));
        assert_eq!(f.audit.count(EventKind::Goal), 1);
        assert_eq!(f.audit.count(EventKind::SecurityViolation), 1);
    }

    #[tokio::test]
    async fn denied_goals_audit_their_terminal_state() {
        let f = fixture();
        f.intake
            .handle(
                &Credential::StaticKey("wrong".into()),
                request("anything", Some("echo"), &[]),
            )
            .await
            .unwrap_err();
        f.intake
            .handle(
                &Credential::StaticKey("sre-key".into()),
                request("do something vague", None, &[]),
            )
            .await
            .unwrap_err();

        let log = std::fs::read_to_string(f.audit.log_path()).unwrap();
        let auth = log.lines().find(|l| l.contains("auth_denied")).unwrap();
        assert!(auth.contains("\"state\":\"denied\""));
        let violation = log
            .lines()
            .find(|l| l.contains("security_violation"))
            .unwrap();
        assert!(violation.contains("\"state\":\"denied\""));
    }

    #[tokio::test]
    async fn unknown_persona_is_rejected_before_any_event() {
        let f = fixture();
        let mut req = request("anything", Some("echo"), &[]);
        req.persona = "root".to_string();
        let err = f
            .intake
            .handle(&Credential::StaticKey("sre-key".into()), req)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::UnknownPersona(_)));
        assert_eq!(f.audit.count(EventKind::Goal), 0);
        assert_eq!(f.audit.count(EventKind::AuthDenied), 0);
    }

    #[test]
    fn resolution_prefers_the_most_specific_pattern() {
        let allowed = vec!["kubectl".to_string(), "kubectl get".to_string()];
        assert_eq!(
            resolve_tool("please run  Kubectl   Get pods", &allowed),
            Some("kubectl get".to_string())
        );
        assert_eq!(resolve_tool("nothing relevant", &allowed), None);
    }
}
