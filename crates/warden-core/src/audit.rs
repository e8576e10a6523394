//! Local observability: immutable audit log + Prometheus counters.
//!
//! Append-only JSONL trail of broker decisions (goals, tool calls, violations,
//! egress blocks, auth denials) plus in-memory counters for scraping. The log is
//! the system's ground truth for "what happened": nothing filters events before
//! they are durably recorded, and nothing rewrites the file in place.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Audit event kinds. Closed set; each kind owns a counter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Goal,
    ToolCall,
    SecurityViolation,
    EgressBlock,
    AuthDenied,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Goal => "goal",
            EventKind::ToolCall => "tool_call",
            EventKind::SecurityViolation => "security_violation",
            EventKind::EgressBlock => "egress_block",
            EventKind::AuthDenied => "auth_denied",
        }
    }

    fn counter_name(&self) -> &'static str {
        match self {
            EventKind::Goal => "warden_goals_total",
            EventKind::ToolCall => "warden_tool_calls_total",
            EventKind::SecurityViolation => "warden_security_violations_total",
            EventKind::EgressBlock => "warden_egress_blocks_total",
            EventKind::AuthDenied => "warden_auth_denied_total",
        }
    }

    fn counter_help(&self) -> &'static str {
        match self {
            EventKind::Goal => "Goals submitted by persona.",
            EventKind::ToolCall => "Tool executions by persona, tool, outcome.",
            EventKind::SecurityViolation => "Denied tool calls by persona.",
            EventKind::EgressBlock => "Egress watchdog blocks (non-allow-listed remote).",
            EventKind::AuthDenied => "Auth failures (missing or invalid credential) by persona.",
        }
    }
}

/// One immutable audit record. Never mutated or deleted except by the wipe operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub detail: Value,
}

#[derive(Default)]
struct Summary {
    sum: f64,
    count: u64,
}

/// Append-only event writer plus monotonic in-memory counters.
///
/// Counters reset only on process restart. Safe to share across tasks; the file
/// handle is re-opened per append so the log directory can be recreated after a wipe.
pub struct AuditSink {
    log_path: PathBuf,
    // Serializes appends so events land in operation-completion order.
    write_lock: Mutex<()>,
    // metric name -> rendered label set -> count
    counters: DashMap<&'static str, DashMap<String, u64>>,
    // memory tier label -> latency summary
    retrieval: DashMap<String, Mutex<Summary>>,
}

impl AuditSink {
    /// Sink writing to `<audit_dir>/audit.jsonl`.
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            log_path: audit_dir.join("audit.jsonl"),
            write_lock: Mutex::new(()),
            counters: DashMap::new(),
            retrieval: DashMap::new(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Append one immutable audit record and bump the matching counter.
    /// Safe to call from any task. A failed append is logged, never escalated:
    /// observability must not take down the authorization path.
    pub fn record(&self, kind: EventKind, persona: Option<&str>, detail: Value) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            kind,
            persona: persona.map(str::to_string),
            detail,
        };
        self.bump(&event);

        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                warn!(target: "warden::audit", error = %e, "audit event not serializable");
                return;
            }
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(target: "warden::audit", error = %e, "audit write failed");
        }
    }

    fn bump(&self, event: &AuditEvent) {
        let mut labels: BTreeMap<&str, String> = BTreeMap::new();
        let persona = event.persona.clone().unwrap_or_else(|| "unknown".into());
        match event.kind {
            EventKind::Goal | EventKind::SecurityViolation | EventKind::AuthDenied => {
                labels.insert("persona", persona);
            }
            EventKind::ToolCall => {
                labels.insert("persona", persona);
                let tool = event
                    .detail
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                labels.insert("tool", truncate(tool, 64));
                let outcome = event
                    .detail
                    .get("outcome")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                labels.insert("outcome", outcome.to_string());
            }
            EventKind::EgressBlock => {}
        }
        let key = render_labels(&labels);
        *self
            .counters
            .entry(event.kind.counter_name())
            .or_default()
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Record a memory retrieval duration for the latency summary.
    /// `tier` is "facts", "semantic", or "combined".
    pub fn record_retrieval_seconds(&self, tier: &str, seconds: f64) {
        if tier.is_empty() || !(seconds >= 0.0) {
            return;
        }
        let entry = self
            .retrieval
            .entry(tier.to_string())
            .or_insert_with(|| Mutex::new(Summary::default()));
        let mut s = entry.lock().unwrap_or_else(|p| p.into_inner());
        s.sum += seconds;
        s.count += 1;
    }

    /// Total count for one event kind, summed over all label sets. Test/status helper.
    pub fn count(&self, kind: EventKind) -> u64 {
        self.counters
            .get(kind.counter_name())
            .map(|family| family.iter().map(|e| *e.value()).sum())
            .unwrap_or(0)
    }

    /// Render all counters and summaries in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let mut out = String::new();
        for kind in [
            EventKind::Goal,
            EventKind::ToolCall,
            EventKind::SecurityViolation,
            EventKind::EgressBlock,
            EventKind::AuthDenied,
        ] {
            let name = kind.counter_name();
            out.push_str(&format!("# HELP {name} {}\n", kind.counter_help()));
            out.push_str(&format!("# TYPE {name} counter\n"));
            match self.counters.get(name) {
                Some(family) if !family.is_empty() => {
                    let mut lines: Vec<String> = family
                        .iter()
                        .map(|e| {
                            if e.key().is_empty() {
                                format!("{name} {}", e.value())
                            } else {
                                format!("{name}{{{}}} {}", e.key(), e.value())
                            }
                        })
                        .collect();
                    lines.sort();
                    for l in lines {
                        out.push_str(&l);
                        out.push('\n');
                    }
                }
                _ => out.push_str(&format!("{name} 0\n")),
            }
            out.push('\n');
        }

        out.push_str(
            "# HELP warden_memory_retrieval_seconds Memory retrieval latency by tier in seconds.\n",
        );
        out.push_str("# TYPE warden_memory_retrieval_seconds summary\n");
        let mut tiers: Vec<String> = self.retrieval.iter().map(|e| e.key().clone()).collect();
        tiers.sort();
        for tier in tiers {
            if let Some(entry) = self.retrieval.get(&tier) {
                let s = entry.lock().unwrap_or_else(|p| p.into_inner());
                out.push_str(&format!(
                    "warden_memory_retrieval_seconds_sum{{tier=\"{}\"}} {:.6}\n",
                    escape_label(&tier),
                    s.sum
                ));
                out.push_str(&format!(
                    "warden_memory_retrieval_seconds_count{{tier=\"{}\"}} {}\n",
                    escape_label(&tier),
                    s.count
                ));
            }
        }
        out
    }
}

fn render_labels(labels: &BTreeMap<&str, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        sink.record(EventKind::Goal, Some("sre"), json!({"goal": "check pods"}));
        sink.record(
            EventKind::ToolCall,
            Some("sre"),
            json!({"tool": "kubectl-get", "outcome": "success"}),
        );

        let content = std::fs::read_to_string(sink.log_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let event: AuditEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.persona.as_deref(), Some("sre"));
        }
    }

    #[test]
    fn counters_follow_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        sink.record(EventKind::Goal, Some("sre"), json!({}));
        sink.record(EventKind::Goal, Some("secops"), json!({}));
        sink.record(EventKind::AuthDenied, Some("sre"), json!({}));
        assert_eq!(sink.count(EventKind::Goal), 2);
        assert_eq!(sink.count(EventKind::AuthDenied), 1);
        assert_eq!(sink.count(EventKind::EgressBlock), 0);
    }

    #[test]
    fn prometheus_text_renders_all_families() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        sink.record(EventKind::Goal, Some("sre"), json!({}));
        sink.record(
            EventKind::ToolCall,
            Some("sre"),
            json!({"tool": "kubectl-get", "outcome": "success"}),
        );
        sink.record_retrieval_seconds("l2", 0.004);
        sink.record_retrieval_seconds("combined", 0.012);

        let text = sink.prometheus_text();
        assert!(text.contains("# TYPE warden_goals_total counter"));
        assert!(text.contains("warden_goals_total{persona=\"sre\"} 1"));
        assert!(text.contains("tool=\"kubectl-get\""));
        assert!(text.contains("warden_egress_blocks_total 0"));
        assert!(text.contains("warden_memory_retrieval_seconds_count{tier=\"l2\"} 1"));
    }

    #[test]
    fn log_recreated_after_directory_removal() {
        let dir = tempfile::tempdir().unwrap();
        let audit_dir = dir.path().join("audit");
        let sink = AuditSink::new(&audit_dir);
        sink.record(EventKind::Goal, Some("sre"), json!({}));
        std::fs::remove_dir_all(&audit_dir).unwrap();
        assert!(!sink.log_path().exists());
        sink.record(EventKind::Goal, Some("sre"), json!({}));
        let content = std::fs::read_to_string(sink.log_path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
