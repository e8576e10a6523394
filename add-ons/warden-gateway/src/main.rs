//! warden-gateway: the only network surface of the broker.
//!
//! Goal-only RPC: a caller submits `{goal, persona}` with a credential header
//! and the broker alone resolves and executes a whitelisted tool. Binds to
//! loopback only. Also serves the metrics scrape, health, and memory status.
//! The destructive wipe is a CLI flag, never a route.

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::{
    wipe_all, AuditSink, CoreConfig, Credential, CredentialGate, EgressWatchdog, GoalIntake,
    GoalRequest, MemoryEngine, ToolExecutor, WardenError, WhitelistTable,
};

/// Loopback only. The broker is a local authority, not a network service.
const DEFAULT_PORT: u16 = 8700;

const KEY_HEADER: &str = "x-warden-key";

struct AppState {
    intake: GoalIntake,
    memory: Arc<MemoryEngine>,
    audit: Arc<AuditSink>,
}

type SharedState = Arc<AppState>;

fn build_state(config: &CoreConfig, whitelist: WhitelistTable) -> Result<SharedState, WardenError> {
    whitelist.validate()?;
    let audit = Arc::new(AuditSink::new(&config.audit_dir()));
    let memory = Arc::new(MemoryEngine::open(config, Arc::clone(&audit))?);
    let executor = Arc::new(ToolExecutor::new(config, whitelist, Arc::clone(&audit))?);
    let intake = GoalIntake::new(
        CredentialGate::new(config),
        executor,
        Arc::clone(&memory),
        Arc::clone(&audit),
    );
    Ok(Arc::new(AppState {
        intake,
        memory,
        audit,
    }))
}

fn load_whitelist(config: &CoreConfig) -> Result<WhitelistTable, WardenError> {
    match &config.whitelist_file {
        Some(path) => WhitelistTable::load_with_overrides(path),
        None => Ok(WhitelistTable::builtin()),
    }
}

// --- Handlers ----------------------------------------------------------------

/// Extract the credential from `x-warden-key` or `Authorization: Bearer`.
fn credential_from_headers(headers: &HeaderMap) -> Credential {
    if let Some(key) = headers.get(KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Credential::StaticKey(key.trim().to_string());
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Credential::Bearer(token.trim().to_string());
        }
    }
    Credential::Missing
}

fn error_response(err: WardenError) -> Response {
    let status = match &err {
        WardenError::AuthDenied(_) => StatusCode::UNAUTHORIZED,
        WardenError::ToolNotWhitelisted { .. } => StatusCode::FORBIDDEN,
        WardenError::UnknownPersona(_) => StatusCode::BAD_REQUEST,
        WardenError::ToolExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        WardenError::ToolExecutionFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "detail": err.to_string() }))).into_response()
}

async fn submit_goal(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<GoalRequest>,
) -> Response {
    let credential = credential_from_headers(&headers);
    match state.intake.handle(&credential, request).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn metrics(State(state): State<SharedState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.audit.prometheus_text(),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "warden-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn memory_status(State(state): State<SharedState>) -> Response {
    match state.memory.status() {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) => error_response(err),
    }
}

fn build_app(state: SharedState) -> Router {
    // Local UIs only; the gateway itself never leaves loopback.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &axum::http::HeaderValue, _| {
            let s = origin.to_str().unwrap_or("");
            s.starts_with("http://localhost:") || s.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/v1/goal", post(submit_goal))
        .route("/metrics", get(metrics))
        .route("/api/v1/health", get(health))
        .route("/api/v1/memory/status", get(memory_status))
        .layer(cors)
        .with_state(state)
}

// --- CLI ---------------------------------------------------------------------

/// Pre-flight: config loads, whitelist validates, stores open, port is free.
fn run_verify(config: &CoreConfig, port: u16) -> Result<(), String> {
    print!("Checking whitelist... ");
    let whitelist = load_whitelist(config).map_err(|e| format!("whitelist: {e}"))?;
    whitelist.validate().map_err(|e| format!("whitelist: {e}"))?;
    println!("OK");

    print!("Checking memory stores... ");
    let audit = Arc::new(AuditSink::new(&config.audit_dir()));
    let memory =
        MemoryEngine::open(config, audit).map_err(|e| format!("stores LOCKED or inaccessible: {e}"))?;
    memory.status().map_err(|e| format!("store check failed: {e}"))?;
    drop(memory);
    println!("OK");

    print!("Checking port {port}... ");
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match std::net::TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            println!("OK (available)");
        }
        Err(e) => return Err(format!("port {port} BLOCKED: {e}")),
    }

    println!("\nPre-flight passed. Ready to start gateway.");
    Ok(())
}

/// Destructive wipe of all persisted memory and the audit log. Requires the
/// explicit `--yes` confirmation; deliberately unreachable over HTTP.
fn run_wipe(config: &CoreConfig, confirmed: bool) -> Result<(), String> {
    if !confirmed {
        return Err("refusing to wipe without --yes (this destroys all memory tiers and the audit log)".into());
    }
    let report = wipe_all(config).map_err(|e| format!("wipe failed: {e}"))?;
    println!(
        "Wipe complete: facts={} semantic={} audit={} storage_dir={}",
        report.facts, report.semantic, report.audit, report.storage_dir
    );
    Ok(())
}

fn gateway_port() -> u16 {
    std::env::var("WARDEN_PORT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[tokio::main]
async fn main() {
    // Keys live in the backend environment only; callers present them per
    // request and never receive them back.
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[warden-gateway] .env not loaded: {e} (using system environment)");
    }

    let config = CoreConfig::from_env();
    let port = gateway_port();
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--verify") {
        match run_verify(&config, port) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("PRE-FLIGHT FAILED: {e}");
                std::process::exit(1);
            }
        }
    }
    if args.iter().any(|a| a == "--wipe") {
        let confirmed = args.iter().any(|a| a == "--yes");
        match run_wipe(&config, confirmed) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("WIPE FAILED: {e}");
                std::process::exit(2);
            }
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.auth_required && config.static_keys.is_empty() && config.token_key.is_none() {
        tracing::warn!(
            "auth is required but no WARDEN_KEY_* or WARDEN_TOKEN_KEY is set; every goal will be rejected"
        );
    }

    let whitelist = match load_whitelist(&config) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[warden-gateway] whitelist configuration error: {e}");
            std::process::exit(1);
        }
    };
    let state = match build_state(&config, whitelist) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[warden-gateway] startup failed: {e}");
            std::process::exit(1);
        }
    };

    // Supervised for the life of the process; a violation exits from inside.
    let watchdog = match EgressWatchdog::new(&config, Arc::clone(&state.audit)) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[warden-gateway] egress policy error: {e}");
            std::process::exit(1);
        }
    };
    let mut watchdog_handle = watchdog.spawn();

    let app = build_app(state);

    // Loopback only. No 0.0.0.0.
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("warden-gateway listening on {addr} (loopback locked)");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[warden-gateway] bind {addr} failed: {e}");
            std::process::exit(1);
        }
    };
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested (Ctrl+C)");
        }
        result = &mut watchdog_handle => {
            tracing::error!(?result, "egress watchdog ended; refusing to serve unmonitored");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use warden_core::Persona;

    fn test_app(dir: &std::path::Path) -> Router {
        let config = CoreConfig {
            storage_dir: dir.to_path_buf(),
            static_keys: vec![(Persona::Sre, "sre-key".to_string())],
            ..Default::default()
        };
        let whitelist = WhitelistTable::builtin()
            .with_entry(Persona::Sre, &["echo"])
            .unwrap();
        build_app(build_state(&config, whitelist).unwrap())
    }

    fn goal_request(key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/goal")
            .header("content-type", "application/json");
        if let Some(k) = key {
            builder = builder.header(KEY_HEADER, k);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn goal_with_valid_key_executes_and_returns_allowed_tools() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let resp = app
            .oneshot(goal_request(
                Some("sre-key"),
                json!({ "goal": "say hello", "persona": "sre", "tool": "echo", "args": ["hello"] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["persona"], "sre");
        assert!(body["allowed_tools"]
            .as_array()
            .unwrap()
            .contains(&json!("echo")));
        assert_eq!(body["outcome"]["success"], true);
    }

    #[tokio::test]
    async fn missing_or_bad_credential_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let resp = app
            .clone()
            .oneshot(goal_request(
                None,
                json!({ "goal": "say hello", "persona": "sre", "tool": "echo" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(goal_request(
                Some("wrong"),
                json!({ "goal": "say hello", "persona": "sre", "tool": "echo" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_whitelisted_tool_is_403_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let resp = app
            .clone()
            .oneshot(goal_request(
                Some("sre-key"),
                json!({ "goal": "delete everything", "persona": "sre", "tool": "rm -rf /" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("whitelist"));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&text).into_owned();
        assert!(text.contains("warden_security_violations_total"));
    }

    #[tokio::test]
    async fn unknown_persona_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let resp = app
            .oneshot(goal_request(
                Some("sre-key"),
                json!({ "goal": "say hello", "persona": "root", "tool": "echo" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_memory_status_respond() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "warden-gateway");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/memory/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["namespaces"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn there_is_no_wipe_route() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        for uri in ["/v1/wipe", "/api/v1/wipe", "/wipe"] {
            let resp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
