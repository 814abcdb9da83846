#![cfg(feature = "web-api")]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use ops_core::alert::{Alert, Severity};
use ops_core::breaker::CircuitBreaker;
use ops_core::job::Job;
use ops_core::limiter::RateLimiter;
use ops_core::metrics::Metrics;
use ops_core::store::Store;

use crate::module::{stopped, Module, ModuleCtx};
use crate::monitor::{LogMonitor, WatchError};
use crate::runner::Runner;
use crate::scheduler::{SchedulerError, TaskScheduler};

const DEFAULT_ALERT_LIMIT: usize = 50;
const MAX_ALERT_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: TaskScheduler,
    pub monitor: LogMonitor,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<Metrics>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub runner: Runner,
    pub started: Instant,
}

/// Per-request data handed explicitly to handlers: who is calling and a
/// request id for log correlation.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub client: String,
    pub request_id: String,
}

impl RequestScope {
    fn from_parts(parts: &Parts) -> Self {
        let client = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self { client, request_id }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestScope {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        if let Some(scope) = parts.extensions.get::<RequestScope>() {
            return Ok(scope.clone());
        }
        Ok(Self::from_parts(parts))
    }
}

#[derive(Deserialize)]
struct WatchBody {
    path: String,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AlertBody {
    #[serde(rename = "type", default = "default_alert_kind")]
    kind: String,
    message: String,
    severity: Option<Severity>,
    source: Option<String>,
}

fn default_alert_kind() -> String { "external".to_string() }

pub struct WebServer {
    pub state: AppState,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_pem: Option<String>,
    pub tls_key_pem: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/tasks", get(tasks_list).post(tasks_add))
        .route("/api/v1/tasks/:id", get(tasks_get).delete(tasks_delete))
        .route("/api/v1/tasks/:id/execute", post(tasks_execute))
        .route("/api/v1/tasks/:id/enqueue", post(tasks_enqueue))
        .route("/api/v1/monitor/watch", get(watch_list).post(watch_add).delete(watch_remove))
        .route("/api/v1/alerts", get(alerts_list).post(alerts_submit))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(self.state.clone());
            let mut servers = JoinSet::<anyhow::Result<()>>::new();

            if let Some(addr) = self.http_addr {
                let app = app.clone();
                let mut sd = ctx.shutdown.clone();
                servers.spawn(async move {
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!("web http listening on http://{}", addr);
                    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                        .with_graceful_shutdown(async move { stopped(&mut sd).await })
                        .await?;
                    Ok(())
                });
            }

            match (self.https_addr, self.tls_cert_pem.clone(), self.tls_key_pem.clone()) {
                (Some(addr), Some(cert), Some(key)) => {
                    let app = app.clone();
                    let mut sd = ctx.shutdown.clone();
                    servers.spawn(async move {
                        let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
                        let handle = axum_server::Handle::new();
                        let trigger = handle.clone();
                        tokio::spawn(async move {
                            stopped(&mut sd).await;
                            trigger.graceful_shutdown(Some(Duration::from_secs(5)));
                        });
                        info!("web https listening on https://{}", addr);
                        axum_server::bind_rustls(addr, config)
                            .handle(handle)
                            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                            .await?;
                        Ok(())
                    });
                }
                (Some(addr), _, _) => warn!("https on {} needs tls_cert_pem and tls_key_pem; skipped", addr),
                _ => {}
            }

            supervise(servers, ctx.shutdown.clone()).await
        })
    }
}

/// Wait for shutdown while watching the listeners. A listener that dies is
/// logged at once; when none are left the module fails without waiting.
async fn supervise(mut servers: JoinSet<anyhow::Result<()>>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut first_err: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            Some(joined) = servers.join_next(), if !servers.is_empty() => {
                if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
                    error!("web listener failed: {:#}", e);
                    first_err.get_or_insert(e);
                }
                if servers.is_empty() && !*shutdown.borrow() {
                    error!("no web listener left, control plane is down");
                    return Err(first_err.unwrap_or_else(|| anyhow::anyhow!("web listeners exited")));
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    while let Some(joined) = servers.join_next().await {
        if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `None` for an unset or blank address.
pub fn parse_addr(s: Option<&str>) -> anyhow::Result<Option<SocketAddr>> {
    match s.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(s.parse().map_err(|e| anyhow::anyhow!("parse listen address {s:?}: {e}"))?)),
        None => Ok(None),
    }
}

fn error(status: StatusCode, msg: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": msg.to_string() }))).into_response()
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let scope = RequestScope::from_parts(&parts);
    if !state.limiter.allow(&scope.client) {
        state.metrics.rate_limited.inc();
        debug!("rate limited client={} path={}", scope.client, parts.uri.path());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded", "retry_after": "1s" })),
        )
            .into_response();
    }
    parts.extensions.insert(scope);
    next.run(axum::http::Request::from_parts(parts, body)).await
}

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime_ms": state.started.elapsed().as_millis() as u64,
        "tasks": state.scheduler.get_tasks().len(),
        "triggers": state.scheduler.active_triggers(),
        "watches": state.monitor.watched().len(),
        "subscribers": state.monitor.broadcaster().len(),
        "breaker": state.breaker.state().to_string(),
    }))
    .into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

async fn tasks_list(State(state): State<AppState>) -> Response {
    Json(state.scheduler.get_tasks()).into_response()
}

async fn tasks_get(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.scheduler.get_task(&id) {
        Some(job) => Json(job).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("task {id} not found")),
    }
}

async fn tasks_add(scope: RequestScope, State(state): State<AppState>, Json(job): Json<Job>) -> Response {
    match state.scheduler.add_task(job) {
        Ok(job) => {
            info!(client = %scope.client, request_id = %scope.request_id, "task {} registered", job.id);
            (StatusCode::CREATED, Json(job)).into_response()
        }
        Err(e @ SchedulerError::Schedule { .. }) => error(StatusCode::BAD_REQUEST, e),
        Err(e @ SchedulerError::Persist { .. }) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn tasks_delete(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.scheduler.remove_task(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error(StatusCode::NOT_FOUND, format!("task {id} not found")),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn tasks_execute(scope: RequestScope, Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let Some(job) = state.scheduler.get_task(&id) else {
        return error(StatusCode::NOT_FOUND, format!("task {id} not found"));
    };
    info!(client = %scope.client, request_id = %scope.request_id, "execute {} now", job.id);
    let res = state
        .breaker
        .call(|| state.runner.execute_immediate(&job.command, &job.arguments))
        .await;
    match res {
        Ok(()) => Json(json!({ "id": job.id, "status": "executed" })).into_response(),
        Err(e) if e.is_rejection() => {
            state.metrics.breaker_rejections.inc();
            error(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Err(e) => error(StatusCode::BAD_GATEWAY, e),
    }
}

async fn tasks_enqueue(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.scheduler.enqueue_now(&id).await {
        Some(true) => (StatusCode::ACCEPTED, Json(json!({ "id": id, "status": "queued" }))).into_response(),
        Some(false) => error(StatusCode::SERVICE_UNAVAILABLE, "task queue unavailable"),
        None => error(StatusCode::NOT_FOUND, format!("task {id} not found")),
    }
}

async fn watch_list(State(state): State<AppState>) -> Response {
    Json(state.monitor.watched()).into_response()
}

async fn watch_add(scope: RequestScope, State(state): State<AppState>, Json(body): Json<WatchBody>) -> Response {
    match state.monitor.watch(&body.path, &body.patterns).await {
        Ok(()) => {
            info!(client = %scope.client, request_id = %scope.request_id, "watch {}", body.path);
            (StatusCode::CREATED, Json(json!({ "path": body.path, "patterns": body.patterns }))).into_response()
        }
        Err(e @ WatchError::Pattern { .. }) => error(StatusCode::BAD_REQUEST, e),
        Err(e @ WatchError::Open { .. }) => error(StatusCode::UNPROCESSABLE_ENTITY, e),
        Err(e @ WatchError::Stopped) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn watch_remove(Query(q): Query<PathQuery>, State(state): State<AppState>) -> Response {
    if state.monitor.unwatch(&q.path).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::NOT_FOUND, format!("{} is not watched", q.path))
    }
}

async fn alerts_list(Query(q): Query<AlertsQuery>, State(state): State<AppState>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_ALERT_LIMIT).clamp(1, MAX_ALERT_LIMIT);
    match state.store.alerts(limit) {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn alerts_submit(State(state): State<AppState>, Json(body): Json<AlertBody>) -> Response {
    let severity = body.severity.unwrap_or_else(|| Severity::classify(&body.message));
    let mut alert = Alert::new(body.kind, body.message, severity);
    alert.source = body.source;
    if state.monitor.submit(alert.clone()) {
        (StatusCode::ACCEPTED, Json(alert)).into_response()
    } else {
        error(StatusCode::SERVICE_UNAVAILABLE, "alert pipeline is full")
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, scope: RequestScope, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_alerts(socket, state.monitor, scope))
}

async fn stream_alerts(socket: WebSocket, monitor: LogMonitor, scope: RequestScope) {
    let sub = monitor.subscribe();
    let (id, mut frames) = (sub.id, sub.rx);
    info!("ws subscriber {} connected client={}", id, scope.client);
    let (mut tx, mut rx) = socket.split();
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(text) => {
                    if tx.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                // Pruned by the broadcaster.
                None => break,
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    monitor.broadcaster().remove(id);
    info!("ws subscriber {} disconnected", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{self, header, Method};
    use ops_core::breaker::Settings;
    use ops_core::queue::{MemQueue, Queue};
    use ops_core::store::{KvStore, MemKv};
    use tower::ServiceExt;

    use crate::monitor::broadcast::Broadcaster;
    use crate::monitor::pipeline::AlertSink;
    use crate::scheduler::tests::opts;

    fn state(burst: u32) -> (AppState, Arc<MemQueue>) {
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(MemQueue::in_memory());
        let store: Arc<dyn Store> = Arc::new(KvStore::new(MemKv::default()));
        let scheduler = TaskScheduler::new(store.clone(), queue.clone(), metrics.clone(), opts());
        let sink = AlertSink {
            store: store.clone(),
            queue: queue.clone(),
            broadcaster: Broadcaster::new(metrics.clone()),
            task_queue: "task_queue".into(),
            script: "scripts/alert_handler.py".into(),
            metrics: metrics.clone(),
        };
        let monitor = LogMonitor::new(sink, 100, Duration::from_millis(20));
        let state = AppState {
            scheduler,
            monitor,
            store,
            metrics,
            breaker: Arc::new(CircuitBreaker::new(Settings::trip_after("exec", 0))),
            limiter: Arc::new(RateLimiter::new(1.0, burst, 100)),
            runner: Runner::new("", None),
            started: Instant::now(),
        };
        (state, queue)
    }

    fn req(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request {
        let b = http::Request::builder().method(method).uri(uri);
        match body {
            Some(v) => b.header(header::CONTENT_TYPE, "application/json").body(Body::from(v.to_string())).unwrap(),
            None => b.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(res: Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn add_list_and_delete_tasks() {
        let (state, _) = state(100);
        let app = router(state);

        let body = json!({"id": "backup", "name": "backup", "type": "monitor", "script": "b.py", "schedule": "@every 1h"});
        let res = app.clone().oneshot(req(Method::POST, "/api/v1/tasks", Some(body))).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = app.clone().oneshot(req(Method::GET, "/api/v1/tasks", None)).await.unwrap();
        let list = json_body(res).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["status"], "created");

        let res = app.clone().oneshot(req(Method::DELETE, "/api/v1/tasks/backup", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = app.oneshot(req(Method::DELETE, "/api/v1/tasks/backup", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_schedule_is_a_bad_request() {
        let (state, _) = state(100);
        let body = json!({"name": "x", "script": "x.py", "schedule": "whenever"});
        let res = router(state).oneshot(req(Method::POST, "/api/v1/tasks", Some(body))).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["error"].as_str().unwrap().contains("whenever"));
    }

    #[tokio::test]
    async fn execute_trips_the_breaker() {
        let (state, _) = state(100);
        state.scheduler.add_task(Job::new("bad", "bad", "cicd", "/no/such/program")).unwrap();
        let app = router(state.clone());

        let res = app.clone().oneshot(req(Method::POST, "/api/v1/tasks/bad/execute", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        let res = app.clone().oneshot(req(Method::POST, "/api/v1/tasks/bad/execute", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.metrics.breaker_rejections.get(), 1);

        let res = app.oneshot(req(Method::POST, "/api/v1/tasks/ghost/execute", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enqueue_pushes_to_the_task_queue() {
        let (state, queue) = state(100);
        state.scheduler.add_task(Job::new("j", "j", "vcs", "git.py")).unwrap();
        let res = router(state).oneshot(req(Method::POST, "/api/v1/tasks/j/enqueue", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(queue.len("task_queue").unwrap(), 1);
    }

    #[tokio::test]
    async fn limiter_answers_429() {
        let (state, _) = state(2);
        let app = router(state.clone());
        for _ in 0..2 {
            let res = app.clone().oneshot(req(Method::GET, "/health", None)).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app.oneshot(req(Method::GET, "/health", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(res).await;
        assert_eq!(body, json!({"error": "rate limit exceeded", "retry_after": "1s"}));
        assert_eq!(state.metrics.rate_limited.get(), 1);
    }

    #[tokio::test]
    async fn watch_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();
        let p = path.display().to_string();
        let (state, _) = state(100);
        let app = router(state.clone());

        let bad = json!({"path": p, "patterns": ["("]});
        let res = app.clone().oneshot(req(Method::POST, "/api/v1/monitor/watch", Some(bad))).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let ok = json!({"path": p, "patterns": ["(?i)error"]});
        let res = app.clone().oneshot(req(Method::POST, "/api/v1/monitor/watch", Some(ok))).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(state.monitor.watched(), vec![p.clone()]);

        let uri = format!("/api/v1/monitor/watch?path={}", p.replace('/', "%2F"));
        let res = app.oneshot(req(Method::DELETE, &uri, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        state.monitor.stop().await;
    }

    #[tokio::test]
    async fn submitted_alerts_are_listed() {
        let (state, _) = state(100);
        state.monitor.start();
        let app = router(state.clone());

        let body = json!({"message": "warning: cert expires in 3 days", "source": "certbot"});
        let res = app.clone().oneshot(req(Method::POST, "/api/v1/alerts", Some(body))).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(res).await["severity"], "warning");

        let mut listed = serde_json::Value::Null;
        for _ in 0..100 {
            let res = app.clone().oneshot(req(Method::GET, "/api/v1/alerts?limit=5", None)).await.unwrap();
            listed = json_body(res).await;
            if !listed.as_array().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state.monitor.stop().await;
        assert_eq!(listed[0]["source"], "certbot");
        assert_eq!(listed[0]["type"], "external");
    }

    #[tokio::test]
    async fn module_fails_without_shutdown_when_bind_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (state, _) = state(100);
        let server = Box::new(WebServer {
            state,
            http_addr: Some(taken.local_addr().unwrap()),
            https_addr: None,
            tls_cert_pem: None,
            tls_key_pem: None,
        });
        let (_shutdown_tx, shutdown) = tokio::sync::watch::channel(false);

        let handle = server.spawn(ModuleCtx { shutdown });
        let res = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn module_stops_cleanly_on_shutdown() {
        let (state, _) = state(100);
        let server = Box::new(WebServer {
            state,
            http_addr: Some("127.0.0.1:0".parse().unwrap()),
            https_addr: None,
            tls_cert_pem: None,
            tls_key_pem: None,
        });
        let (shutdown_tx, shutdown) = tokio::sync::watch::channel(false);

        let handle = server.spawn(ModuleCtx { shutdown });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        shutdown_tx.send_replace(true);
        let res = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(res.is_ok());
    }
}
