use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

use super::metrics::PsMetrics;
use super::wire::{
    AbnormalMessage, AbnormalsMessage, DumpResponse, MessageResponse, PsSnapshot,
    StatMessage, StatsMessage,
};
use super::ParameterServer;

/// HTTP front end of a [`ParameterServer`].
///
/// Lifecycle is `new -> start -> (clear)* -> stop`. A `POST /shutdown` from
/// any rank cancels the same token as [`PsService::stop`].
pub struct PsService {
    store: Arc<ParameterServer>,
    metrics: Arc<PsMetrics>,
    addr: String,
    dump_path: Option<PathBuf>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PsService {
    pub fn new(store: Arc<ParameterServer>, cfg: &ServerConfig) -> Result<Self> {
        let metrics = Arc::new(PsMetrics::new().context("creating parameter server metrics")?);

        Ok(Self {
            store,
            metrics,
            addr: cfg.addr.clone(),
            dump_path: cfg.dump_path.clone(),
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<ParameterServer> {
        &self.store
    }

    /// Binds the listener and serves in a background task.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let cancel = CancellationToken::new();
        let app_state = Arc::new(AppState {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            dump_path: self.dump_path.clone(),
            shutdown: cancel.clone(),
        });

        let app = router(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        *self.shutdown.lock() = Some(cancel.clone());

        let handle = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "parameter server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "parameter server error");
            }

            tracing::info!(addr = %local_addr, "parameter server stopped");
        });
        *self.task.lock() = Some(handle);

        Ok(local_addr)
    }

    /// Token cancelled when the service is asked to shut down.
    pub fn shutdown_token(&self) -> Option<CancellationToken> {
        self.shutdown.lock().clone()
    }

    /// Cancels the serve loop and waits for it to exit.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        self.wait().await
    }

    /// Waits for the serve loop to exit without cancelling it.
    pub async fn wait(&self) -> Result<()> {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.await.context("joining parameter server task")?;
        }
        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    store: Arc<ParameterServer>,
    metrics: Arc<PsMetrics>,
    dump_path: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl AppState {
    fn observe_merge(&self, route: &str, start: Instant) {
        self.metrics
            .merge_duration
            .with_label_values(&[route])
            .observe(start.elapsed().as_secs_f64());
        self.metrics.functions_tracked.set(self.store.len() as i64);
        self.metrics.record_request(route, "ok");
    }

    /// Unwraps an extracted body, counting rejected requests as errors.
    fn accept<T, E>(&self, route: &str, payload: Result<T, E>) -> Result<T, (StatusCode, String)>
    where
        E: Rejected,
    {
        payload.map_err(|rejection| {
            self.metrics.record_request(route, "error");
            tracing::debug!(route, error = %rejection.text(), "request rejected");
            (rejection.status(), rejection.text())
        })
    }
}

/// Extractor rejections reported back to the caller.
trait Rejected {
    fn status(&self) -> StatusCode;
    fn text(&self) -> String;
}

impl Rejected for JsonRejection {
    fn status(&self) -> StatusCode {
        JsonRejection::status(self)
    }

    fn text(&self) -> String {
        self.body_text()
    }
}

impl Rejected for PathRejection {
    fn status(&self) -> StatusCode {
        PathRejection::status(self)
    }

    fn text(&self) -> String {
        self.body_text()
    }
}

type Reply<T> = Result<Json<T>, (StatusCode, String)>;

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/update", post(update_handler))
        .route("/update_all", post(update_all_handler))
        .route("/stat", post(stat_all_handler))
        .route("/stat/:id", post(stat_handler))
        .route("/add_abnormal", post(add_abnormal_handler))
        .route("/add_abnormal_all", post(add_abnormal_all_handler))
        .route("/clear", post(clear_handler))
        .route("/dump", post(dump_handler))
        .route("/shutdown", post(shutdown_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// POST /update - Merge one function's partial statistics.
async fn update_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StatMessage>, JsonRejection>,
) -> Reply<StatMessage> {
    let Json(req) = state.accept("update", payload)?;
    let start = Instant::now();
    let stat = state.store.update(req.id, req.stat);
    state.observe_merge("update", start);

    Ok(Json(StatMessage { id: req.id, stat }))
}

/// POST /update_all - Merge a batch of partial statistics.
async fn update_all_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StatsMessage>, JsonRejection>,
) -> Reply<StatsMessage> {
    let Json(req) = state.accept("update_all", payload)?;
    let start = Instant::now();
    state.metrics.update_batch_size.observe(req.stats.len() as f64);
    let stats = state.store.update_all(&req.stats);
    state.observe_merge("update_all", start);

    Ok(Json(StatsMessage { stats }))
}

/// POST /stat/{id} - Current statistics of one function.
async fn stat_handler(
    State(state): State<Arc<AppState>>,
    id: Result<Path<u64>, PathRejection>,
) -> Reply<StatMessage> {
    let Path(id) = state.accept("stat", id)?;
    state.metrics.record_request("stat", "ok");
    Ok(Json(StatMessage {
        id,
        stat: state.store.get(id),
    }))
}

/// POST /stat - Current statistics of every function.
async fn stat_all_handler(State(state): State<Arc<AppState>>) -> Json<PsSnapshot> {
    state.metrics.record_request("stat_all", "ok");
    Json(PsSnapshot {
        ps: state.store.get_all(),
    })
}

/// POST /add_abnormal - Add to one function's anomaly count.
async fn add_abnormal_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AbnormalMessage>, JsonRejection>,
) -> Reply<AbnormalMessage> {
    let Json(req) = state.accept("add_abnormal", payload)?;
    let start = Instant::now();
    let abnormal = state.store.add_abnormal(req.id, req.abnormal);
    state.observe_merge("add_abnormal", start);

    Ok(Json(AbnormalMessage {
        id: req.id,
        abnormal,
    }))
}

/// POST /add_abnormal_all - Add to several functions' anomaly counts.
async fn add_abnormal_all_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AbnormalsMessage>, JsonRejection>,
) -> Reply<AbnormalsMessage> {
    let Json(req) = state.accept("add_abnormal_all", payload)?;
    let start = Instant::now();
    let abnormals = state.store.add_abnormal_all(&req.abnormals);
    state.observe_merge("add_abnormal_all", start);

    Ok(Json(AbnormalsMessage { abnormals }))
}

/// POST /clear - Reset every function to empty statistics.
async fn clear_handler(State(state): State<Arc<AppState>>) -> Json<MessageResponse> {
    state.store.clear();
    state.metrics.record_request("clear", "ok");
    tracing::info!(functions = state.store.len(), "parameter server cleared");

    Json(MessageResponse {
        message: "parameter server cleared".to_string(),
    })
}

/// POST /dump - Write a snapshot to the configured path.
///
/// The request body is ignored; callers never choose where the server writes.
async fn dump_handler(State(state): State<Arc<AppState>>) -> Reply<DumpResponse> {
    let Some(path) = state.dump_path.clone() else {
        state.metrics.record_request("dump", "error");
        return Err((
            StatusCode::BAD_REQUEST,
            "no dump path configured".to_string(),
        ));
    };

    let store = state.store.clone();
    let target = path.clone();
    let written = tokio::task::spawn_blocking(move || store.dump(&target))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r);

    match written {
        Ok(functions) => {
            state.metrics.record_request("dump", "ok");
            tracing::info!(path = %path.display(), functions, "statistics dumped");
            Ok(Json(DumpResponse { path, functions }))
        }
        Err(e) => {
            state.metrics.record_request("dump", "error");
            tracing::error!(error = ?e, path = %path.display(), "dumping statistics");
            Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))
        }
    }
}

/// POST /shutdown - Stop serving after in-flight requests complete.
async fn shutdown_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.metrics.record_request("shutdown", "ok");
    tracing::info!("shutdown requested");
    state.shutdown.cancel();
    "parameter server shutting down"
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
