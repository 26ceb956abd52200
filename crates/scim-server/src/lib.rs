mod agent;
mod decision_log;
mod dialogs;
mod engine;
mod persistence;
mod stores;

pub use agent::Outbox;
pub use decision_log::{verify_decision_log, DecisionLog, DecisionRecord};
pub use dialogs::{ActiveFlow, DialogGuard, DialogTable};
pub use engine::{Scim, Stats};
pub use persistence::{
    open_snapshot_store, FileSnapshots, MemorySnapshots, PersistError, SnapshotStore,
    SqliteSnapshots,
};
pub use stores::{ChainSnapshot, ChainStore, ContextSnapshot, ContextStore, PrincipalContext};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use scim_config::Config;
use scim_contracts::{Disposition, Outbound, RoutingReport, SipRequest, SipResponse};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg).await?;
    let sweeper = spawn_dialog_sweeper(
        Arc::clone(&state.scim),
        state.sweep_interval,
        state.idle_timeout,
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "scim listening");
    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"));

    sweeper.abort();
    state.scim.save_all();
    info!("routing state saved");
    served
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg).await?))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/requests", post(requests))
        .route("/v1/responses", post(responses))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    scim: Arc<Scim>,
    decisions: Arc<DecisionLog>,
    egress: Option<Arc<Egress>>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let snapshots = open_snapshot_store(&cfg.store);
        let egress = match cfg.transport.egress_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Some(Arc::new(Egress::new(
                url,
                Duration::from_millis(cfg.transport.timeout_ms),
            )?)),
            _ => None,
        };
        Ok(Self {
            scim: Arc::new(Scim::new(&cfg, snapshots)),
            decisions: Arc::new(DecisionLog::open(&cfg.decision_log.jsonl_path).await?),
            egress,
            idle_timeout: Duration::from_millis(cfg.dialogs.idle_timeout_ms),
            sweep_interval: Duration::from_millis(cfg.dialogs.sweep_interval_ms),
        })
    }

    async fn handle_request(&self, request: SipRequest) -> RoutingReport {
        let dialog_id = request.dialog_id.clone();
        let principal = request.uri.principal();
        let mut outbox = Outbox::for_request(&request);
        let disposition = self.scim.on_request(request, &mut outbox).await;
        let event = match disposition {
            Disposition::Control { .. } => "control",
            _ => "request",
        };
        let record = DecisionRecord::new(&dialog_id, &principal, event, &disposition);
        self.finish(record, dialog_id, disposition, outbox).await
    }

    async fn handle_response(&self, response: SipResponse) -> RoutingReport {
        let dialog_id = response.dialog_id.clone();
        let principal = response.to.principal();
        let status = response.status;
        let mut outbox = Outbox::for_response(&response);
        let disposition = self.scim.on_response(response, &mut outbox).await;
        let record = DecisionRecord::new(&dialog_id, &principal, "response", &disposition)
            .with_status(status);
        self.finish(record, dialog_id, disposition, outbox).await
    }

    async fn finish(
        &self,
        record: DecisionRecord,
        dialog_id: String,
        disposition: Disposition,
        outbox: Outbox,
    ) -> RoutingReport {
        self.decisions.append(record).await;
        let messages = outbox.into_messages();
        if let Some(egress) = &self.egress {
            egress.deliver(&dialog_id, &messages).await;
        }
        RoutingReport {
            dialog_id,
            disposition,
            messages,
        }
    }
}

/// Hands outbound messages to the signaling stack over HTTP.
struct Egress {
    client: Client,
    url: String,
}

impl Egress {
    fn new(url: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("egress client init failed: {e}"))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn deliver(&self, dialog_id: &str, messages: &[Outbound]) {
        if messages.is_empty() {
            return;
        }
        match self.client.post(&self.url).json(messages).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(%dialog_id, count = messages.len(), "egress delivered");
            }
            Ok(resp) => {
                warn!(%dialog_id, status = %resp.status(), "egress rejected messages");
            }
            Err(e) => {
                warn!(%dialog_id, error = %e, "egress delivery failed");
            }
        }
    }
}

fn spawn_dialog_sweeper(scim: Arc<Scim>, every: Duration, idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = scim.evict_idle(idle);
            if evicted > 0 {
                info!(evicted, "evicted idle dialogs");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.scim.stats())
}

async fn requests(
    State(state): State<AppState>,
    Json(request): Json<SipRequest>,
) -> Result<Json<RoutingReport>, (StatusCode, Json<Value>)> {
    validate_request(&request).map_err(bad_request)?;
    Ok(Json(state.handle_request(request).await))
}

async fn responses(
    State(state): State<AppState>,
    Json(response): Json<SipResponse>,
) -> Result<Json<RoutingReport>, (StatusCode, Json<Value>)> {
    validate_response(&response).map_err(bad_request)?;
    Ok(Json(state.handle_response(response).await))
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error":{"code":"validation_error","message":message}})),
    )
}

fn validate_request(r: &SipRequest) -> Result<(), String> {
    if r.dialog_id.trim().is_empty() {
        return Err("dialog_id must not be empty".to_string());
    }
    if r.method.trim().is_empty() {
        return Err("method must not be empty".to_string());
    }
    if r.cseq.method.trim().is_empty() {
        return Err("cseq.method must not be empty".to_string());
    }
    Ok(())
}

fn validate_response(r: &SipResponse) -> Result<(), String> {
    if r.dialog_id.trim().is_empty() {
        return Err("dialog_id must not be empty".to_string());
    }
    if !(100..=699).contains(&r.status) {
        return Err("status must be within 100..=699".to_string());
    }
    Ok(())
}
