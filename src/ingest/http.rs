//! HTTP intent endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::models::TradeIntent;
use crate::trading::{Firewall, IngestConfig};

use super::{IngestStats, Intake, IntentIngestor, IntentQueue, QueueError};

#[derive(Clone)]
struct AppState {
    intake: Intake,
    queue: IntentQueue,
}

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Ingestor accepting intents as `POST` bodies.
pub struct HttpIngestor {
    config: IngestConfig,
    intake: Intake,
    queue: IntentQueue,
    running: Mutex<Option<Running>>,
}

impl HttpIngestor {
    pub fn new(firewall: Arc<Firewall>, config: IngestConfig) -> Self {
        let queue = IntentQueue::new(config.queue_capacity);
        Self {
            config,
            intake: Intake::new(firewall),
            queue,
            running: Mutex::new(None),
        }
    }

    /// Address actually bound, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    fn router(&self) -> Router {
        let state = AppState {
            intake: self.intake.clone(),
            queue: self.queue.clone(),
        };

        Router::new()
            .route(&self.config.http_path, post(submit_intent))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[async_trait]
impl IntentIngestor for HttpIngestor {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        anyhow::ensure!(running.is_none(), "HTTP ingestor already running");

        let listener = tokio::net::TcpListener::bind(&self.config.http_bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.http_bind))?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "HTTP ingestor server failed");
            }
        });

        info!(addr = %local_addr, path = %self.config.http_path, "HTTP ingestor listening");
        *running = Some(Running {
            handle,
            shutdown,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(Running { mut handle, shutdown, local_addr }) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        let limit = Duration::from_millis(self.config.shutdown_timeout_ms);
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined.context("HTTP ingestor task panicked")?,
            Err(_) => {
                warn!(timeout_ms = self.config.shutdown_timeout_ms, "HTTP ingestor did not stop in time, aborting");
                handle.abort();
            }
        }

        info!(addr = %local_addr, queued = self.queue.depth(), "HTTP ingestor stopped");
        Ok(())
    }

    async fn get_next_intent(&self, timeout: Duration) -> Option<TradeIntent> {
        self.queue.pop(timeout).await
    }

    fn get_stats(&self) -> IngestStats {
        self.intake.stats(self.queue.depth())
    }
}

/// POST handler: parse, validate, enqueue.
async fn submit_intent(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    // Hold a slot before validating, so a refused request never burns its intent ID.
    let permit = match state.queue.try_reserve() {
        Ok(permit) => permit,
        Err(QueueError::Full) => {
            state.intake.record_queue_full();
            warn!("Intent queue full, refusing request");
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "queue_full" })));
        }
        Err(QueueError::Closed) => {
            error!("Intent queue closed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            );
        }
    };

    match state.intake.admit(&body) {
        Ok(intent) => {
            let intent_id = intent.intent_id().to_string();
            permit.send(intent);
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "intent_id": intent_id })),
            )
        }
        Err(e) => {
            let status = if e.is_duplicate() {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            (
                status,
                Json(json!({ "error": e.reason_code(), "detail": e.to_string() })),
            )
        }
    }
}
