use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dispatch::{BatchRegistry, Dispatcher, MissingCommandExecutor, ResultBroker};
use serde::Deserialize;
use shared::{
    domain::{BatchId, Principal},
    error::{ApiError, DispatchError, ErrorCode},
    protocol::{
        BatchStatusResponse, ResultEvent, StreamEvent, StreamRequest, SubmitBatchRequest,
        SubmitBatchResponse,
    },
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{info, warn, Instrument};

mod agent;
mod config;

use agent::HttpCommandExecutor;
use config::load_settings;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Result report from the executor side. The batch id comes from the path.
#[derive(Debug, Deserialize)]
struct IngestResultRequest {
    command_index: u32,
    output: String,
    success: bool,
    #[serde(default)]
    emitted_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let registry = Arc::new(BatchRegistry::new());
    let broker = Arc::new(ResultBroker::with_capacity(settings.topic_capacity));
    let dispatcher = match &settings.agent_url {
        Some(agent_url) => Arc::new(Dispatcher::new(
            registry,
            broker,
            Arc::new(HttpCommandExecutor::new(agent_url.clone())),
        )),
        None => {
            warn!("no agent_url configured; batch submissions will fail until one is set");
            Arc::new(Dispatcher::new(
                registry,
                broker,
                Arc::new(MissingCommandExecutor),
            ))
        }
    };

    let sweeper = Arc::clone(&dispatcher);
    let retention = Duration::from_secs(settings.retention_seconds);
    let sweep_interval = Duration::from_secs(settings.sweep_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let evicted = sweeper.evict_completed(retention);
            if evicted > 0 {
                info!(evicted, "evicted completed batches");
            }
        }
    });

    let state = AppState { dispatcher };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "controller listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/batch", post(submit_batch))
        .route("/batch/:batch_id", get(batch_status))
        .route("/batch/:batch_id/results", post(ingest_result))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn dispatch_error_response(err: DispatchError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        DispatchError::EmptyBatch => StatusCode::BAD_REQUEST,
        DispatchError::UnknownBatch(_) => StatusCode::NOT_FOUND,
        DispatchError::ExecutorRefused(_) | DispatchError::ExecutorUnreachable(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, Json(ApiError::from(&err)))
}

async fn submit_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SubmitBatchRequest>,
) -> Result<Json<SubmitBatchResponse>, (StatusCode, Json<ApiError>)> {
    let token = bearer_token(&headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            )),
        )
    })?;

    // The token is opaque here; it doubles as the owning principal and is
    // forwarded so the executor can apply its own authorization.
    let principal = Principal::new(token.clone());
    let batch_id = state
        .dispatcher
        .submit(&req.commands, principal, Some(token))
        .await
        .map_err(dispatch_error_response)?;

    Ok(Json(SubmitBatchResponse { batch_id }))
}

async fn batch_status(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatusResponse>, (StatusCode, Json<ApiError>)> {
    let batch_id = BatchId(batch_id);
    let snapshot = state.dispatcher.status(&batch_id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, "unknown batch")),
        )
    })?;

    Ok(Json(BatchStatusResponse {
        batch_id,
        expected: snapshot.expected,
        received: snapshot.received,
        status: snapshot.status,
    }))
}

/// Executor-facing ingest. Always 202: results referencing unknown batches
/// are logged and dropped inside the dispatcher, never surfaced as errors
/// to the reporting side.
async fn ingest_result(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    Json(req): Json<IngestResultRequest>,
) -> StatusCode {
    state.dispatcher.publish_result(ResultEvent {
        batch_id: BatchId(batch_id),
        command_index: req.command_index,
        output: req.output,
        success: req.success,
        emitted_at: req.emitted_at.unwrap_or_else(Utc::now),
    });
    StatusCode::ACCEPTED
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    // Joins are not gated on the token; it only tags the connection's logs.
    let span = tracing::info_span!("stream_connection", authenticated = query.token.is_some());
    ws.on_upgrade(move |socket| ws_connection(state, socket).instrument(span))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // One forwarder per joined batch; the map is what makes joins
    // idempotent per connection.
    let mut joined: HashMap<BatchId, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<StreamRequest>(&text) {
            Ok(StreamRequest::Join { batch_id }) => {
                if joined.contains_key(&batch_id) {
                    let _ = out_tx.send(StreamEvent::Joined { batch_id });
                    continue;
                }
                // Unknown ids subscribe too: results may be racing the join.
                let mut events = state.dispatcher.broker().subscribe(&batch_id);
                let _ = out_tx.send(StreamEvent::Joined {
                    batch_id: batch_id.clone(),
                });
                let forward_tx = out_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                if forward_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "slow stream subscriber, events dropped");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
                joined.insert(batch_id, handle);
            }
            Ok(StreamRequest::Leave { batch_id }) => {
                if let Some(handle) = joined.remove(&batch_id) {
                    handle.abort();
                    let _ = handle.await;
                    state.dispatcher.broker().prune(&batch_id);
                }
            }
            Err(err) => {
                let _ = out_tx.send(StreamEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    format!("invalid stream request: {err}"),
                )));
            }
        }
    }

    for (batch_id, handle) in joined {
        handle.abort();
        let _ = handle.await;
        state.dispatcher.broker().prune(&batch_id);
    }
    send_task.abort();
}
