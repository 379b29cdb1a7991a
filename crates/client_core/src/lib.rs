use std::{sync::Arc, time::Duration};

use futures::{stream::SplitStream, SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::BatchId,
    error::ApiError,
    protocol::{
        BatchStatusResponse, ResultEvent, StreamEvent, StreamRequest, SubmitBatchRequest,
        SubmitBatchResponse,
    },
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("batch rejected: {0}")]
    Rejected(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no active batch to rejoin")]
    NoActiveBatch,
}

/// Events surfaced to the embedding UI, in arrival order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Joined {
        batch_id: BatchId,
    },
    ResultReceived(ResultEvent),
    BatchCompleted {
        batch_id: BatchId,
        expected: u32,
        received: u32,
    },
    Disconnected,
    Error(String),
}

/// Streaming-link state. The guard against a second join while already
/// joined to the same batch lives here, not in ad hoc flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Joined(BatchId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Submitting,
    AwaitingResults,
    /// Every expected result has arrived; the stream stays open until the
    /// caller closes it or submits again.
    Draining,
}

struct SessionState {
    bearer_token: Option<String>,
    phase: SessionPhase,
    link: LinkState,
    active_batch: Option<BatchId>,
    results: Vec<ResultEvent>,
    ws_task: Option<JoinHandle<()>>,
}

/// Caller-owned session: submit a batch, hold exactly one streaming
/// subscription for it, and accumulate results as they arrive. No ambient
/// singletons; connect/join/close are explicit.
pub struct BatchSession {
    http: Client,
    server_url: String,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl BatchSession {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        Self::with_token(server_url, None)
    }

    pub fn with_bearer_token(server_url: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        Self::with_token(server_url, Some(token.into()))
    }

    fn with_token(server_url: impl Into<String>, bearer_token: Option<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            inner: Mutex::new(SessionState {
                bearer_token,
                phase: SessionPhase::Idle,
                link: LinkState::Disconnected,
                active_batch: None,
                results: Vec::new(),
                ws_task: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn set_bearer_token(&self, token: Option<String>) {
        self.inner.lock().await.bearer_token = token;
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn link(&self) -> LinkState {
        self.inner.lock().await.link.clone()
    }

    pub async fn connected(&self) -> bool {
        !matches!(self.inner.lock().await.link, LinkState::Disconnected)
    }

    pub async fn active_batch(&self) -> Option<BatchId> {
        self.inner.lock().await.active_batch.clone()
    }

    /// Results received so far, in arrival order. Arrival order may differ
    /// from submission order; correlate via `command_index`.
    pub async fn results(&self) -> Vec<ResultEvent> {
        self.inner.lock().await.results.clone()
    }

    /// Submits the commands, then opens the streaming link and joins the
    /// returned batch. Prior results are cleared; a stale link to a
    /// different batch is torn down first.
    pub async fn submit_batch(self: &Arc<Self>, commands: &[String]) -> Result<BatchId, SessionError> {
        let bearer_token = {
            let mut guard = self.inner.lock().await;
            guard.phase = SessionPhase::Submitting;
            guard.results.clear();
            guard.bearer_token.clone()
        };

        let mut request = self
            .http
            .post(format!("{}/batch", self.server_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&SubmitBatchRequest {
                commands: commands.to_vec(),
            });
        if let Some(token) = &bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.inner.lock().await.phase = SessionPhase::Idle;
                return Err(SessionError::Transport(err.to_string()));
            }
        };
        if !response.status().is_success() {
            let error = error_from_response(response).await;
            self.inner.lock().await.phase = SessionPhase::Idle;
            return Err(error);
        }

        let body: SubmitBatchResponse = response
            .json()
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        self.attach_stream(body.batch_id.clone()).await?;
        self.inner.lock().await.phase = SessionPhase::AwaitingResults;
        Ok(body.batch_id)
    }

    /// Joins an arbitrary batch id on a fresh or existing link. Joining an
    /// id that was never submitted is legal; the subscription stays dormant.
    pub async fn join_batch(self: &Arc<Self>, batch_id: BatchId) -> Result<(), SessionError> {
        self.attach_stream(batch_id).await?;
        self.inner.lock().await.phase = SessionPhase::AwaitingResults;
        Ok(())
    }

    /// Re-establishes the link for the active batch after a disconnect.
    /// Never called automatically: partial output plus an explicit
    /// connectivity indicator beats silent reconnect loops.
    pub async fn rejoin(self: &Arc<Self>) -> Result<(), SessionError> {
        let batch_id = self
            .inner
            .lock()
            .await
            .active_batch
            .clone()
            .ok_or(SessionError::NoActiveBatch)?;
        self.attach_stream(batch_id).await
    }

    pub async fn fetch_status(&self, batch_id: &BatchId) -> Result<BatchStatusResponse, SessionError> {
        let response = self
            .http
            .get(format!("{}/batch/{}", self.server_url, batch_id))
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    /// Deliberate close. Accumulated results stay visible.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.ws_task.take() {
            task.abort();
        }
        guard.link = LinkState::Disconnected;
        guard.phase = SessionPhase::Idle;
    }

    async fn attach_stream(self: &Arc<Self>, batch_id: BatchId) -> Result<(), SessionError> {
        let bearer_token = {
            let mut guard = self.inner.lock().await;
            if guard.link == LinkState::Joined(batch_id.clone()) {
                // Idempotent join: one live subscription per batch.
                guard.active_batch = Some(batch_id);
                return Ok(());
            }
            if let Some(task) = guard.ws_task.take() {
                task.abort();
            }
            guard.link = LinkState::Connecting;
            guard.active_batch = Some(batch_id.clone());
            guard.bearer_token.clone()
        };

        let ws_url = stream_url(&self.server_url, bearer_token.as_deref())?;
        let (mut ws_stream, _) = match connect_async(ws_url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                self.inner.lock().await.link = LinkState::Disconnected;
                return Err(SessionError::Transport(format!(
                    "failed to connect stream: {err}"
                )));
            }
        };

        let join = serde_json::to_string(&StreamRequest::Join {
            batch_id: batch_id.clone(),
        })
        .map_err(|err| SessionError::Transport(err.to_string()))?;
        if let Err(err) = ws_stream.send(Message::Text(join)).await {
            self.inner.lock().await.link = LinkState::Disconnected;
            return Err(SessionError::Transport(format!("failed to join: {err}")));
        }

        let (_, ws_reader) = ws_stream.split();
        let session = Arc::clone(self);
        let task = tokio::spawn(session.read_stream(ws_reader));

        let mut guard = self.inner.lock().await;
        guard.link = LinkState::Joined(batch_id);
        guard.ws_task = Some(task);
        Ok(())
    }

    async fn read_stream(self: Arc<Self>, mut reader: WsReader) {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<StreamEvent>(&text) {
                    Ok(StreamEvent::Joined { batch_id }) => {
                        let _ = self.events.send(ClientEvent::Joined { batch_id });
                    }
                    Ok(StreamEvent::Result(result)) => {
                        self.inner.lock().await.results.push(result.clone());
                        let _ = self.events.send(ClientEvent::ResultReceived(result));
                    }
                    Ok(StreamEvent::BatchComplete {
                        batch_id,
                        expected,
                        received,
                    }) => {
                        self.inner.lock().await.phase = SessionPhase::Draining;
                        let _ = self.events.send(ClientEvent::BatchCompleted {
                            batch_id,
                            expected,
                            received,
                        });
                    }
                    Ok(StreamEvent::Error(api_error)) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(api_error.message.clone()));
                    }
                    Err(err) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("invalid stream event: {err}")));
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "stream receive failed");
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("stream receive failed: {err}")));
                    break;
                }
            }
        }

        // Mark disconnected but keep everything already received; the
        // caller decides between rejoin() and a fresh submission.
        self.inner.lock().await.link = LinkState::Disconnected;
        let _ = self.events.send(ClientEvent::Disconnected);
    }
}

async fn error_from_response(response: reqwest::Response) -> SessionError {
    let status = response.status();
    let message = match response.json::<ApiError>().await {
        Ok(api_error) => api_error.message,
        Err(_) => status.to_string(),
    };
    match status {
        reqwest::StatusCode::UNAUTHORIZED => SessionError::Unauthorized(message),
        reqwest::StatusCode::BAD_REQUEST => SessionError::Rejected(message),
        reqwest::StatusCode::BAD_GATEWAY => SessionError::Dispatch(message),
        _ => SessionError::Transport(message),
    }
}

/// Maps the HTTP base url onto the streaming endpoint. The bearer token
/// rides along as a query parameter: the two transports are independent
/// and the socket handshake inherits nothing from the HTTP client.
fn stream_url(server_url: &str, bearer_token: Option<&str>) -> Result<Url, SessionError> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(SessionError::Transport(
            "server_url must start with http:// or https://".into(),
        ));
    };

    let mut url = Url::parse(&format!("{ws_base}/ws"))
        .map_err(|err| SessionError::Transport(err.to_string()))?;
    if let Some(token) = bearer_token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests;
