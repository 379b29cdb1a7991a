use super::super::*;

use std::{collections::HashMap, net::SocketAddr};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dispatch::{BatchRegistry, CommandExecutor, Dispatcher, QueueCommandExecutor, ResultBroker};
use shared::{
    domain::Principal,
    error::{ApiError, DispatchError, ErrorCode},
    protocol::SubmitBatchRequest as WireSubmitRequest,
};
use tokio::{sync::broadcast::error::RecvError, time::timeout};

struct TestServer {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    close_tx: broadcast::Sender<()>,
    server_task: JoinHandle<()>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Server-side close of every open streaming connection.
    fn close_connections(&self) {
        let _ = self.close_tx.send(());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

#[derive(Clone)]
struct HarnessState {
    dispatcher: Arc<Dispatcher>,
    close_tx: broadcast::Sender<()>,
}

async fn spawn_server(executor: Arc<dyn CommandExecutor>) -> TestServer {
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(BatchRegistry::new()),
        Arc::new(ResultBroker::new()),
        executor,
    ));
    let (close_tx, _) = broadcast::channel(8);

    let state = HarnessState {
        dispatcher: Arc::clone(&dispatcher),
        close_tx: close_tx.clone(),
    };
    let app = Router::new()
        .route("/batch", post(harness_submit))
        .route("/ws", get(harness_ws))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server_task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        addr,
        dispatcher,
        close_tx,
        server_task,
    }
}

/// Queue-backed server whose "agent" echoes each command's argument back
/// as its output. It waits for a subscriber before publishing so the
/// tests do not race the client's join.
async fn spawn_echo_server() -> TestServer {
    let (executor, mut dispatches) = QueueCommandExecutor::new();
    let server = spawn_server(Arc::new(executor)).await;

    let dispatcher = Arc::clone(&server.dispatcher);
    tokio::spawn(async move {
        while let Some(dispatch) = dispatches.recv().await {
            for _ in 0..100 {
                if dispatcher.broker().subscriber_count(&dispatch.batch_id) > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            for spec in dispatch.commands {
                let output = spec
                    .command
                    .strip_prefix("echo ")
                    .unwrap_or(&spec.command)
                    .to_string();
                dispatcher.publish_result(ResultEvent {
                    batch_id: dispatch.batch_id.clone(),
                    command_index: spec.index,
                    output: format!("{output}\n"),
                    success: true,
                    emitted_at: Utc::now(),
                });
            }
        }
    });

    server
}

/// Accepts every batch and never reports anything; tests publish results
/// by hand through the dispatcher.
async fn spawn_silent_server() -> TestServer {
    let (executor, mut dispatches) = QueueCommandExecutor::new();
    let server = spawn_server(Arc::new(executor)).await;
    tokio::spawn(async move { while dispatches.recv().await.is_some() {} });
    server
}

async fn harness_submit(
    State(state): State<HarnessState>,
    headers: HeaderMap,
    Json(req): Json<WireSubmitRequest>,
) -> Result<Json<SubmitBatchResponse>, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(
                    ErrorCode::Unauthorized,
                    "missing bearer token",
                )),
            )
        })?;

    let batch_id = state
        .dispatcher
        .submit(&req.commands, Principal::new(token.clone()), Some(token))
        .await
        .map_err(|err| {
            let status = match &err {
                DispatchError::EmptyBatch => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(ApiError::from(&err)))
        })?;

    Ok(Json(SubmitBatchResponse { batch_id }))
}

async fn harness_ws(ws: WebSocketUpgrade, State(state): State<HarnessState>) -> impl IntoResponse {
    let close_rx = state.close_tx.subscribe();
    ws.on_upgrade(move |socket| harness_ws_connection(state.dispatcher, close_rx, socket))
}

async fn harness_ws_connection(
    dispatcher: Arc<Dispatcher>,
    mut close_rx: broadcast::Receiver<()>,
    socket: WebSocket,
) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut joined: HashMap<BatchId, JoinHandle<()>> = HashMap::new();
    loop {
        tokio::select! {
            _ = close_rx.recv() => break,
            msg = receiver.next() => {
                let Some(Ok(WsMessage::Text(text))) = msg else {
                    break;
                };
                let Ok(StreamRequest::Join { batch_id }) = serde_json::from_str::<StreamRequest>(&text)
                else {
                    continue;
                };
                if joined.contains_key(&batch_id) {
                    let _ = out_tx.send(StreamEvent::Joined { batch_id });
                    continue;
                }
                let mut events = dispatcher.broker().subscribe(&batch_id);
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
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
                joined.insert(batch_id, handle);
            }
        }
    }

    for (_, handle) in joined {
        handle.abort();
    }
    send_task.abort();
}

fn commands(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|c| c.to_string()).collect()
}

fn result_event(batch_id: &BatchId, command_index: u32, output: &str) -> ResultEvent {
    ResultEvent {
        batch_id: batch_id.clone(),
        command_index,
        output: output.to_string(),
        success: true,
        emitted_at: Utc::now(),
    }
}

async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

async fn wait_for_joined(rx: &mut broadcast::Receiver<ClientEvent>) -> BatchId {
    loop {
        if let ClientEvent::Joined { batch_id } = next_event(rx).await {
            return batch_id;
        }
    }
}

#[tokio::test]
async fn submitting_streams_results_until_completion() {
    let server = spawn_echo_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let batch_id = session
        .submit_batch(&commands(&["echo a", "echo b"]))
        .await
        .expect("submit");

    let mut outputs: HashMap<u32, String> = HashMap::new();
    loop {
        match next_event(&mut events).await {
            ClientEvent::Joined { batch_id: joined } => assert_eq!(joined, batch_id),
            ClientEvent::ResultReceived(result) => {
                assert!(result.success);
                outputs.insert(result.command_index, result.output);
            }
            ClientEvent::BatchCompleted {
                expected, received, ..
            } => {
                assert_eq!(expected, 2);
                assert_eq!(received, 2);
                break;
            }
            ClientEvent::Disconnected => panic!("disconnected before completion"),
            ClientEvent::Error(message) => panic!("client error: {message}"),
        }
    }

    assert_eq!(outputs.get(&0).map(String::as_str), Some("a\n"));
    assert_eq!(outputs.get(&1).map(String::as_str), Some("b\n"));
    assert_eq!(session.results().await.len(), 2);
    assert_eq!(session.phase().await, SessionPhase::Draining);
}

#[tokio::test]
async fn blank_batches_are_rejected_before_any_stream_is_opened() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");

    let result = session.submit_batch(&commands(&["", "   "])).await;
    assert!(matches!(result, Err(SessionError::Rejected(_))));
    assert_eq!(session.phase().await, SessionPhase::Idle);
    assert!(session.active_batch().await.is_none());
    assert!(!session.connected().await);
}

#[tokio::test]
async fn submission_without_a_token_is_unauthorized() {
    let server = spawn_silent_server().await;
    let session = BatchSession::new(server.url());

    let result = session.submit_batch(&commands(&["echo a"])).await;
    assert!(matches!(result, Err(SessionError::Unauthorized(_))));
}

#[tokio::test]
async fn rejoin_while_joined_is_a_no_op_with_no_duplicate_delivery() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let batch_id = session
        .submit_batch(&commands(&["echo a", "echo b"]))
        .await
        .expect("submit");
    assert_eq!(wait_for_joined(&mut events).await, batch_id);

    session.rejoin().await.expect("rejoin");
    session.join_batch(batch_id.clone()).await.expect("join");
    assert_eq!(session.link().await, LinkState::Joined(batch_id.clone()));

    server
        .dispatcher
        .publish_result(result_event(&batch_id, 0, "a\n"));

    match next_event(&mut events).await {
        ClientEvent::ResultReceived(result) => assert_eq!(result.command_index, 0),
        other => panic!("unexpected event: {other:?}"),
    }
    let extra = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err(), "duplicate delivery after repeated joins");
}

#[tokio::test]
async fn submitting_again_tears_down_the_previous_stream() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let first = session
        .submit_batch(&commands(&["echo a"]))
        .await
        .expect("first submit");
    assert_eq!(wait_for_joined(&mut events).await, first);

    let second = session
        .submit_batch(&commands(&["echo b"]))
        .await
        .expect("second submit");
    assert_ne!(first, second);
    assert_eq!(wait_for_joined(&mut events).await, second);
    assert_eq!(session.link().await, LinkState::Joined(second.clone()));

    // Events for the abandoned batch no longer reach this session.
    server
        .dispatcher
        .publish_result(result_event(&first, 0, "a\n"));
    let stale = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(stale.is_err(), "received event for abandoned batch");

    server
        .dispatcher
        .publish_result(result_event(&second, 0, "b\n"));
    match next_event(&mut events).await {
        ClientEvent::ResultReceived(result) => assert_eq!(result.batch_id, second),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_keeps_partial_results_and_allows_explicit_rejoin() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let batch_id = session
        .submit_batch(&commands(&["echo a", "echo b"]))
        .await
        .expect("submit");
    assert_eq!(wait_for_joined(&mut events).await, batch_id);

    server
        .dispatcher
        .publish_result(result_event(&batch_id, 1, "b\n"));
    match next_event(&mut events).await {
        ClientEvent::ResultReceived(result) => assert_eq!(result.command_index, 1),
        other => panic!("unexpected event: {other:?}"),
    }

    server.close_connections();
    loop {
        if matches!(next_event(&mut events).await, ClientEvent::Disconnected) {
            break;
        }
    }
    assert!(!session.connected().await);
    assert_eq!(session.results().await.len(), 1, "partial results lost");

    // No automatic retry happened; rejoining is the caller's call.
    session.rejoin().await.expect("rejoin");
    assert_eq!(session.link().await, LinkState::Joined(batch_id));
}

#[tokio::test]
async fn joining_a_never_submitted_batch_stays_dormant() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let ghost = BatchId::from("never-submitted");
    session.join_batch(ghost.clone()).await.expect("join");
    assert_eq!(wait_for_joined(&mut events).await, ghost);
    assert!(session.connected().await);

    // The dispatcher drops results for unknown batches, so nothing arrives.
    server
        .dispatcher
        .publish_result(result_event(&ghost, 0, "a\n"));
    let extra = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn close_is_deliberate_and_keeps_results() {
    let server = spawn_silent_server().await;
    let session = BatchSession::with_bearer_token(server.url(), "operator-token");
    let mut events = session.subscribe_events();

    let batch_id = session
        .submit_batch(&commands(&["echo a", "echo b"]))
        .await
        .expect("submit");
    assert_eq!(wait_for_joined(&mut events).await, batch_id);

    server
        .dispatcher
        .publish_result(result_event(&batch_id, 0, "a\n"));
    match next_event(&mut events).await {
        ClientEvent::ResultReceived(_) => {}
        other => panic!("unexpected event: {other:?}"),
    }

    session.close().await;
    assert!(!session.connected().await);
    assert_eq!(session.phase().await, SessionPhase::Idle);
    assert_eq!(session.results().await.len(), 1);
}
