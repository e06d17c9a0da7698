//! Mock chat backend for trying the client by hand.
//!
//! Run with: cargo run -p mock-server-example
//!
//! Then connect with: cargo run -p chat-cli-example
//!
//! Every chat message is confirmed and answered with a scripted agent run
//! streamed as `agent_started` / `tool_executing` / `partial_result` / ...
//! envelopes.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use chat_sync_transport::ClientMessage;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(about = "Scripted chat backend speaking the chat-sync envelope protocol")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    addr: SocketAddr,

    /// Delay between streamed envelopes, in milliseconds.
    #[arg(long, default_value_t = 150)]
    step_ms: u64,

    /// Reject every Nth chat message with an error naming its local id.
    #[arg(long)]
    fail_every: Option<u64>,

    /// Close each connection after this many chat messages, to exercise
    /// client reconnects.
    #[arg(long)]
    drop_after: Option<u64>,
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    args: Args,
    threads: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    received: Arc<RwLock<u64>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = args.addr;
    let state = AppState {
        args,
        threads: Arc::new(RwLock::new(HashMap::new())),
        received: Arc::new(RwLock::new(0)),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Mock server listening on ws://{addr}/ws");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Outgoing frame for one connection.
enum Outbound {
    Envelope(Value),
    Close,
}

fn envelope(kind: &str, payload: Value) -> Outbound {
    Outbound::Envelope(json!({ "type": kind, "payload": payload }))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    tracing::info!("Client {conn_id} connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Envelope(value) => {
                    if ws_sender.send(Message::Text(value.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut thread_id = String::from("default");
    let mut handled_here = 0u64;

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                continue;
            }
        };

        match client_msg {
            ClientMessage::Ping => {
                let _ = tx.send(envelope("pong", json!({})));
            }
            ClientMessage::SwitchThread { thread_id: next } => {
                thread_id = next;
                let history = state
                    .threads
                    .read()
                    .await
                    .get(&thread_id)
                    .cloned()
                    .unwrap_or_default();
                tracing::info!(%thread_id, messages = history.len(), "Switching thread");
                let _ = tx.send(envelope("thread_switch", json!({ "thread_id": thread_id })));
                let _ = tx.send(envelope(
                    "thread_loaded",
                    json!({ "thread_id": thread_id, "messages": history }),
                ));
            }
            ClientMessage::SendMessage {
                local_id,
                content,
                thread_id: requested,
            } => {
                let thread = requested.unwrap_or_else(|| thread_id.clone());
                let count = {
                    let mut received = state.received.write().await;
                    *received += 1;
                    *received
                };
                handled_here += 1;

                if state.args.fail_every.is_some_and(|n| n > 0 && count % n == 0) {
                    tracing::info!(%local_id, "Rejecting message");
                    let _ = tx.send(envelope(
                        "error",
                        json!({
                            "error_message": "Message rejected by mock server",
                            "error_code": "REJECTED",
                            "local_id": local_id,
                        }),
                    ));
                } else {
                    tokio::spawn(answer(state.clone(), tx.clone(), thread, local_id, content));
                }

                if state.args.drop_after.is_some_and(|n| handled_here >= n) {
                    tracing::info!("Dropping client {conn_id} on purpose");
                    let _ = tx.send(Outbound::Close);
                    break;
                }
            }
        }
    }

    // let queued frames drain before the socket goes away
    drop(tx);
    let _ = send_task.await;
    tracing::info!("Client {conn_id} disconnected");
}

/// Confirm the user's message, then stream a scripted agent run.
async fn answer(
    state: AppState,
    tx: mpsc::UnboundedSender<Outbound>,
    thread_id: String,
    local_id: String,
    content: String,
) {
    let step = Duration::from_millis(state.args.step_ms);
    let run_id = Uuid::new_v4().to_string();

    let confirmed = json!({
        "id": Uuid::new_v4().to_string(),
        "localId": local_id,
        "role": "user",
        "content": content,
        "createdAt": now_ms(),
        "threadId": thread_id,
    });
    remember(&state, &thread_id, confirmed.clone()).await;
    let _ = tx.send(envelope("message", confirmed));

    let script = [
        envelope(
            "agent_started",
            json!({ "agent_name": "Researcher", "run_id": run_id, "timestamp": now_ms() }),
        ),
        envelope("agent_typing", json!({ "is_typing": true, "agent_name": "Researcher" })),
        envelope(
            "agent_thinking",
            json!({ "thought": "Reading the question", "step_number": 1, "total_steps": 3, "agent_name": "Researcher" }),
        ),
        envelope("tool_executing", json!({ "tool_name": "search" })),
        envelope("agent_progress", json!({ "progress": 0.33, "message": "searching" })),
        envelope(
            "agent_thinking",
            json!({ "thought": "Comparing sources", "step_number": 2, "total_steps": 3, "agent_name": "Researcher" }),
        ),
        envelope("tool_executing", json!({ "tool_name": "fetch_page" })),
        envelope("agent_progress", json!({ "progress": 0.66, "message": "reading" })),
    ];
    for frame in script {
        if tx.send(frame).is_err() {
            return;
        }
        tokio::time::sleep(step).await;
    }

    let reply = format!("You said: {content}");
    for chunk in reply.split_inclusive(' ') {
        let _ = tx.send(envelope("partial_result", json!({ "content": chunk })));
        tokio::time::sleep(step / 2).await;
    }

    let _ = tx.send(envelope(
        "agent_completed",
        json!({
            "agent_name": "Researcher",
            "duration": 1.2,
            "result": { "answer": reply },
            "metrics": { "tool_calls": 2 },
        }),
    ));
    let _ = tx.send(envelope("agent_typing", json!({ "is_typing": false })));

    let assistant = json!({
        "id": Uuid::new_v4().to_string(),
        "role": "assistant",
        "content": reply,
        "createdAt": now_ms(),
        "threadId": thread_id,
    });
    remember(&state, &thread_id, assistant.clone()).await;
    let _ = tx.send(envelope("message", assistant));
    let _ = tx.send(envelope(
        "final_report",
        json!({ "report": { "summary": reply }, "total_duration": 1.5 }),
    ));
}

async fn remember(state: &AppState, thread_id: &str, message: Value) {
    state
        .threads
        .write()
        .await
        .entry(thread_id.to_string())
        .or_default()
        .push(message);
}
