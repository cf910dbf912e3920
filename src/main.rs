//! # Heron-rs
//!
//! Marketing site + chat-history dashboard server for a chat-automation
//! product.
//!
//! This server provides:
//! - Chat history grouped into conversation sessions, read from a hosted
//!   backend-as-a-service table (polling + webhook refresh)
//! - Real-time SSE streaming for dashboard updates
//! - Lead capture for the marketing site's demo-request form
//! - Static marketing pages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Dashboard  │────▶│  Axum HTTP   │────▶│  Hosted table   │
//! │  (browser)  │     │  Server      │     │  (chat history) │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!       │                   │ poll + webhook
//!       │ SSE               ▼
//!       ▼             ┌──────────────┐
//! ┌─────────────┐     │ SessionStore │
//! │  Refresh    │◀────│  (snapshot)  │
//! │  events     │     └──────────────┘
//! └─────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/stream` - SSE event stream
//! - `GET /api/sessions` - List conversation sessions (recency order)
//! - `GET /api/sessions/{id}` - Full message list for one session
//! - `GET /api/summary` - Dashboard summary tiles
//! - `POST /api/refresh` - Change notification from the upstream automation
//! - `POST /api/lead` - Demo-request form submission
//! - `POST /api/chat` - Assistant question acknowledgement

mod leads;
mod normalize;
mod provider;
mod refresh;
mod sessions;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::{broadcast, Notify};
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::leads::{Lead, LeadSink};
use crate::normalize::{group_rows, NormalizeOptions};
use crate::provider::{ProviderConfig, TableClient};
use crate::sessions::{SessionStore, StoreEvent, SummaryStats};

// ============================================================================
// SSE Event Types
// ============================================================================

/// Server-Sent Events that are broadcast to connected clients.
///
/// Events are tagged with their type in the JSON serialization to allow
/// the frontend to dispatch them appropriately.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum SseEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },
    #[serde(rename = "refreshed")]
    Refreshed {
        total_records: usize,
        total_sessions: usize,
    },
    #[serde(rename = "lead")]
    Lead { name: String },
    #[serde(rename = "status")]
    Status { status: String, details: Option<String> },
}

// ============================================================================
// App State - Shared state across all request handlers
// ============================================================================

/// Global application state shared across all HTTP handlers.
/// Wrapped in Arc<> for thread-safe sharing.
struct AppState {
    start_time: Instant,                           // Server start time for uptime tracking
    event_tx: broadcast::Sender<(u64, SseEvent)>,  // SSE broadcast channel
    seq: std::sync::atomic::AtomicU64,             // Monotonic event sequence number
    store: Arc<SessionStore>,                      // Grouped chat history snapshot
    refresh_trigger: Arc<Notify>,                  // Fires the refresh loop on demand
    lead_sink: LeadSink,                           // Append-only leads file
}

impl AppState {
    /// Get next sequence number for SSE events (ensures ordering)
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Broadcast an event to all connected SSE clients
    fn broadcast(&self, event: SseEvent) {
        let seq = self.next_seq();
        let _ = self.event_tx.send((seq, event));  // Ignore error if no subscribers
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.store.session_count().await,
    })
}

// ============================================================================
// Session Endpoints
// ============================================================================

/// Card-level view of a session for the dashboard list
#[derive(Serialize)]
struct SessionCard {
    session_id: String,
    message_count: usize,
    preview: String,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionCard>,
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state
        .store
        .list_groups()
        .await
        .into_iter()
        .map(|group| SessionCard {
            preview: group.preview(),
            message_count: group.messages.len(),
            session_id: group.session_id,
        })
        .collect();

    Json(SessionsResponse { sessions })
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.get(&session_id) {
        Some(group) => Json(group).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "session not found"})),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct SummaryResponse {
    #[serde(flatten)]
    stats: SummaryStats,
    last_refreshed: Option<String>,
}

async fn get_summary(State(state): State<Arc<AppState>>) -> Json<SummaryResponse> {
    let (stats, last_refreshed) = state.store.summary().await;
    Json(SummaryResponse { stats, last_refreshed })
}

/// Change notification from the upstream automation (webhook). The actual
/// fetch runs in the refresh loop; this just fires the trigger.
async fn trigger_refresh(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.refresh_trigger.notify_one();
    Json(serde_json::json!({"triggered": true}))
}

// ============================================================================
// Marketing Endpoints
// ============================================================================

async fn submit_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(lead): Json<Lead>,
) -> Response {
    if let Err(message) = leads::validate(&lead) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": message})),
        )
            .into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Err(e) = state.lead_sink.record(&lead, user_agent) {
        tracing::error!("Failed to record lead: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Could not store your request, please retry"})),
        )
            .into_response();
    }

    state.broadcast(SseEvent::Lead { name: lead.name.clone() });

    Json(serde_json::json!({
        "success": true,
        "message": "Your demo request has been received!"
    }))
    .into_response()
}

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    question: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

/// Assistant stub for the marketing site widget. Questions are acknowledged;
/// real answers come from the automation pipeline behind the chat channel.
async fn chat(Json(request): Json<ChatRequest>) -> Json<ChatResponse> {
    let answer = match request.question.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => {
            format!("Your question: \"{}\". The assistant will reply shortly.", q)
        }
        _ => "No question received, please try again.".to_string(),
    };
    Json(ChatResponse { answer })
}

// ============================================================================
// SSE Stream Endpoint
// ============================================================================

#[derive(Deserialize, Default)]
struct StreamQuery {
    #[serde(default)]
    last_event_id: Option<u64>,
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .or(query.last_event_id);

    if let Some(id) = last_id {
        tracing::info!("Client reconnecting from event ID: {}", id);
    }

    let rx = state.event_tx.subscribe();

    // Create heartbeat stream
    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let seq = s.next_seq();
            let event = SseEvent::Heartbeat {
                timestamp: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap()
                    .as_secs(),
            };
            let data = serde_json::to_string(&event).unwrap();
            Some((
                Ok(Event::default()
                    .event("heartbeat")
                    .id(seq.to_string())
                    .data(data)),
                (),
            ))
        }
    });

    // Create broadcast event stream
    let broadcast_stream = stream::unfold(rx, move |mut rx| async move {
        match rx.recv().await {
            Ok((seq, event)) => {
                let event_type = match &event {
                    SseEvent::Heartbeat { .. } => "heartbeat",
                    SseEvent::Refreshed { .. } => "refreshed",
                    SseEvent::Lead { .. } => "lead",
                    SseEvent::Status { .. } => "status",
                };
                let data = serde_json::to_string(&event).unwrap();
                Some((
                    Ok(Event::default()
                        .event(event_type)
                        .id(seq.to_string())
                        .data(data)),
                    rx,
                ))
            }
            Err(_) => None,
        }
    });

    // Send initial connection event
    let init_seq = state.next_seq();
    let init_event = stream::once(async move {
        let event = SseEvent::Status {
            status: "connected".to_string(),
            details: Some(format!("seq: {}", init_seq)),
        };
        let data = serde_json::to_string(&event).unwrap();
        Ok(Event::default()
            .event("status")
            .id(init_seq.to_string())
            .data(data))
    });

    let merged = init_event.chain(
        tokio_stream::StreamExt::merge(heartbeat, broadcast_stream)
    );

    Sse::new(merged).keep_alive(KeepAlive::default())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("heron_rs=info".parse().unwrap())
            .add_directive("tower_http=info".parse().unwrap()))
        .init();

    let (event_tx, _) = broadcast::channel::<(u64, SseEvent)>(100);

    let poll_interval = std::env::var("HERON_POLL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    let leads_file = std::env::var("HERON_LEADS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("leads.jsonl"));

    // Envelope keys probed on object payloads, override via HERON_PROBE_KEYS
    let normalize_opts = match std::env::var("HERON_PROBE_KEYS") {
        Ok(keys) => NormalizeOptions {
            probe_keys: keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            ..NormalizeOptions::default()
        },
        Err(_) => NormalizeOptions::default(),
    };

    let store = SessionStore::new();
    let refresh_trigger = refresh::create_trigger();

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        event_tx,
        seq: std::sync::atomic::AtomicU64::new(1),
        store: store.clone(),
        refresh_trigger: refresh_trigger.clone(),
        lead_sink: LeadSink::new(leads_file),
    });

    // Forward store events to connected SSE clients
    let bridge_state = state.clone();
    tokio::spawn(async move {
        let mut rx = bridge_state.store.subscribe();
        loop {
            match rx.recv().await {
                Ok(StoreEvent::Refreshed { total_records, total_sessions }) => {
                    bridge_state.broadcast(SseEvent::Refreshed {
                        total_records,
                        total_sessions,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Start the refresh loop against the hosted table, or fall back to demo
    // data so the dashboard stays browsable without provider credentials
    match ProviderConfig::from_env() {
        Ok(config) => {
            let client = TableClient::new(config);
            let refresh_store = store.clone();
            let refresh_opts = normalize_opts.clone();
            let trigger = refresh_trigger.clone();
            tokio::spawn(async move {
                refresh::start(refresh_store, client, refresh_opts, trigger, poll_interval).await;
            });
        }
        Err(e) => {
            warn!("{}; serving demo data instead", e);
            let rows = refresh::demo_rows();
            let groups = group_rows(&rows, &normalize_opts);
            store.replace(groups, rows.len()).await;
        }
    }

    // Build router
    let app = Router::new()
        // Health
        .route("/health", get(health))
        // SSE
        .route("/api/stream", get(stream_events))
        // Chat history
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", get(get_session))
        .route("/api/summary", get(get_summary))
        .route("/api/refresh", post(trigger_refresh))
        // Marketing surfaces
        .route("/api/lead", post(submit_lead))
        .route("/api/chat", post(chat))
        .layer(CorsLayer::permissive())
        // Static marketing pages
        .fallback_service(ServeDir::new("static").append_index_html_on_directories(true))
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4860);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Heron-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
