use std::{convert::Infallible, sync::Arc, time::Instant};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream};
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{info, warn};

use crate::{
    error::GatewayError,
    gateway::{FragmentSink, Gateway, Transcript},
    models::{ChatRequest, ModelListing, PingReport, ProtocolFamily, SendOutcome, Thread},
};

type ApiError = (StatusCode, String);

/**
 * \brief Shared handler state.
 */
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub started: Arc<Instant>,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            started: Arc::new(Instant::now()),
        }
    }
}

/**
 * \brief API routes plus the static UI as fallback.
 */
pub fn router(state: AppState) -> Router {
    let ui_root = state.gateway.config().paths.ui_dir.clone();
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    Router::new()
        .route("/api/chat", post(chat_sse))
        .route("/api/chat/once", post(chat_once))
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/{id}", put(rename_thread).delete(delete_thread))
        .route("/api/threads/{id}/messages", get(thread_messages))
        .route("/api/messages", get(list_messages))
        .route("/api/providers", get(list_providers))
        .route("/api/models/{provider}", get(list_models))
        .route("/api/ping", get(ping_all))
        .route("/api/ping/{provider}", get(ping_provider))
        .route("/api/uptime", get(uptime))
        .fallback_service(static_service)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/**
 * \brief Serves the hub on the configured address until the process stops.
 */
pub async fn run(gateway: Gateway) -> Result<()> {
    let addr = gateway.config().listen_addr();
    let app = router(AppState::new(gateway));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn api_err(err: GatewayError) -> ApiError {
    let status = match &err {
        GatewayError::EmptyMessage | GatewayError::UnknownProvider(_) | GatewayError::EmptyTitle => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::ThreadNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::LastThread(_) => StatusCode::CONFLICT,
        GatewayError::Cancelled | GatewayError::Storage(_) => {
            warn!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/** \brief Forwards reply events into the SSE channel. */
struct ChannelSink {
    tx: mpsc::UnboundedSender<Result<Event, Infallible>>,
}

impl FragmentSink for ChannelSink {
    fn fragment(&self, text: &str) -> bool {
        self.tx.send(Ok(Event::default().data(text))).is_ok()
    }

    fn reset(&self) -> bool {
        self.tx
            .send(Ok(Event::default().event("reset").data("")))
            .is_ok()
    }
}

/**
 * \brief Streams one turn: `meta`, data fragments, optional `reset`, then `done` or `error`.
 * \details When the client goes away the turn future is dropped at once, which
 * closes the upstream request and rolls the user message back.
 */
async fn chat_sse(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let turn = state.gateway.begin(req).await.map_err(api_err)?;

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default().event("meta").data(
        json!({
            "thread_id": turn.thread_id(),
            "user_message_id": turn.user_message_id(),
            "provider": turn.provider().id,
        })
        .to_string(),
    )));

    tokio::spawn(async move {
        let sink = ChannelSink { tx: tx.clone() };
        let result = tokio::select! {
            result = turn.run(&sink) => result,
            _ = tx.closed() => Err(GatewayError::Cancelled),
        };
        match result {
            Ok(outcome) => {
                let payload = serde_json::to_string(&outcome).unwrap_or_default();
                let _ = tx.send(Ok(Event::default().event("done").data(payload)));
            }
            Err(GatewayError::Cancelled) => info!("chat stream closed by client"),
            Err(e) => {
                warn!(error = %e, "chat turn failed");
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

async fn chat_once(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    state.gateway.send(req).await.map(Json).map_err(api_err)
}

#[derive(Serialize, Debug)]
struct ThreadList {
    threads: Vec<Thread>,
}

async fn list_threads(State(state): State<AppState>) -> Result<Json<ThreadList>, ApiError> {
    let threads = state.gateway.list_threads().map_err(api_err)?;
    Ok(Json(ThreadList { threads }))
}

#[derive(Deserialize, Debug, Default)]
struct ThreadInput {
    #[serde(default)]
    title: Option<String>,
}

async fn create_thread(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Thread>), ApiError> {
    let input: ThreadInput = if body.iter().all(u8::is_ascii_whitespace) {
        ThreadInput::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };
    let thread = state
        .gateway
        .create_thread(input.title.as_deref())
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(thread)))
}

async fn rename_thread(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<ThreadInput>,
) -> Result<Json<Thread>, ApiError> {
    let title = input.title.unwrap_or_default();
    state
        .gateway
        .rename_thread(id, &title)
        .map(Json)
        .map_err(api_err)
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.gateway.delete_thread(id).map_err(api_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Transcript>, ApiError> {
    state
        .gateway
        .list_messages(Some(id))
        .map(Json)
        .map_err(api_err)
}

#[derive(Deserialize, Debug)]
struct MessageQuery {
    thread_id: Option<i64>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(q): Query<MessageQuery>,
) -> Result<Json<Transcript>, ApiError> {
    state
        .gateway
        .list_messages(q.thread_id)
        .map(Json)
        .map_err(api_err)
}

#[derive(Serialize, Debug)]
struct ProviderItem {
    id: &'static str,
    label: &'static str,
    aliases: &'static [&'static str],
    protocol_family: ProtocolFamily,
    model: String,
    /** \brief False when a required credential is missing. */
    configured: bool,
}

async fn list_providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.gateway.config();
    let providers: Vec<ProviderItem> = state
        .gateway
        .list_providers()
        .iter()
        .map(|p| ProviderItem {
            id: p.id,
            label: p.label,
            aliases: p.aliases,
            protocol_family: p.protocol_family,
            model: config.model_for(p, None),
            configured: config.credential(p).is_ok(),
        })
        .collect();
    Json(json!({ "providers": providers }))
}

async fn list_models(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<ModelListing>, ApiError> {
    state
        .gateway
        .list_models(&provider)
        .await
        .map(Json)
        .map_err(api_err)
}

async fn ping_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<PingReport>, ApiError> {
    state
        .gateway
        .ping_provider(&provider)
        .await
        .map(Json)
        .map_err(api_err)
}

async fn ping_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let reports = state.gateway.ping_all().await;
    Json(json!({ "providers": reports }))
}

async fn uptime(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "uptime_secs": state.started.elapsed().as_secs() }))
}
