use crate::config::Config;
use crate::db;
use crate::error::Error;
use crate::hub::{BroadcastHub, DEFAULT_CAPACITY};
use crate::identity::HttpIdentityClient;
use crate::service::ChatService;
use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::init_pool(config.database_path())?;
        let hub = match &config.redis_url {
            Some(url) => BroadcastHub::with_broker(DEFAULT_CAPACITY, url).await,
            None => BroadcastHub::local(DEFAULT_CAPACITY),
        };
        let identity = Arc::new(HttpIdentityClient::new(&config.identity_url));
        let service = ChatService::new(pool, hub, identity);
        Ok(Self { service, config })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chats", post(create_chat).get(list_chats))
        .route("/api/chats/:id", get(chat_detail))
        .route("/api/chats/:id/join", post(join_chat))
        .route("/api/chats/:id/messages", post(send_message).get(message_history))
        .route("/api/chats/:id/subscribe", get(subscribe))
        .route("/api/users/:user_id/chats", get(chats_by_user))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

fn map_err(e: Error) -> (StatusCode, Json<ErrorResp>) {
    let status = match &e {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "internal error");
        "internal_error".to_string()
    } else {
        e.to_string()
    };
    (status, Json(ErrorResp { error }))
}

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ErrorResp>)>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatReq {
    name: String,
    creator_id: String,
    #[serde(default)]
    participants: Vec<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(req): Json<CreateChatReq>,
) -> ApiResult<impl IntoResponse> {
    let chat = state
        .service
        .create_chat(&req.name, &req.creator_id, &req.participants)
        .map_err(map_err)?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn list_chats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let chats = state.service.all_chats().map_err(map_err)?;
    Ok(Json(chats))
}

async fn chat_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.service.chat_detail(&id).await.map_err(map_err)?;
    Ok(Json(detail))
}

async fn chats_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let chats = state.service.chats_for_user(&user_id).map_err(map_err)?;
    Ok(Json(chats))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinChatReq {
    user_id: String,
}

async fn join_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<JoinChatReq>,
) -> ApiResult<impl IntoResponse> {
    let chat = state
        .service
        .join_chat(&id, &req.user_id)
        .map_err(map_err)?;
    Ok(Json(chat))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageReq {
    user_id: String,
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .service
        .send_message(&id, &req.user_id, &req.content)
        .await
        .map_err(map_err)?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn message_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .service
        .message_history(&id, q.limit, q.offset)
        .map_err(map_err)?;
    Ok(Json(messages))
}

async fn subscribe(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    // reject before upgrading so a bad chat id fails the handshake
    state.service.get_chat(&id).map_err(map_err)?;
    Ok(ws.on_upgrade(move |socket| handle_subscription(socket, state, id)))
}

async fn handle_subscription(stream: WebSocket, state: AppState, chat_id: Uuid) {
    let mut sub = state.service.hub().subscribe(chat_id);
    let (mut sender, mut receiver) = stream.split();
    loop {
        tokio::select! {
            incoming = sub.recv() => {
                let Some(message) = incoming else { break };
                let view = state.service.live_view(message).await;
                let Ok(payload) = serde_json::to_string(&view) else { continue };
                if sender.send(WsMessage::Text(payload)).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    // dropping the subscription deregisters it from the hub
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let state = AppState::new(config).await?;
    let addr: SocketAddr = state.config.bind.parse()?;
    tracing::info!(%addr, "chat service listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

// Integration tests live in the tests/ directory
