//! REST API boundary for the conversational agent
//!
//! Thin glue over the orchestration core: request/response shapes, token
//! resolution, identity lookup, and the outermost failure catch. Exposed
//! via axum, CORS-permissive for the web front-end.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::orchestrator::TurnOrchestrator;
use crate::session::SessionManager;
use crate::status::{self, ConversationStatus};
use crate::tools::vaulta::VaultaTools;
use crate::tools::ToolRegistry;

const EMPTY_MESSAGE_REPLY: &str = "Could you please send me a message? 😊";
const INTERNAL_ERROR_REPLY: &str =
    "Oops! Something went wrong on my end. Could you try that again? 😅";

//
// ================= Request / Response Models =================
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub status: String,
    /// Present only when the request carried no session id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Present only when the token changed this turn (null after logout).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<Value>,
}

impl ChatResponse {
    fn plain(message: &str, status: ConversationStatus) -> Self {
        Self {
            message: message.to_string(),
            status: status.as_str().to_string(),
            session_id: None,
            auth_token: None,
        }
    }
}

//
// ================= API State =================
//

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub registry: Arc<ToolRegistry>,
    pub vaulta: Arc<VaultaTools>,
}

//
// ================= Chat Endpoint =================
//

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ChatResponse>) {
    if req.message.trim().is_empty() {
        // Malformed request: fixed-text rejection, no session created.
        return (
            StatusCode::BAD_REQUEST,
            Json(ChatResponse::plain(
                EMPTY_MESSAGE_REPLY,
                ConversationStatus::Error,
            )),
        );
    }

    match handle_chat(&state, req).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => {
            error!(error = %e, "Turn handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatResponse::plain(
                    INTERNAL_ERROR_REPLY,
                    ConversationStatus::Error,
                )),
            )
        }
    }
}

async fn handle_chat(state: &AppState, req: ChatRequest) -> crate::Result<ChatResponse> {
    let is_first_message = req.session_id.is_none();
    let session_id = req
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(session = %session_id, "Inbound chat message");

    // Token: the request's, else whatever the session remembered.
    let mut current_token = match req.auth_token {
        Some(token) => Some(token),
        None => state.manager.remembered_token(&session_id).await,
    };

    // Identity boundary: a token only counts while the provider honors it.
    // Invalid or expired tokens degrade to an unauthenticated turn.
    let mut user_context = None;
    match current_token.clone() {
        Some(token) => {
            user_context = state.vaulta.fetch_current_user(&token).await;
            if user_context.is_none() {
                current_token = None;
                state.vaulta.clear_access_token();
            }
        }
        None => state.vaulta.clear_access_token(),
    }

    let handle = state
        .manager
        .get_or_create(&session_id, user_context.as_ref())
        .await?;
    let mut session = handle.lock().await;
    if let Some(context) = &user_context {
        // A validated token becomes session auth material. An invalid one
        // only degrades this turn; the stored token stays for retry.
        session
            .record
            .set_auth(current_token.clone(), context.clone());
    }

    let result = state
        .orchestrator
        .run_turn(&mut session, &req.message)
        .await?;

    // Post-turn token scan: OTP verification hands out a bearer token,
    // logout revokes it.
    let mut token_changed = false;
    for call in &result.tool_invocations {
        match call.function_name.as_str() {
            "vaulta_verify_otp" => {
                if let Some(token) = call.result.get("access_token").and_then(|v| v.as_str()) {
                    info!(session = %session.id, "OTP verified, session authenticated");
                    current_token = Some(token.to_string());
                    token_changed = true;
                    user_context = state.vaulta.fetch_current_user(token).await;
                    session
                        .record
                        .set_auth(current_token.clone(), user_context.clone().unwrap_or_default());
                }
                break;
            }
            "vaulta_logout" => {
                info!(session = %session.id, "Logged out, clearing session auth");
                current_token = None;
                token_changed = true;
                user_context = None;
                session.record.clear_auth();
                state.vaulta.clear_access_token();
                break;
            }
            _ => {}
        }
    }

    state.manager.persist(&session).await?;

    let status = status::resolve(
        Some(&session.record),
        current_token.as_ref().and(user_context.as_ref()),
    );

    Ok(ChatResponse {
        message: result.assistant_message,
        status,
        session_id: is_first_message.then(|| session_id.clone()),
        auth_token: token_changed.then(|| match &current_token {
            Some(token) => json!(token),
            None => Value::Null,
        }),
    })
}

//
// ================= Session Endpoints =================
//

async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.manager.history(&session_id).await {
        Some(history) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": session_id,
                "history": history,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Session not found",
                "code": "session_not_found",
            })),
        ),
    }
}

async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.manager.delete(&session_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"message": "Session cleared successfully"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Session not found",
                "code": "session_not_found",
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string(), "code": "clear_error"})),
        ),
    }
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .registry
        .descriptors()
        .iter()
        .map(|d| d.describe())
        .collect();

    Json(json!({
        "tools": tools,
        "count": tools.len(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

//
// ================= Router =================
//

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/history/:session_id", get(get_history))
        .route("/chat/session/:session_id", delete(clear_session))
        .route("/tools", get(list_tools))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

//
// ================= Server Startup =================
//

pub async fn start_server(
    state: AppState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
