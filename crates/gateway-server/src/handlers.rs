//! HTTP Handlers
//!
//! Thin wire layer over the orchestrator and the session store.
//! Turn-level failures still answer the chat request with a friendly
//! message plus an error code; only auth and malformed requests get
//! non-200 statuses.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use gateway_core::{
    GatewayError, Message, Session, SessionId, SidePayload, cache::CacheStats,
};
use gateway_store::SessionSummary;

use crate::auth::authorize;
use crate::state::AppState;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Provider id -> reachable
    pub providers: HashMap<String, bool>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelSummary>,
    pub default: &'static str,
}

#[derive(Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub provider: String,
    pub supports_tools: bool,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub model: String,
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_payload: Option<SidePayload>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedSession {
    pub id: String,
    pub title: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
        GatewayError::Provider(_)
        | GatewayError::ProviderTimeout(_)
        | GatewayError::ProviderUnavailable(_) => "PROVIDER_ERROR",
        GatewayError::LoopExhausted(_) => "LOOP_EXHAUSTED",
        GatewayError::PersistenceTransient(_) | GatewayError::Persistence(_) => {
            "PERSISTENCE_ERROR"
        }
        GatewayError::Unauthorized(_) => "UNAUTHORIZED",
        GatewayError::Config(_) => "CONFIG_ERROR",
        _ => "INTERNAL_ERROR",
    }
}

fn unauthorized(err: &GatewayError) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: err.user_message(),
            code: "UNAUTHORIZED",
        }),
    )
}

fn internal(err: &GatewayError) -> ApiError {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.user_message(),
            code: error_code(err),
        }),
    )
}

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("session '{id}' not found"),
            code: "SESSION_NOT_FOUND",
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        providers: state.engine.provider_health().await,
    })
}

/// List routable models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state
        .engine
        .model_catalog()
        .iter()
        .map(|entry| ModelSummary {
            id: entry.id.clone(),
            provider: entry.provider_id.clone(),
            supports_tools: entry.supports_tools,
        })
        .collect();

    Json(ModelsResponse {
        models,
        default: "auto",
    })
}

/// Cache counters
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cache: state.engine.cache_stats().await,
    })
}

/// Main chat endpoint
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    authorize(
        state.auth_token.as_deref(),
        &headers,
        payload.auth_token.as_deref(),
    )
    .map_err(|err| unauthorized(&err))?;

    if payload.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "message must not be empty".into(),
                code: "EMPTY_MESSAGE",
            }),
        ));
    }

    match state
        .engine
        .chat(
            &payload.message,
            payload.model.as_deref(),
            payload.session_id.as_deref(),
        )
        .await
    {
        Ok(outcome) => Ok(Json(ChatResponse {
            response: outcome.text,
            session_id: outcome.session_id.to_string(),
            model: outcome.model_id,
            tools_used: outcome.tools_used,
            side_payload: outcome.side_payload,
            cached: outcome.cached,
            error: None,
        })),
        // A failed turn still answers the chat with a friendly message;
        // clients show it inline and may retry.
        Err(err) => {
            tracing::error!(error = %err, "chat turn failed");
            Ok(Json(ChatResponse {
                response: err.user_message(),
                session_id: payload.session_id.unwrap_or_default(),
                model: payload.model.unwrap_or_else(|| "auto".into()),
                tools_used: Vec::new(),
                side_payload: None,
                cached: false,
                error: Some(error_code(&err).to_string()),
            }))
        }
    }
}

/// List sessions, newest activity first
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    state
        .store
        .list_sessions()
        .await
        .map(Json)
        .map_err(|err| internal(&err))
}

/// Create a session from its first user message
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreatedSession>), ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    if payload.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "message must not be empty".into(),
                code: "EMPTY_MESSAGE",
            }),
        ));
    }

    let model = payload.model.as_deref().unwrap_or("auto");
    let session = state
        .store
        .create_session(Message::user(&payload.message), model)
        .await
        .map_err(|err| internal(&err))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            id: session.id.to_string(),
            title: session.title,
            model: session.model,
        }),
    ))
}

/// Fetch one session with its full message history
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    state
        .store
        .get_session(&SessionId::from_string(&id))
        .await
        .map_err(|err| internal(&err))?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// Fetch just a session's messages
pub async fn session_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    state
        .store
        .get_session(&SessionId::from_string(&id))
        .await
        .map_err(|err| internal(&err))?
        .map(|session| Json(session.messages))
        .ok_or_else(|| not_found(&id))
}

/// Append a message to an existing session
pub async fn append_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(message): Json<Message>,
) -> Result<StatusCode, ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    let session_id = SessionId::from_string(&id);
    if state
        .store
        .get_session(&session_id)
        .await
        .map_err(|err| internal(&err))?
        .is_none()
    {
        return Err(not_found(&id));
    }

    state
        .store
        .append_message(&session_id, message)
        .await
        .map_err(|err| internal(&err))?;

    Ok(StatusCode::CREATED)
}

/// Delete a session
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(state.auth_token.as_deref(), &headers, None)
        .map_err(|err| unauthorized(&err))?;

    state
        .store
        .delete_session(&SessionId::from_string(&id))
        .await
        .map_err(|err| internal(&err))?;

    Ok(StatusCode::NO_CONTENT)
}
