use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::intake::{IntakeError, TicketSubmission};
use super::service::{PostedInteraction, ServiceError};
use super::{Interaction, StoreError, Ticket, TicketStatus};
use crate::core::shared::models::User;
use crate::core::shared::state::AppState;
use crate::email::EmailAttachment;
use crate::notifications::Inbox;

/// Header carrying the signed-in user's id, set by the authenticating proxy.
pub const USER_HEADER: &str = "x-portal-user";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound(what) => Self::NotFound(what),
            ServiceError::Forbidden(why) => Self::Forbidden(why),
            ServiceError::Invalid(why) => Self::Validation(why),
            ServiceError::Store(StoreError::NotFound(what)) => Self::NotFound(what),
            ServiceError::Store(other) => {
                error!("store failure: {other}");
                Self::Internal("storage unavailable".to_string())
            }
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        if e.is_user_error() {
            Self::Validation(e.user_message())
        } else {
            error!("ticket submission failed: {e}");
            Self::Internal(e.user_message())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Base64 encoded file contents.
    pub data: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl AttachmentPayload {
    fn decode(self) -> Result<EmailAttachment, ApiError> {
        let bytes = general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ApiError::Validation(format!("attachment is not valid base64: {e}")))?;
        Ok(EmailAttachment {
            file_name: self.file_name,
            content_type: self.content_type,
            bytes,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub summary: String,
    pub description: String,
    pub environment: String,
    pub priority: i64,
    pub area: Option<String>,
    pub attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ChangeStatusResponse {
    pub ticket: Ticket,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct PostInteractionRequest {
    pub body: String,
    pub attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Serialize)]
pub struct PostInteractionResponse {
    pub interaction: Interaction,
    pub notifications: usize,
    pub emails: usize,
    pub remote_submitted: Option<bool>,
}

impl From<PostedInteraction> for PostInteractionResponse {
    fn from(posted: PostedInteraction) -> Self {
        Self {
            interaction: posted.interaction,
            notifications: posted.dispatch.notifications,
            emails: posted.dispatch.emails,
            remote_submitted: posted.remote_submitted,
        }
    }
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let raw = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_HEADER} header")))?;
    let user_id: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::Unauthorized(format!("invalid {USER_HEADER} header")))?;
    match state.tickets.user(user_id) {
        Ok(user) if user.is_active => Ok(user),
        Ok(_) | Err(ServiceError::NotFound(_)) => {
            Err(ApiError::Unauthorized("unknown user".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let user = current_user(&state, &headers)?;
    let submission = TicketSubmission {
        summary: req.summary,
        description: req.description,
        environment: req.environment,
        priority: req.priority,
        area: req.area,
        attachment: req.attachment.map(AttachmentPayload::decode).transpose()?,
    };

    let intake = Arc::clone(&state.intake);
    let ticket = tokio::task::spawn_blocking(move || intake.submit(&user, submission))
        .await
        .map_err(|e| ApiError::Internal(format!("submission task failed: {e}")))??;
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Ticket>, ApiError> {
    let user = current_user(&state, &headers)?;
    Ok(Json(state.tickets.ticket(&user, id)?))
}

pub async fn change_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<ChangeStatusResponse>, ApiError> {
    let user = current_user(&state, &headers)?;
    let status: TicketStatus = req
        .status
        .trim()
        .parse()
        .map_err(|e: super::UnrecognizedStatus| ApiError::Validation(e.to_string()))?;
    let outcome = state.tickets.change_status(&user, id, status)?;
    Ok(Json(ChangeStatusResponse {
        changed: outcome.changed(),
        ticket: outcome.ticket,
    }))
}

pub async fn list_interactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Interaction>>, ApiError> {
    let user = current_user(&state, &headers)?;
    Ok(Json(state.tickets.interactions(&user, id)?))
}

pub async fn post_interaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<PostInteractionRequest>,
) -> Result<(StatusCode, Json<PostInteractionResponse>), ApiError> {
    let user = current_user(&state, &headers)?;
    let attachment = req.attachment.map(AttachmentPayload::decode).transpose()?;
    let posted = state
        .tickets
        .post_interaction(&user, id, req.body, attachment)
        .await?;
    Ok((StatusCode::CREATED, Json(posted.into())))
}

pub async fn get_inbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Inbox>, ApiError> {
    let user = current_user(&state, &headers)?;
    Ok(Json(state.tickets.inbox(&user)?))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user = current_user(&state, &headers)?;
    state.tickets.mark_read(&user, id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", post(create_ticket))
        .route("/api/tickets/:id", get(get_ticket))
        .route("/api/tickets/:id/status", put(change_status))
        .route(
            "/api/tickets/:id/interactions",
            get(list_interactions).post(post_interaction),
        )
        .route("/api/notifications", get(get_inbox))
        .route("/api/notifications/:id/read", put(mark_notification_read))
}
