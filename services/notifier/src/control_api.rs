//! Localhost control API for the notifier.
//!
//! Binds to 127.0.0.1:9190 by default (or a caller-supplied address for tests).
//! Routes:
//!   GET    /api/v1/notifications                 - current set + unread count
//!   DELETE /api/v1/notifications                 - clear all
//!   POST   /api/v1/notifications/refresh         - refetch the snapshot
//!   POST   /api/v1/notifications/mark-all-read   - mark every record read
//!   PUT    /api/v1/notifications/{id}/read       - mark one record read
//!   DELETE /api/v1/notifications/{id}            - delete one record
//!   POST   /api/v1/notifications/{id}/click      - mark read + resolve route
//!   GET    /api/v1/prescriptions/{id}/reminders  - medicine reminders
//!   POST   /api/v1/surface/toggle                - open/close the list
//!   POST   /api/v1/surface/interaction           - document interaction
//!   POST   /api/v1/realtime/test                 - publish a test notification
//!   GET    /api/v1/status                        - runtime status
//!   GET    /api/v1/logs                          - recent log entries
//!   GET    /api/v1/events                        - SSE event stream

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use hs_protocol::{HttpErrorEnvelope, NotificationId, NotificationRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::controller::{
    ControllerError, ControllerHandle, MutationOutcome, Phase, RefreshOutcome,
};
use crate::state::StateOrigin;
use crate::surface::InteractionTarget;
use crate::transport::{ConnectionState, Identity, TransportManager};
use crate::ui_events::NotifierUiEvent;
use crate::ui_log::UiLogger;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub controller: ControllerHandle,
    pub transport: Arc<TransportManager>,
    pub ui_tx: broadcast::Sender<NotifierUiEvent>,
    pub logger: UiLogger,
}

// ---------------------------------------------------------------------------
// Request/Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<NotificationRecord>,
    pub unread_count: u64,
    pub origin: StateOrigin,
}

#[derive(Debug, Serialize)]
pub struct MutationBody {
    pub outcome: MutationOutcome,
}

#[derive(Debug, Serialize)]
pub struct RefreshBody {
    pub outcome: RefreshOutcome,
}

#[derive(Debug, Serialize)]
pub struct ClickBody {
    /// Front-end path to open, if the notification leads anywhere.
    pub route: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SurfaceBody {
    pub open: bool,
}

#[derive(Debug, Deserialize)]
pub struct InteractionRequest {
    pub target: InteractionTarget,
}

#[derive(Debug, Serialize)]
pub struct InteractionBody {
    pub closed: bool,
}

#[derive(Debug, Serialize)]
pub struct RemindersBody {
    pub reminders: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
pub struct TestNotificationRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TestNotificationBody {
    pub sent: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: Phase,
    pub identity: Option<Identity>,
    pub connection_state: ConnectionState,
    pub subscription_count: usize,
    pub reconnect_attempts: u32,
    pub unread_count: u64,
    pub surface_open: bool,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub entries: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.to_owned(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

fn controller_error(e: ControllerError) -> Response {
    match e {
        ControllerError::Inactive => error_response(StatusCode::CONFLICT, "INACTIVE", e.to_string()),
        ControllerError::NotReady => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "NOT_READY", e.to_string())
        }
        ControllerError::Stopped => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "STOPPED", e.to_string())
        }
        ControllerError::Api(_) => error_response(StatusCode::BAD_GATEWAY, "UPSTREAM", e.to_string()),
    }
}

fn parse_id(raw: &str) -> Result<NotificationId, Response> {
    raw.parse::<NotificationId>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_ID",
            format!("'{raw}' is not a notification id"),
        )
    })
}

fn mutation_reply(result: Result<MutationOutcome, ControllerError>) -> Response {
    match result {
        Ok(outcome) => Json(MutationBody { outcome }).into_response(),
        Err(e) => controller_error(e),
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn get_notifications(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.snapshot().await {
        Ok(snap) => Json(NotificationsResponse {
            notifications: snap.notifications,
            unread_count: snap.unread_count,
            origin: snap.origin,
        })
        .into_response(),
        Err(e) => controller_error(e),
    }
}

async fn clear_all(State(state): State<Arc<AppState>>) -> Response {
    mutation_reply(state.controller.clear_all().await)
}

async fn post_refresh(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.refresh().await {
        Ok(outcome) => Json(RefreshBody { outcome }).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn post_mark_all_read(State(state): State<Arc<AppState>>) -> Response {
    mutation_reply(state.controller.mark_all_read().await)
}

async fn put_read(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_reply(state.controller.mark_read(id).await)
}

async fn delete_one(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    mutation_reply(state.controller.delete(id).await)
}

async fn post_click(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.controller.handle_click(id).await {
        Ok(route) => Json(ClickBody {
            route: route.map(|r| r.path()),
        })
        .into_response(),
        Err(e) => controller_error(e),
    }
}

async fn get_reminders(
    State(state): State<Arc<AppState>>,
    Path(prescription_id): Path<i64>,
) -> Response {
    match state.controller.medicine_reminders(prescription_id).await {
        Ok(reminders) => Json(RemindersBody { reminders }).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn post_toggle(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.toggle_surface().await {
        Ok(open) => Json(SurfaceBody { open }).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn post_interaction(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InteractionRequest>,
) -> Response {
    match state.controller.surface_interaction(body.target).await {
        Ok(closed) => Json(InteractionBody { closed }).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn post_realtime_test(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestNotificationRequest>,
) -> Response {
    let sent = state.transport.send_test_notification(&body.message).await;
    if sent {
        state.logger.log("Test notification published");
    }
    Json(TestNotificationBody { sent }).into_response()
}

async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.snapshot().await {
        Ok(snap) => Json(StatusResponse {
            phase: snap.phase,
            identity: snap.identity,
            connection_state: snap.connection_state,
            subscription_count: snap.subscription_count,
            reconnect_attempts: state.transport.reconnect_attempts(),
            unread_count: snap.unread_count,
            surface_open: snap.surface_open,
        })
        .into_response(),
        Err(e) => controller_error(e),
    }
}

async fn get_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LogsResponse {
        entries: state.logger.entries(),
    })
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/notifications", get(get_notifications).delete(clear_all))
        .route("/api/v1/notifications/refresh", post(post_refresh))
        .route("/api/v1/notifications/mark-all-read", post(post_mark_all_read))
        .route("/api/v1/notifications/{id}/read", put(put_read))
        .route("/api/v1/notifications/{id}", delete(delete_one))
        .route("/api/v1/notifications/{id}/click", post(post_click))
        .route("/api/v1/prescriptions/{id}/reminders", get(get_reminders))
        .route("/api/v1/surface/toggle", post(post_toggle))
        .route("/api/v1/surface/interaction", post(post_interaction))
        .route("/api/v1/realtime/test", post(post_realtime_test))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/logs", get(get_logs))
        .route("/api/v1/events", get(crate::sse::notifier_sse))
        .with_state(state)
}
