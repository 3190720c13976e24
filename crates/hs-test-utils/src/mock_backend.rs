// mock_backend: An in-process stand-in for the notification REST API.
//
// Serves the snapshot, mutation, profile and reminder endpoints from an
// in-memory list and can be told to fail, either with a 500 or with a
// `success: false` envelope.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use hs_protocol::{
    MutationResponse, NotificationCategory, NotificationRecord, ProfileResponse, RemindersResponse,
    SnapshotResponse,
};
use tokio::net::TcpListener;

/// How an endpoint group should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    None,
    /// Respond 500 with an error envelope.
    ServerError,
    /// Respond 200 with `success: false`.
    Rejected,
}

#[derive(Default)]
struct BackendData {
    notifications: Vec<NotificationRecord>,
    profile: Option<ProfileResponse>,
    snapshot_failure: FailureMode,
    mutation_failure: FailureMode,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<BackendData>>;

pub struct MockNotificationBackend {
    addr: SocketAddr,
    data: Shared,
    _task: tokio::task::JoinHandle<()>,
}

impl MockNotificationBackend {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let data: Shared = Arc::new(Mutex::new(BackendData::default()));

        let app = Router::new()
            .route("/patients/profile", get(get_profile))
            .route("/notifications", get(get_notifications))
            .route("/notifications/mark-all-read", post(mark_all_read))
            .route("/notifications/clear-all", delete(clear_all))
            .route("/notifications/{id}/read", put(mark_read))
            .route("/notifications/{id}", delete(delete_one))
            .route(
                "/notifications/prescription/{id}/reminders",
                get(get_reminders),
            )
            .with_state(Arc::clone(&data));

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            data,
            _task: task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_notifications(&self, records: Vec<NotificationRecord>) {
        self.lock().notifications = records;
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.lock().notifications.clone()
    }

    pub fn set_profile(&self, profile: Option<ProfileResponse>) {
        self.lock().profile = profile;
    }

    pub fn set_snapshot_failure(&self, mode: FailureMode) {
        self.lock().snapshot_failure = mode;
    }

    pub fn set_mutation_failure(&self, mode: FailureMode) {
        self.lock().mutation_failure = mode;
    }

    /// Requests seen so far, formatted as `METHOD /path`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendData> {
        self.data.lock().expect("backend state poisoned")
    }
}

fn failure_response(mode: FailureMode) -> Option<Response> {
    let body = MutationResponse {
        success: false,
        message: None,
        error: Some("simulated failure".to_owned()),
    };
    match mode {
        FailureMode::None => None,
        FailureMode::ServerError => {
            Some((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
        }
        FailureMode::Rejected => Some((StatusCode::OK, Json(body)).into_response()),
    }
}

fn ok_mutation(message: &str) -> Response {
    Json(MutationResponse {
        success: true,
        message: Some(message.to_owned()),
        error: None,
    })
    .into_response()
}

async fn get_profile(State(data): State<Shared>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push("GET /patients/profile".to_owned());
    match d.profile.clone() {
        Some(profile) => Json(profile).into_response(),
        None => (StatusCode::UNAUTHORIZED, "not logged in").into_response(),
    }
}

async fn get_notifications(State(data): State<Shared>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push("GET /notifications".to_owned());
    if let Some(resp) = failure_response(d.snapshot_failure) {
        return resp;
    }
    let unread_count = d.notifications.iter().filter(|n| !n.read).count() as u64;
    Json(SnapshotResponse {
        success: true,
        notifications: d.notifications.clone(),
        unread_count,
        error: None,
    })
    .into_response()
}

async fn mark_read(State(data): State<Shared>, Path(id): Path<String>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push(format!("PUT /notifications/{id}/read"));
    if let Some(resp) = failure_response(d.mutation_failure) {
        return resp;
    }
    for n in d.notifications.iter_mut() {
        if n.id.to_string() == id {
            n.read = true;
        }
    }
    ok_mutation("Notification marked as read")
}

async fn mark_all_read(State(data): State<Shared>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push("POST /notifications/mark-all-read".to_owned());
    if let Some(resp) = failure_response(d.mutation_failure) {
        return resp;
    }
    for n in d.notifications.iter_mut() {
        n.read = true;
    }
    ok_mutation("All notifications marked as read")
}

async fn delete_one(State(data): State<Shared>, Path(id): Path<String>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push(format!("DELETE /notifications/{id}"));
    if let Some(resp) = failure_response(d.mutation_failure) {
        return resp;
    }
    d.notifications.retain(|n| n.id.to_string() != id);
    ok_mutation("Notification deleted successfully")
}

async fn clear_all(State(data): State<Shared>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls.push("DELETE /notifications/clear-all".to_owned());
    if let Some(resp) = failure_response(d.mutation_failure) {
        return resp;
    }
    d.notifications.clear();
    ok_mutation("All notifications cleared successfully")
}

async fn get_reminders(State(data): State<Shared>, Path(id): Path<i64>) -> Response {
    let mut d = data.lock().expect("backend state poisoned");
    d.calls
        .push(format!("GET /notifications/prescription/{id}/reminders"));
    if let Some(resp) = failure_response(d.snapshot_failure) {
        return resp;
    }
    let reminders = d
        .notifications
        .iter()
        .filter(|n| {
            n.category == NotificationCategory::MedicineReminder && n.prescription_id() == Some(id)
        })
        .cloned()
        .collect();
    Json(RemindersResponse {
        success: true,
        reminders,
        error: None,
    })
    .into_response()
}
