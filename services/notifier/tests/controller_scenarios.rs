//! End-to-end controller scenarios against the mock REST backend and the
//! mock STOMP broker.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hs_protocol::{NotificationCategory, NotificationRecord, ProfileResponse};
use hs_test_utils::fixtures;
use hs_test_utils::{FailureMode, MockNotificationBackend, MockStompBroker};
use notifier::api::HttpNotificationApi;
use notifier::controller::{
    ControllerConfig, ControllerDeps, ControllerError, ControllerHandle, ControllerSnapshot,
    MutationOutcome, NotificationController, Phase, RefreshOutcome,
};
use notifier::desktop::{DesktopMode, DesktopNotifier, notifier_for};
use notifier::navigation::Role;
use notifier::state::StateOrigin;
use notifier::surface::InteractionTarget;
use notifier::transport::{ConnectionState, TransportConfig, TransportManager};
use notifier::ui_events::NotifierUiEvent;
use notifier::ui_log::UiLogger;
use tokio::sync::broadcast;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    backend: MockNotificationBackend,
    broker: MockStompBroker,
    controller: ControllerHandle,
    transport: Arc<TransportManager>,
    ui_rx: broadcast::Receiver<NotifierUiEvent>,
    logger: UiLogger,
}

async fn start_backend(
    profile: Option<ProfileResponse>,
    records: Vec<hs_protocol::NotificationRecord>,
) -> MockNotificationBackend {
    let backend = MockNotificationBackend::start().await.unwrap();
    backend.set_profile(profile);
    backend.set_notifications(records);
    backend
}

fn patient(id: i64) -> Option<ProfileResponse> {
    Some(ProfileResponse { id, role: None })
}

async fn spawn(backend: MockNotificationBackend) -> Harness {
    spawn_with_desktop(backend, notifier_for(DesktopMode::Log)).await
}

async fn spawn_with_desktop(
    backend: MockNotificationBackend,
    desktop: Arc<dyn DesktopNotifier>,
) -> Harness {
    let broker = MockStompBroker::start().await.unwrap();
    let api = Arc::new(
        HttpNotificationApi::new(
            &backend.base_url(),
            "/patients/profile",
            Some("test-token".to_owned()),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let transport = Arc::new(TransportManager::new(TransportConfig {
        url: format!("{}/ws/websocket", broker.base_url()),
        token: Some("test-token".to_owned()),
        destination: "/user/queue/notifications".to_owned(),
        reconnect_base_delay: Duration::from_millis(10),
        max_reconnect_attempts: 5,
        send_connection_test: false,
    }));
    let (ui_tx, ui_rx) = broadcast::channel(256);
    let logger = UiLogger::new(ui_tx.clone(), 100);
    let controller = NotificationController::spawn(
        ControllerDeps {
            api: api.clone(),
            identity: api,
            transport: Arc::clone(&transport),
            desktop,
            ui_tx,
            logger: logger.clone(),
        },
        ControllerConfig {
            default_role: Role::Patient,
            refresh_interval: None,
        },
    );
    Harness {
        backend,
        broker,
        controller,
        transport,
        ui_rx,
        logger,
    }
}

async fn active(backend: MockNotificationBackend) -> Harness {
    let h = spawn(backend).await;
    assert_eq!(h.controller.wait_until_settled().await, Phase::Active);
    h
}

/// Poll the controller until `pred` holds.
async fn until(
    controller: &ControllerHandle,
    pred: impl Fn(&ControllerSnapshot) -> bool,
) -> ControllerSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snap = controller.snapshot().await.unwrap();
        if pred(&snap) || tokio::time::Instant::now() >= deadline {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn unread_in(snap: &ControllerSnapshot) -> u64 {
    snap.notifications.iter().filter(|n| !n.read).count() as u64
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_loads_on_bootstrap() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::read(2)]).await;
    let h = active(backend).await;

    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.identity.map(|i| i.get()), Some(42));
    assert_eq!(snap.role, Role::Patient);
    assert_eq!(snap.origin, StateOrigin::Server);
    assert_eq!(snap.notifications.len(), 2);
    assert_eq!(snap.unread_count, 1);

    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);
    assert_eq!(h.broker.active_subscriptions()[0].id, "sub-42");
    let snap = until(&h.controller, |s| s.connection_state == ConnectionState::Connected).await;
    assert_eq!(snap.subscription_count, 1);
    assert!(
        h.logger
            .entries()
            .iter()
            .any(|e| e.contains("Session identity 42 resolved"))
    );
}

#[tokio::test]
async fn snapshot_failure_falls_back_to_placeholder() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1)]).await;
    backend.set_snapshot_failure(FailureMode::ServerError);
    let h = active(backend).await;

    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.origin, StateOrigin::Placeholder);
    assert_eq!(snap.notifications.len(), 2);
    assert_eq!(snap.unread_count, 2);
    assert_eq!(unread_in(&snap), 2);

    // The realtime feed still starts.
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);
}

#[tokio::test]
async fn rejected_snapshot_also_uses_placeholder() {
    let backend = start_backend(patient(42), vec![]).await;
    backend.set_snapshot_failure(FailureMode::Rejected);
    let h = active(backend).await;
    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.origin, StateOrigin::Placeholder);
    assert_eq!(snap.unread_count, 2);
}

#[tokio::test]
async fn unresolved_identity_leaves_controller_inactive() {
    let backend = start_backend(None, vec![fixtures::unread(1)]).await;
    let h = spawn(backend).await;
    assert_eq!(h.controller.wait_until_settled().await, Phase::Inactive);

    assert!(matches!(
        h.controller.mark_all_read().await,
        Err(ControllerError::Inactive)
    ));
    assert!(matches!(
        h.controller.toggle_surface().await,
        Err(ControllerError::Inactive)
    ));
    assert!(matches!(
        h.controller.refresh().await,
        Err(ControllerError::Inactive)
    ));

    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.phase, Phase::Inactive);
    assert!(snap.identity.is_none());
    assert!(snap.notifications.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.connections_accepted(), 0);
    assert_eq!(h.backend.calls(), vec!["GET /patients/profile".to_owned()]);
}

#[tokio::test]
async fn non_positive_profile_id_is_inactive() {
    let backend = start_backend(patient(0), vec![]).await;
    let h = spawn(backend).await;
    assert_eq!(h.controller.wait_until_settled().await, Phase::Inactive);
}

// ---------------------------------------------------------------------------
// Pushes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_of_new_record_is_prepended() {
    let backend = start_backend(patient(42), vec![fixtures::read(1)]).await;
    let mut h = active(backend).await;
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);

    let pushed = fixtures::unread(2);
    h.broker.push(&fixtures::push_body(&pushed));

    let snap = until(&h.controller, |s| s.notifications.len() == 2).await;
    assert_eq!(snap.notifications[0], pushed);
    assert_eq!(snap.unread_count, 1);

    let mut saw_added = false;
    while let Ok(event) = h.ui_rx.try_recv() {
        if let NotifierUiEvent::NotificationAdded { notification } = event {
            saw_added |= notification.id == pushed.id;
        }
    }
    assert!(saw_added, "expected a notification_added event");
}

#[tokio::test]
async fn push_of_known_id_replaces_without_duplicating() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::unread(2)]).await;
    let h = active(backend).await;
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);

    let mut updated = fixtures::unread(1);
    updated.read = true;
    updated.title = "updated".to_owned();
    h.broker.push(&fixtures::push_body(&updated));

    let snap = until(&h.controller, |s| s.unread_count == 1).await;
    assert_eq!(snap.notifications.len(), 2);
    assert_eq!(snap.unread_count, 1);
    let stored = snap
        .notifications
        .iter()
        .find(|n| n.id == updated.id)
        .unwrap();
    assert_eq!(stored.title, "updated");
    assert!(stored.read);
}

#[tokio::test]
async fn undecodable_push_leaves_state_untouched() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1)]).await;
    let h = active(backend).await;
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);

    h.broker.push("{\"broken\":");
    let next = fixtures::unread(3);
    h.broker.push(&fixtures::push_body(&next));

    let snap = until(&h.controller, |s| s.notifications.len() == 2).await;
    assert_eq!(snap.notifications.len(), 2);
    assert_eq!(snap.unread_count, 2);
}

/// Answers the permission request with a fixed value and records each `show`.
struct RecordingDesktop {
    granted: bool,
    requests: AtomicUsize,
    shown: Mutex<Vec<Uuid>>,
}

impl RecordingDesktop {
    fn new(granted: bool) -> Arc<Self> {
        Arc::new(Self {
            granted,
            requests: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        })
    }

    fn shown(&self) -> Vec<Uuid> {
        self.shown.lock().unwrap().clone()
    }
}

impl DesktopNotifier for RecordingDesktop {
    fn request_permission<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let granted = self.granted;
        Box::pin(async move { granted })
    }

    fn show<'a>(
        &'a self,
        record: &'a NotificationRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.shown.lock().unwrap().push(record.id);
        Box::pin(async {})
    }
}

async fn push_under_permission(granted: bool) -> (ControllerSnapshot, Vec<Uuid>) {
    let backend = start_backend(patient(42), vec![fixtures::read(1)]).await;
    let desktop = RecordingDesktop::new(granted);
    let h = spawn_with_desktop(backend, desktop.clone()).await;
    assert_eq!(h.controller.wait_until_settled().await, Phase::Active);
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);
    assert_eq!(desktop.requests.load(Ordering::SeqCst), 1);
    // Let the permission answer reach the controller before pushing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pushed = fixtures::unread(2);
    h.broker.push(&fixtures::push_body(&pushed));
    let snap = until(&h.controller, |s| s.notifications.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    (snap, desktop.shown())
}

#[tokio::test]
async fn desktop_permission_gates_only_the_desktop_notification() {
    let (granted_snap, granted_shown) = push_under_permission(true).await;
    let (denied_snap, denied_shown) = push_under_permission(false).await;

    assert_eq!(granted_shown, vec![fixtures::unread(2).id]);
    assert!(denied_shown.is_empty());

    assert_eq!(granted_snap.notifications, denied_snap.notifications);
    assert_eq!(granted_snap.unread_count, 1);
    assert_eq!(denied_snap.unread_count, 1);
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_read_decrements_unread() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::unread(2)]).await;
    let h = active(backend).await;

    let outcome = h.controller.mark_read(Uuid::from_u128(1)).await.unwrap();
    assert_eq!(outcome, MutationOutcome::Confirmed);
    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.unread_count, 1);
    assert!(snap.notifications.iter().any(|n| n.id == Uuid::from_u128(1) && n.read));

    // Marking it again changes nothing.
    h.controller.mark_read(Uuid::from_u128(1)).await.unwrap();
    assert_eq!(h.controller.snapshot().await.unwrap().unread_count, 1);
}

#[tokio::test]
async fn mark_all_read_is_identical_on_success_and_failure() {
    let records = vec![fixtures::unread(1), fixtures::unread(2), fixtures::read(3)];

    let ok = active(start_backend(patient(42), records.clone()).await).await;
    let failing_backend = start_backend(patient(42), records).await;
    failing_backend.set_mutation_failure(FailureMode::ServerError);
    let failing = active(failing_backend).await;

    assert_eq!(
        ok.controller.mark_all_read().await.unwrap(),
        MutationOutcome::Confirmed
    );
    assert_eq!(
        failing.controller.mark_all_read().await.unwrap(),
        MutationOutcome::LocalFallback
    );

    let a = ok.controller.snapshot().await.unwrap();
    let b = failing.controller.snapshot().await.unwrap();
    assert_eq!(a.notifications, b.notifications);
    assert_eq!(a.unread_count, 0);
    assert_eq!(b.unread_count, 0);
    assert!(a.notifications.iter().all(|n| n.read));
}

#[tokio::test]
async fn rejected_mutation_still_applies_locally() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::read(2)]).await;
    backend.set_mutation_failure(FailureMode::Rejected);
    let h = active(backend).await;

    let outcome = h.controller.delete(Uuid::from_u128(1)).await.unwrap();
    assert_eq!(outcome, MutationOutcome::LocalFallback);
    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.notifications.len(), 1);
    assert_eq!(snap.unread_count, 0);
    assert!(
        h.logger
            .entries()
            .iter()
            .any(|e| e.contains("applied locally"))
    );
}

#[tokio::test]
async fn delete_removes_record_and_adjusts_count() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::read(2)]).await;
    let h = active(backend).await;

    h.controller.delete(Uuid::from_u128(2)).await.unwrap();
    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.notifications.len(), 1);
    assert_eq!(snap.unread_count, 1);

    h.controller.delete(Uuid::from_u128(1)).await.unwrap();
    let snap = h.controller.snapshot().await.unwrap();
    assert!(snap.notifications.is_empty());
    assert_eq!(snap.unread_count, 0);

    // Unknown ids are a no-op locally.
    h.controller.delete(Uuid::from_u128(99)).await.unwrap();
    assert!(h.controller.snapshot().await.unwrap().notifications.is_empty());
    assert!(
        h.backend
            .calls()
            .contains(&format!("DELETE /notifications/{}", Uuid::from_u128(2)))
    );
}

#[tokio::test]
async fn clear_all_empties_the_set() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1), fixtures::unread(2)]).await;
    let h = active(backend).await;

    h.controller.clear_all().await.unwrap();
    let snap = h.controller.snapshot().await.unwrap();
    assert!(snap.notifications.is_empty());
    assert_eq!(snap.unread_count, 0);
    assert!(h.backend.notifications().is_empty());
}

// ---------------------------------------------------------------------------
// Click + navigation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn click_routes_by_role_and_marks_read() {
    let backend = start_backend(
        Some(ProfileResponse {
            id: 9,
            role: Some("DOCTOR".to_owned()),
        }),
        vec![
            fixtures::unread(4),
            fixtures::read(5),
            fixtures::record(6, NotificationCategory::SystemAlert, false),
        ],
    )
    .await;
    let mut h = active(backend).await;
    assert!(h.controller.toggle_surface().await.unwrap());

    let route = h.controller.handle_click(Uuid::from_u128(4)).await.unwrap();
    assert_eq!(route.map(|r| r.path()).as_deref(), Some("/doctor/appointments/4"));
    let snap = h.controller.snapshot().await.unwrap();
    assert!(!snap.surface_open);
    assert_eq!(snap.unread_count, 1);

    let route = h.controller.handle_click(Uuid::from_u128(5)).await.unwrap();
    assert_eq!(route.map(|r| r.path()).as_deref(), Some("/doctor/prescriptions/5"));

    // System alerts do not navigate and stay unread.
    let route = h.controller.handle_click(Uuid::from_u128(6)).await.unwrap();
    assert!(route.is_none());
    assert_eq!(h.controller.snapshot().await.unwrap().unread_count, 1);

    // Unknown ids do nothing.
    assert!(
        h.controller
            .handle_click(Uuid::from_u128(77))
            .await
            .unwrap()
            .is_none()
    );

    let mut paths = Vec::new();
    while let Ok(event) = h.ui_rx.try_recv() {
        if let NotifierUiEvent::Navigate { path } = event {
            paths.push(path);
        }
    }
    assert_eq!(
        paths,
        vec![
            "/doctor/appointments/4".to_owned(),
            "/doctor/prescriptions/5".to_owned()
        ]
    );
}

#[tokio::test]
async fn click_uses_default_role_when_profile_has_none() {
    let backend = start_backend(patient(42), vec![fixtures::unread(4)]).await;
    let h = active(backend).await;
    let route = h.controller.handle_click(Uuid::from_u128(4)).await.unwrap();
    assert_eq!(route.map(|r| r.path()).as_deref(), Some("/patient/appointments/4"));
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn surface_toggles_and_closes_on_outside_interaction() {
    let backend = start_backend(patient(42), vec![]).await;
    let h = active(backend).await;

    assert!(h.controller.toggle_surface().await.unwrap());
    assert!(
        !h.controller
            .surface_interaction(InteractionTarget::Inside)
            .await
            .unwrap()
    );
    assert!(h.controller.snapshot().await.unwrap().surface_open);

    assert!(
        h.controller
            .surface_interaction(InteractionTarget::Outside)
            .await
            .unwrap()
    );
    assert!(!h.controller.snapshot().await.unwrap().surface_open);

    // Closed surface ignores outside interactions.
    assert!(
        !h.controller
            .surface_interaction(InteractionTarget::Outside)
            .await
            .unwrap()
    );

    assert!(h.controller.toggle_surface().await.unwrap());
    assert!(!h.controller.toggle_surface().await.unwrap());
}

// ---------------------------------------------------------------------------
// Refresh + reminders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_replaces_state_and_failure_keeps_it() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1)]).await;
    let h = active(backend).await;

    h.backend
        .set_notifications(vec![fixtures::unread(1), fixtures::unread(2), fixtures::read(3)]);
    assert_eq!(
        h.controller.refresh().await.unwrap(),
        RefreshOutcome::Refreshed
    );
    let snap = h.controller.snapshot().await.unwrap();
    assert_eq!(snap.notifications.len(), 3);
    assert_eq!(snap.unread_count, 2);

    h.backend.set_snapshot_failure(FailureMode::ServerError);
    assert_eq!(
        h.controller.refresh().await.unwrap(),
        RefreshOutcome::KeptCurrent
    );
    let after = h.controller.snapshot().await.unwrap();
    assert_eq!(after.notifications, snap.notifications);
    assert_eq!(after.origin, StateOrigin::Server);
}

#[tokio::test]
async fn medicine_reminders_are_fetched_per_prescription() {
    let reminder = fixtures::record(12, NotificationCategory::MedicineReminder, false);
    let backend = start_backend(patient(42), vec![reminder.clone(), fixtures::read(13)]).await;
    let h = active(backend).await;

    let reminders = h.controller.medicine_reminders(12).await.unwrap();
    assert_eq!(reminders, vec![reminder]);
    assert!(h.controller.medicine_reminders(13).await.unwrap().is_empty());

    h.backend.set_snapshot_failure(FailureMode::ServerError);
    assert!(matches!(
        h.controller.medicine_reminders(12).await,
        Err(ControllerError::Api(_))
    ));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispose_disconnects_and_stops() {
    let backend = start_backend(patient(42), vec![fixtures::unread(1)]).await;
    let h = active(backend).await;
    assert!(h.broker.wait_for_subscriptions(1, WAIT).await);
    h.controller.toggle_surface().await.unwrap();

    h.controller.dispose().await.unwrap();
    assert_eq!(h.controller.phase(), Phase::Disposed);
    assert!(h.broker.wait_for_subscriptions(0, WAIT).await);
    assert_eq!(h.transport.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.subscription_count(), 0);

    assert!(matches!(
        h.controller.mark_read(Uuid::from_u128(1)).await,
        Err(ControllerError::Stopped)
    ));
}
