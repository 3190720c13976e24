//! Notification State Controller.
//!
//! A single tokio task owns the notification set, the surface and the
//! session profile. Callers talk to it through a cloneable
//! [`ControllerHandle`]. Server calls run in spawned tasks and report back
//! through a completion channel, so pushes and surface interactions keep
//! flowing while a call is in flight. Each command, push and completion is
//! handled to the end before the next one starts.

use std::sync::Arc;
use std::time::Duration;

use hs_protocol::{NotificationId, NotificationRecord, SnapshotResponse};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::api::{ApiError, IdentityResolver, NotificationApi, Profile};
use crate::desktop::DesktopNotifier;
use crate::navigation::{Role, Route};
use crate::state::{MergeOutcome, Mutation, NotificationState, StateOrigin, placeholder_set};
use crate::surface::{InteractionTarget, Surface};
use crate::transport::{ConnectionState, Identity, TransportManager};
use crate::ui_events::NotifierUiEvent;
use crate::ui_log::{UiLogLevel, UiLogger};

const COMMAND_BUFFER: usize = 64;
const PUSH_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no session identity; notifications are inactive")]
    Inactive,
    #[error("bootstrap has not finished")]
    NotReady,
    #[error("controller stopped")]
    Stopped,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Active,
    /// Identity could not be resolved; nothing else runs.
    Inactive,
    Disposed,
}

/// How a mutation was settled. Both leave identical local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    Confirmed,
    LocalFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed,
    /// The fetch failed and the current set was kept.
    KeptCurrent,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub phase: Phase,
    pub identity: Option<Identity>,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub subscription_count: usize,
    pub surface_open: bool,
    pub origin: StateOrigin,
    pub unread_count: u64,
    pub notifications: Vec<NotificationRecord>,
}

pub struct ControllerDeps {
    pub api: Arc<dyn NotificationApi>,
    pub identity: Arc<dyn IdentityResolver>,
    pub transport: Arc<TransportManager>,
    pub desktop: Arc<dyn DesktopNotifier>,
    pub ui_tx: broadcast::Sender<NotifierUiEvent>,
    pub logger: UiLogger,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub default_role: Role,
    pub refresh_interval: Option<Duration>,
}

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum Command {
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    Mutate(Mutation, Reply<MutationOutcome>),
    Click(NotificationId, Reply<Option<Route>>),
    Refresh(Reply<RefreshOutcome>),
    ToggleSurface(Reply<bool>),
    Interaction(InteractionTarget, Reply<bool>),
    Reminders(i64, Reply<Vec<NotificationRecord>>),
    Dispose(oneshot::Sender<()>),
}

enum MutationReply {
    Outcome(Reply<MutationOutcome>),
    Click {
        route: Option<Route>,
        reply: Reply<Option<Route>>,
    },
}

enum Completion {
    Identity(Result<Profile, ApiError>),
    Snapshot {
        result: Result<SnapshotResponse, ApiError>,
        bootstrap: bool,
        reply: Option<Reply<RefreshOutcome>>,
    },
    Mutation {
        mutation: Mutation,
        result: Result<(), ApiError>,
        reply: MutationReply,
    },
    Permission(bool),
}

/// Cloneable entry point to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    phase_rx: watch::Receiver<Phase>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        reply_rx.await.map_err(|_| ControllerError::Stopped)
    }

    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    /// Wait until bootstrap has either activated or deactivated the controller.
    pub async fn wait_until_settled(&self) -> Phase {
        let mut rx = self.phase_rx.clone();
        match rx.wait_for(|p| *p != Phase::Starting).await {
            Ok(phase) => *phase,
            Err(_) => Phase::Disposed,
        }
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ControllerError> {
        self.request(Command::Snapshot).await
    }

    pub async fn mark_read(&self, id: NotificationId) -> Result<MutationOutcome, ControllerError> {
        self.request(|r| Command::Mutate(Mutation::MarkRead(id), r))
            .await?
    }

    pub async fn mark_all_read(&self) -> Result<MutationOutcome, ControllerError> {
        self.request(|r| Command::Mutate(Mutation::MarkAllRead, r))
            .await?
    }

    pub async fn delete(&self, id: NotificationId) -> Result<MutationOutcome, ControllerError> {
        self.request(|r| Command::Mutate(Mutation::Delete(id), r))
            .await?
    }

    pub async fn clear_all(&self) -> Result<MutationOutcome, ControllerError> {
        self.request(|r| Command::Mutate(Mutation::ClearAll, r))
            .await?
    }

    /// Mark read where applicable and return the route to open, if any.
    pub async fn handle_click(&self, id: NotificationId) -> Result<Option<Route>, ControllerError> {
        self.request(|r| Command::Click(id, r)).await?
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome, ControllerError> {
        self.request(Command::Refresh).await?
    }

    /// Returns the new `open` value.
    pub async fn toggle_surface(&self) -> Result<bool, ControllerError> {
        self.request(Command::ToggleSurface).await?
    }

    /// Returns true if the interaction closed the surface.
    pub async fn surface_interaction(
        &self,
        target: InteractionTarget,
    ) -> Result<bool, ControllerError> {
        self.request(|r| Command::Interaction(target, r)).await?
    }

    pub async fn medicine_reminders(
        &self,
        prescription_id: i64,
    ) -> Result<Vec<NotificationRecord>, ControllerError> {
        self.request(|r| Command::Reminders(prescription_id, r))
            .await?
    }

    /// Disconnect the transport, close the surface and stop the task.
    pub async fn dispose(&self) -> Result<(), ControllerError> {
        self.request(Command::Dispose).await
    }
}

pub struct NotificationController {
    deps: ControllerDeps,
    config: ControllerConfig,
    state: NotificationState,
    surface: Surface,
    profile: Option<Profile>,
    role: Role,
    desktop_granted: bool,
    phase_tx: watch::Sender<Phase>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    push_tx: mpsc::Sender<NotificationRecord>,
}

impl NotificationController {
    /// Start the controller task and its bootstrap.
    pub fn spawn(deps: ControllerDeps, config: ControllerConfig) -> ControllerHandle {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (phase_tx, phase_rx) = watch::channel(Phase::Starting);
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (push_tx, pushes) = mpsc::channel(PUSH_BUFFER);
        let role = config.default_role;
        let controller = Self {
            deps,
            config,
            state: NotificationState::new(),
            surface: Surface::new(),
            profile: None,
            role,
            desktop_granted: false,
            phase_tx,
            completion_tx,
            push_tx,
        };
        tokio::spawn(controller.run(commands, completions, pushes));
        ControllerHandle { tx, phase_rx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut pushes: mpsc::Receiver<NotificationRecord>,
    ) {
        self.deps.logger.log("Notifier starting");
        self.spawn_identity_resolution();
        let mut transport_state = self.deps.transport.subscribe_state();
        let mut refresh: Option<Interval> = None;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(reply) = self.handle_command(cmd) {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(done) = completions.recv() => {
                    if let Some(identity) = self.handle_completion(done) {
                        self.deps.transport.connect(identity, self.push_tx.clone()).await;
                        refresh = self.config.refresh_interval.map(|period| {
                            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
                        });
                        self.set_phase(Phase::Active);
                    }
                }
                Some(record) = pushes.recv() => self.merge_push(record),
                Ok(()) = transport_state.changed() => {
                    let connection_state = *transport_state.borrow_and_update();
                    self.on_transport_state(connection_state);
                }
                _ = next_tick(&mut refresh) => {
                    debug!("periodic refresh");
                    self.spawn_snapshot_fetch(false, None);
                }
            }
        }
    }

    // -- bootstrap --

    fn spawn_identity_resolution(&self) {
        let resolver = Arc::clone(&self.deps.identity);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = resolver.resolve().await;
            let _ = tx.send(Completion::Identity(result));
        });
    }

    fn spawn_snapshot_fetch(&self, bootstrap: bool, reply: Option<Reply<RefreshOutcome>>) {
        let api = Arc::clone(&self.deps.api);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_snapshot().await;
            let _ = tx.send(Completion::Snapshot {
                result,
                bootstrap,
                reply,
            });
        });
    }

    fn spawn_permission_request(&self) {
        let desktop = Arc::clone(&self.deps.desktop);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let granted = desktop.request_permission().await;
            let _ = tx.send(Completion::Permission(granted));
        });
    }

    // -- commands --

    /// Returns the reply channel when the command asks the task to stop.
    fn handle_command(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Mutate(mutation, reply) => {
                if let Err(e) = self.ensure_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                self.spawn_mutation(mutation, MutationReply::Outcome(reply));
            }
            Command::Click(id, reply) => {
                if let Err(e) = self.ensure_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                self.click(id, reply);
            }
            Command::Refresh(reply) => {
                if let Err(e) = self.ensure_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                self.spawn_snapshot_fetch(false, Some(reply));
            }
            Command::ToggleSurface(reply) => {
                let result = self.ensure_active().map(|()| {
                    let open = self.surface.toggle();
                    self.emit(NotifierUiEvent::SurfaceChanged { open });
                    open
                });
                let _ = reply.send(result);
            }
            Command::Interaction(target, reply) => {
                let result = self.ensure_active().map(|()| {
                    let closed = self.surface.interaction(target);
                    if closed {
                        self.emit(NotifierUiEvent::SurfaceChanged { open: false });
                    }
                    closed
                });
                let _ = reply.send(result);
            }
            Command::Reminders(prescription_id, reply) => {
                if let Err(e) = self.ensure_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                let api = Arc::clone(&self.deps.api);
                tokio::spawn(async move {
                    let result = api
                        .fetch_medicine_reminders(prescription_id)
                        .await
                        .map_err(ControllerError::from);
                    let _ = reply.send(result);
                });
            }
            Command::Dispose(reply) => return Some(reply),
        }
        None
    }

    fn ensure_active(&self) -> Result<(), ControllerError> {
        match *self.phase_tx.borrow() {
            Phase::Active => Ok(()),
            Phase::Starting => Err(ControllerError::NotReady),
            Phase::Inactive => Err(ControllerError::Inactive),
            Phase::Disposed => Err(ControllerError::Stopped),
        }
    }

    fn click(&mut self, id: NotificationId, reply: Reply<Option<Route>>) {
        let Some(record) = self.state.get(id) else {
            debug!(%id, "click on unknown notification");
            let _ = reply.send(Ok(None));
            return;
        };
        if !record.category.is_appointment() && !record.category.is_prescription() {
            let _ = reply.send(Ok(None));
            return;
        }
        let route = Route::for_record(record, self.role);
        self.spawn_mutation(Mutation::MarkRead(id), MutationReply::Click { route, reply });
    }

    fn spawn_mutation(&self, mutation: Mutation, reply: MutationReply) {
        let api = Arc::clone(&self.deps.api);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match mutation {
                Mutation::MarkRead(id) => api.mark_read(id).await,
                Mutation::MarkAllRead => api.mark_all_read().await,
                Mutation::Delete(id) => api.delete(id).await,
                Mutation::ClearAll => api.clear_all().await,
            };
            let _ = tx.send(Completion::Mutation {
                mutation,
                result,
                reply,
            });
        });
    }

    // -- completions --

    /// Returns the identity to start the realtime feed for once bootstrap
    /// has produced its first snapshot.
    fn handle_completion(&mut self, done: Completion) -> Option<Identity> {
        match done {
            Completion::Identity(Ok(profile)) => {
                self.role = profile.role.unwrap_or(self.config.default_role);
                self.profile = Some(profile);
                self.deps.logger.log(format!(
                    "Session identity {} resolved (role {})",
                    profile.identity, self.role
                ));
                self.spawn_snapshot_fetch(true, None);
                self.spawn_permission_request();
                None
            }
            Completion::Identity(Err(e)) => {
                self.deps.logger.log_at(
                    UiLogLevel::Warn,
                    format!("Could not resolve session identity, notifications inactive: {e}"),
                );
                self.set_phase(Phase::Inactive);
                None
            }
            Completion::Snapshot {
                result,
                bootstrap,
                reply,
            } => {
                let outcome = match result {
                    Ok(snapshot) => {
                        info!(
                            count = snapshot.notifications.len(),
                            unread = snapshot.unread_count,
                            "snapshot applied"
                        );
                        self.state.replace_snapshot(
                            snapshot.notifications,
                            Some(snapshot.unread_count),
                            StateOrigin::Server,
                        );
                        self.emit_full_snapshot();
                        RefreshOutcome::Refreshed
                    }
                    Err(e) if bootstrap => {
                        self.deps.logger.log_at(
                            UiLogLevel::Warn,
                            format!("Snapshot fetch failed, showing placeholder set: {e}"),
                        );
                        self.state
                            .replace_snapshot(placeholder_set(), None, StateOrigin::Placeholder);
                        self.emit_full_snapshot();
                        RefreshOutcome::KeptCurrent
                    }
                    Err(e) => {
                        warn!(error = %e, "snapshot refresh failed, keeping current set");
                        RefreshOutcome::KeptCurrent
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(outcome));
                }
                if bootstrap {
                    self.profile.map(|p| p.identity)
                } else {
                    None
                }
            }
            Completion::Mutation {
                mutation,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => MutationOutcome::Confirmed,
                    Err(e) => {
                        self.deps.logger.log_at(
                            UiLogLevel::Warn,
                            format!("{mutation:?} failed on server, applied locally: {e}"),
                        );
                        MutationOutcome::LocalFallback
                    }
                };
                self.apply_mutation(mutation);
                match reply {
                    MutationReply::Outcome(reply) => {
                        let _ = reply.send(Ok(outcome));
                    }
                    MutationReply::Click { route, reply } => {
                        if let Some(route) = route {
                            if self.surface.close() {
                                self.emit(NotifierUiEvent::SurfaceChanged { open: false });
                            }
                            self.emit(NotifierUiEvent::Navigate { path: route.path() });
                        }
                        let _ = reply.send(Ok(route));
                    }
                }
                None
            }
            Completion::Permission(granted) => {
                info!(granted, "desktop notification permission");
                self.desktop_granted = granted;
                None
            }
        }
    }

    // -- state changes --

    fn apply_mutation(&mut self, mutation: Mutation) {
        if !self.state.apply(mutation) {
            return;
        }
        match mutation {
            Mutation::MarkRead(id) => {
                if let Some(record) = self.state.get(id).cloned() {
                    self.emit(NotifierUiEvent::NotificationUpdated {
                        notification: record,
                    });
                }
                self.emit_unread();
            }
            Mutation::Delete(id) => {
                self.emit(NotifierUiEvent::NotificationRemoved { id });
                self.emit_unread();
            }
            Mutation::MarkAllRead | Mutation::ClearAll => self.emit_full_snapshot(),
        }
    }

    fn merge_push(&mut self, record: NotificationRecord) {
        if self.profile.is_none() {
            debug!(id = %record.id, "push before identity resolved, dropping");
            return;
        }
        if self.desktop_granted {
            let desktop = Arc::clone(&self.deps.desktop);
            let shown = record.clone();
            tokio::spawn(async move { desktop.show(&shown).await });
        }
        let event_record = record.clone();
        match self.state.merge_push(record) {
            MergeOutcome::Added => self.emit(NotifierUiEvent::NotificationAdded {
                notification: event_record,
            }),
            MergeOutcome::Replaced => self.emit(NotifierUiEvent::NotificationUpdated {
                notification: event_record,
            }),
        }
        self.emit_unread();
    }

    fn on_transport_state(&mut self, connection_state: ConnectionState) {
        match connection_state {
            ConnectionState::Connected => self.deps.logger.log("Realtime feed connected"),
            ConnectionState::GivenUp => self.deps.logger.log_at(
                UiLogLevel::Warn,
                "Realtime feed gave up reconnecting; relying on snapshot refresh",
            ),
            _ => {}
        }
        self.emit_status(connection_state);
    }

    async fn shutdown(&mut self) {
        self.deps.transport.disconnect().await;
        if self.surface.close() {
            self.emit(NotifierUiEvent::SurfaceChanged { open: false });
        }
        self.set_phase(Phase::Disposed);
        self.deps.logger.log("Notifier stopped");
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase_tx.send_replace(phase);
        self.emit_status(self.deps.transport.state());
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            phase: *self.phase_tx.borrow(),
            identity: self.profile.map(|p| p.identity),
            role: self.role,
            connection_state: self.deps.transport.state(),
            subscription_count: self.deps.transport.subscription_count(),
            surface_open: self.surface.is_open(),
            origin: self.state.origin(),
            unread_count: self.state.unread_count(),
            notifications: self.state.records().to_vec(),
        }
    }

    // -- events --

    fn emit(&self, event: NotifierUiEvent) {
        let _ = self.deps.ui_tx.send(event);
    }

    fn emit_status(&self, connection_state: ConnectionState) {
        self.emit(NotifierUiEvent::StatusChanged {
            connection_state,
            active: *self.phase_tx.borrow() == Phase::Active,
        });
    }

    fn emit_unread(&self) {
        self.emit(NotifierUiEvent::UnreadCountChanged {
            unread_count: self.state.unread_count(),
        });
    }

    fn emit_full_snapshot(&self) {
        self.emit(NotifierUiEvent::NotificationsSnapshot {
            notifications: self.state.records().to_vec(),
            unread_count: self.state.unread_count(),
            origin: self.state.origin(),
        });
        self.emit_unread();
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
