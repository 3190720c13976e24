//! Realtime Transport Manager.
//!
//! Owns the lifecycle of the push connection: one supervisor task per
//! `connect`, which runs sessions back to back with a bounded linear
//! backoff between them. Decoded notifications go to the single sink handed
//! to `connect`; nothing is queued across disconnects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use hs_protocol::{NotificationCategory, NotificationRecord, TestNotification};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session::{self, SessionCommand, SessionEnd, SessionParams};

/// A known, non-placeholder session subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(i64);

impl Identity {
    /// `None` for zero or negative ids.
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; stays off until the next `connect`.
    GivenUp,
}

/// Linear backoff: retry `n` (1-indexed) waits `base * n`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.base_delay * self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Full WebSocket URL of the realtime endpoint.
    pub url: String,
    pub token: Option<String>,
    /// May contain `{identity}`.
    pub destination: String,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub send_connection_test: bool,
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: AtomicUsize,
    attempts: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

struct ActiveSession {
    identity: Identity,
    shutdown_tx: watch::Sender<bool>,
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

pub struct TransportManager {
    config: TransportConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                state_tx,
                subscriptions: AtomicUsize::new(0),
                attempts: AtomicU32::new(0),
            }),
            active: Mutex::new(None),
        }
    }

    /// Start delivering notifications for `identity` into `sink`.
    ///
    /// Returns once the supervisor is running; the connection itself is
    /// established in the background. A session that is already running is
    /// torn down first, so at most one subscription is ever live.
    pub async fn connect(&self, identity: Identity, sink: mpsc::Sender<NotificationRecord>) {
        let mut active = self.active.lock().await;
        if let Some(prev) = active.take() {
            info!(identity = %prev.identity, "replacing active session");
            stop(prev).await;
            self.reset_counters();
        }

        let params = SessionParams {
            url: self.config.url.clone(),
            token: self.config.token.clone(),
            destination: session::resolve_destination(&self.config.destination, identity),
            identity,
            send_connection_test: self.config.send_connection_test,
        };
        let policy = ReconnectPolicy::new(
            self.config.reconnect_base_delay,
            self.config.max_reconnect_attempts,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let shared = Arc::clone(&self.shared);
        shared.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(supervise(params, policy, sink, cmd_rx, shutdown_rx, shared));

        *active = Some(ActiveSession {
            identity,
            shutdown_tx,
            commands: cmd_tx,
            task,
        });
    }

    /// Tear down the session, if any, and reset the attempt counter.
    /// Safe to call when never connected.
    pub async fn disconnect(&self) {
        let prev = self.active.lock().await.take();
        if let Some(prev) = prev {
            info!(identity = %prev.identity, "disconnecting");
            stop(prev).await;
        }
        self.reset_counters();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Publish a diagnostic notification to `/app/notify`.
    ///
    /// Returns false when not connected.
    pub async fn send_test_notification(&self, message: &str) -> bool {
        if !self.is_connected() {
            warn!("cannot send test notification: not connected");
            return false;
        }
        let active = self.active.lock().await;
        let Some(session) = active.as_ref() else {
            return false;
        };
        let payload = TestNotification {
            user_id: session.identity.get(),
            message: message.to_owned(),
            category: NotificationCategory::AppointmentConfirmation,
            timestamp: Utc::now().to_rfc3339(),
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode test notification");
                return false;
            }
        };
        session
            .commands
            .try_send(SessionCommand::Publish {
                destination: session::TEST_NOTIFICATION_DESTINATION.to_owned(),
                body,
            })
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscriptions tracked by the live session (0 or 1).
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn reset_counters(&self) {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.subscriptions.store(0, Ordering::SeqCst);
    }
}

async fn stop(session: ActiveSession) {
    let _ = session.shutdown_tx.send(true);
    if let Err(e) = session.task.await {
        warn!(error = %e, "transport supervisor task failed");
    }
}

async fn supervise(
    params: SessionParams,
    mut policy: ReconnectPolicy,
    sink: mpsc::Sender<NotificationRecord>,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            r = session::connect(&params) => r,
        };

        match connected {
            Ok(mut session) => {
                policy.reset();
                shared.attempts.store(0, Ordering::SeqCst);
                shared
                    .subscriptions
                    .store(session.subscription_ids.len(), Ordering::SeqCst);
                shared.set_state(ConnectionState::Connected);
                info!(identity = %params.identity, "realtime feed connected");

                let end = session::run_session_loop(
                    &mut session.ws,
                    &session.subscription_ids,
                    &sink,
                    &mut commands,
                    &mut shutdown,
                )
                .await;
                shared.subscriptions.store(0, Ordering::SeqCst);
                while commands.try_recv().is_ok() {}

                match end {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Closed) => warn!("realtime connection closed by server"),
                    Err(e) => warn!(error = %e, "realtime session ended"),
                }
            }
            Err(e) => warn!(error = %e, "realtime connect failed"),
        }

        shared.set_state(ConnectionState::Disconnected);
        let Some(delay) = policy.next_delay() else {
            warn!(
                attempts = policy.attempts(),
                "giving up on realtime feed; snapshot refresh only"
            );
            shared.set_state(ConnectionState::GivenUp);
            return;
        };
        shared.attempts.store(policy.attempts(), Ordering::SeqCst);
        info!(
            attempt = policy.attempts(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.set_state(ConnectionState::Disconnected);
}
