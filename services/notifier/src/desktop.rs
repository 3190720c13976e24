//! Local desktop notifications for live events.
//!
//! Permission is requested once at bootstrap. The answer only decides
//! whether pushed records also produce a desktop notification; it never
//! affects the notification state.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use hs_protocol::NotificationRecord;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub trait DesktopNotifier: Send + Sync {
    /// Ask for permission to show notifications. Returns whether it was granted.
    fn request_permission<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    fn show<'a>(
        &'a self,
        record: &'a NotificationRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopMode {
    Disabled,
    Log,
    NotifySend,
}

impl FromStr for DesktopMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(DesktopMode::Disabled),
            "log" => Ok(DesktopMode::Log),
            "notify-send" => Ok(DesktopMode::NotifySend),
            _ => Err(()),
        }
    }
}

pub fn notifier_for(mode: DesktopMode) -> Arc<dyn DesktopNotifier> {
    match mode {
        DesktopMode::Disabled => Arc::new(DisabledNotifier),
        DesktopMode::Log => Arc::new(LogNotifier),
        DesktopMode::NotifySend => Arc::new(NotifySendNotifier),
    }
}

/// Always denies permission.
pub struct DisabledNotifier;

impl DesktopNotifier for DisabledNotifier {
    fn request_permission<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async { false })
    }

    fn show<'a>(
        &'a self,
        _record: &'a NotificationRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Grants permission and reports each notification as a tracing event.
pub struct LogNotifier;

impl DesktopNotifier for LogNotifier {
    fn request_permission<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async { true })
    }

    fn show<'a>(
        &'a self,
        record: &'a NotificationRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(
                id = %record.id,
                category = ?record.category,
                title = %record.title,
                "desktop notification"
            );
        })
    }
}

/// Shells out to `notify-send`. Permission is granted when the binary runs.
pub struct NotifySendNotifier;

impl DesktopNotifier for NotifySendNotifier {
    fn request_permission<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async {
            match Command::new("notify-send").arg("--version").output().await {
                Ok(output) if output.status.success() => true,
                Ok(output) => {
                    warn!(status = %output.status, "notify-send unavailable");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "notify-send unavailable");
                    false
                }
            }
        })
    }

    fn show<'a>(
        &'a self,
        record: &'a NotificationRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let result = Command::new("notify-send")
                .arg("--app-name=HealthSync")
                .arg(&record.title)
                .arg(&record.message)
                .status()
                .await;
            match result {
                Ok(status) if status.success() => debug!(id = %record.id, "desktop notification shown"),
                Ok(status) => warn!(id = %record.id, %status, "notify-send failed"),
                Err(e) => warn!(id = %record.id, error = %e, "notify-send failed"),
            }
        })
    }
}
