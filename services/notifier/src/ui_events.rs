use hs_protocol::{NotificationId, NotificationRecord};
use serde::Serialize;

use crate::state::StateOrigin;
use crate::transport::ConnectionState;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifierUiEvent {
    StatusChanged {
        connection_state: ConnectionState,
        active: bool,
    },
    NotificationsSnapshot {
        notifications: Vec<NotificationRecord>,
        unread_count: u64,
        origin: StateOrigin,
    },
    NotificationAdded {
        notification: NotificationRecord,
    },
    NotificationUpdated {
        notification: NotificationRecord,
    },
    NotificationRemoved {
        id: NotificationId,
    },
    UnreadCountChanged {
        unread_count: u64,
    },
    SurfaceChanged {
        open: bool,
    },
    Navigate {
        path: String,
    },
    LogEntry {
        entry: String,
    },
}

impl NotifierUiEvent {
    /// SSE event name; matches the serialized `type` tag.
    pub fn event_name(&self) -> &'static str {
        match self {
            NotifierUiEvent::StatusChanged { .. } => "status_changed",
            NotifierUiEvent::NotificationsSnapshot { .. } => "notifications_snapshot",
            NotifierUiEvent::NotificationAdded { .. } => "notification_added",
            NotifierUiEvent::NotificationUpdated { .. } => "notification_updated",
            NotifierUiEvent::NotificationRemoved { .. } => "notification_removed",
            NotifierUiEvent::UnreadCountChanged { .. } => "unread_count_changed",
            NotifierUiEvent::SurfaceChanged { .. } => "surface_changed",
            NotifierUiEvent::Navigate { .. } => "navigate",
            NotifierUiEvent::LogEntry { .. } => "log_entry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn status_changed_serializes_with_type_tag() {
        let event = NotifierUiEvent::StatusChanged {
            connection_state: ConnectionState::Connected,
            active: true,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["connection_state"], "connected");
        assert_eq!(json["active"], true);
    }

    #[test]
    fn snapshot_serializes_origin() {
        let event = NotifierUiEvent::NotificationsSnapshot {
            notifications: vec![],
            unread_count: 0,
            origin: StateOrigin::Placeholder,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notifications_snapshot");
        assert_eq!(json["origin"], "placeholder");
        assert_eq!(json["notifications"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn removed_serializes_uuid_string() {
        let event = NotifierUiEvent::NotificationRemoved {
            id: Uuid::from_u128(5),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notification_removed");
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000005");
    }

    #[test]
    fn event_name_matches_type_tag() {
        let events = [
            NotifierUiEvent::UnreadCountChanged { unread_count: 3 },
            NotifierUiEvent::SurfaceChanged { open: true },
            NotifierUiEvent::Navigate {
                path: "/patient/appointments/1".to_owned(),
            },
            NotifierUiEvent::LogEntry {
                entry: "x".to_owned(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_name());
        }
    }
}
