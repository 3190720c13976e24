// hs-protocol: Notification wire types and serialization.
//
// Two producers emit notification records: the REST snapshot endpoint
// (serialized JPA entities) and the realtime push channel (a hand-built map).
// Their field names differ slightly, so every record goes through a single
// flat wire shape that accepts both dialects.

use chrono::{DateTime, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod stomp;

/// Notification identifier, assigned by the backend.
pub type NotificationId = Uuid;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Closed set of notification kinds emitted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationCategory {
    AppointmentConfirmation,
    AppointmentReminder,
    AppointmentCancellation,
    PrescriptionIssued,
    PrescriptionRefill,
    MedicineReminder,
    SystemAlert,
}

impl NotificationCategory {
    pub fn is_appointment(self) -> bool {
        matches!(
            self,
            Self::AppointmentConfirmation | Self::AppointmentReminder | Self::AppointmentCancellation
        )
    }

    /// Medicine reminders belong to a prescription and navigate there.
    pub fn is_prescription(self) -> bool {
        matches!(
            self,
            Self::PrescriptionIssued | Self::PrescriptionRefill | Self::MedicineReminder
        )
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Schedule attached to medicine reminders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderSchedule {
    pub time: NaiveTime,
    /// E.g. "DAILY", "TWICE_DAILY", "WEEKLY".
    pub frequency: Option<String>,
}

/// Reference to the entity a notification is about.
///
/// Only used for navigation, never for identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub appointment_id: Option<i64>,
    pub prescription_id: Option<i64>,
    pub reminder: Option<ReminderSchedule>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.appointment_id.is_none() && self.prescription_id.is_none() && self.reminder.is_none()
    }
}

/// A single notification as held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NotificationWire", into = "NotificationWire")]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub category: NotificationCategory,
    pub title: String,
    pub message: String,
    /// Assigned by the origin; never modified client-side.
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub correlation: Option<Correlation>,
}

impl NotificationRecord {
    pub fn appointment_id(&self) -> Option<i64> {
        self.correlation.as_ref().and_then(|c| c.appointment_id)
    }

    pub fn prescription_id(&self) -> Option<i64> {
        self.correlation.as_ref().and_then(|c| c.prescription_id)
    }
}

/// Errors produced while decoding a notification payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid notification JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("invalid reminder time '{0}'")]
    ReminderTime(String),
}

/// Decode a single notification from a push frame body.
///
/// Field-level failures surface as their own variants rather than being
/// folded into [`DecodeError::Json`].
pub fn decode_notification(body: &str) -> Result<NotificationRecord, DecodeError> {
    let wire: NotificationWire = serde_json::from_str(body)?;
    NotificationRecord::try_from(wire)
}

/// Flat camelCase shape shared by both producers.
///
/// Snapshots serialize `read` and `createdAt`; push payloads carry `isRead`
/// and `timestamp` (`yyyy-MM-dd HH:mm:ss`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationWire {
    id: Uuid,
    #[serde(rename = "type")]
    category: NotificationCategory,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(alias = "timestamp")]
    created_at: String,
    #[serde(alias = "read", default)]
    is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    appointment_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prescription_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reminder_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frequency: Option<String>,
}

impl TryFrom<NotificationWire> for NotificationRecord {
    type Error = DecodeError;

    fn try_from(wire: NotificationWire) -> Result<Self, Self::Error> {
        let created_at = parse_timestamp(&wire.created_at)?;
        let reminder = match wire.reminder_time {
            Some(ref raw) => Some(ReminderSchedule {
                time: parse_reminder_time(raw)?,
                frequency: wire.frequency.clone(),
            }),
            None => None,
        };
        let correlation = Correlation {
            appointment_id: wire.appointment_id,
            prescription_id: wire.prescription_id,
            reminder,
        };
        Ok(NotificationRecord {
            id: wire.id,
            category: wire.category,
            title: wire.title,
            message: wire.message.unwrap_or_default(),
            created_at,
            read: wire.is_read,
            correlation: (!correlation.is_empty()).then_some(correlation),
        })
    }
}

impl From<NotificationRecord> for NotificationWire {
    fn from(record: NotificationRecord) -> Self {
        let correlation = record.correlation.unwrap_or_default();
        let (reminder_time, frequency) = match correlation.reminder {
            Some(r) => (Some(r.time.format("%H:%M").to_string()), r.frequency),
            None => (None, None),
        };
        NotificationWire {
            id: record.id,
            category: record.category,
            title: record.title,
            message: Some(record.message),
            created_at: record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            is_read: record.read,
            appointment_id: correlation.appointment_id,
            prescription_id: correlation.prescription_id,
            reminder_time,
            frequency,
        }
    }
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse an origin timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DecodeError::Timestamp(raw.to_owned()))
}

fn parse_reminder_time(raw: &str) -> Result<NaiveTime, DecodeError> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| DecodeError::ReminderTime(raw.to_owned()))
}

// ---------------------------------------------------------------------------
// REST envelopes
// ---------------------------------------------------------------------------

/// Response of `GET /notifications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub success: bool,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of every mutation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of the profile endpoint. Only `id` and `role` matter here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Response of `GET /notifications/prescription/{id}/reminders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemindersResponse {
    pub success: bool,
    #[serde(default)]
    pub reminders: Vec<NotificationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound realtime payloads
// ---------------------------------------------------------------------------

/// Diagnostic frame published to `/app/test` right after subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub user_id: i64,
    pub message: String,
    pub timestamp: String,
}

/// Diagnostic notification published to `/app/notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNotification {
    pub user_id: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub category: NotificationCategory,
    pub timestamp: String,
}

/// Error envelope used by all non-2xx control API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
