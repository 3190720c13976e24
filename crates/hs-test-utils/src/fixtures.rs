// fixtures: Deterministic notification records for tests.

use chrono::{TimeZone, Utc};
use hs_protocol::{Correlation, NotificationCategory, NotificationRecord};
use uuid::Uuid;

/// Build a record whose id is `Uuid::from_u128(n)` and whose creation time
/// is `n` minutes after a fixed epoch, so ids and ordering are predictable.
pub fn record(n: u128, category: NotificationCategory, read: bool) -> NotificationRecord {
    let correlation = if category.is_appointment() {
        Some(Correlation {
            appointment_id: Some(n as i64),
            ..Correlation::default()
        })
    } else if category.is_prescription() {
        Some(Correlation {
            prescription_id: Some(n as i64),
            ..Correlation::default()
        })
    } else {
        None
    };
    NotificationRecord {
        id: Uuid::from_u128(n),
        category,
        title: format!("notification {n}"),
        message: format!("body of notification {n}"),
        created_at: Utc
            .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
            .single()
            .expect("fixed epoch is valid")
            + chrono::Duration::minutes(n as i64),
        read,
        correlation,
    }
}

pub fn unread(n: u128) -> NotificationRecord {
    record(n, NotificationCategory::AppointmentReminder, false)
}

pub fn read(n: u128) -> NotificationRecord {
    record(n, NotificationCategory::PrescriptionIssued, true)
}

/// JSON body of a push frame, in the producer's push dialect.
pub fn push_body(record: &NotificationRecord) -> String {
    serde_json::json!({
        "id": record.id,
        "title": record.title,
        "message": record.message,
        "type": record.category,
        "timestamp": record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        "appointmentId": record.appointment_id(),
        "prescriptionId": record.prescription_id(),
        "reminderTime": null,
        "frequency": null,
        "isRead": record.read,
    })
    .to_string()
}
