//! The authoritative notification set and its unread count.
//!
//! Every write goes through `replace_snapshot`, `merge_push` or `apply`, and
//! each of them keeps `unread_count == records where !read` and id
//! uniqueness true on return.

use std::collections::HashSet;

use chrono::{Duration, NaiveTime, Utc};
use hs_protocol::{
    Correlation, NotificationCategory, NotificationId, NotificationRecord, ReminderSchedule,
};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Where the current set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOrigin {
    Empty,
    Server,
    Placeholder,
}

/// A user-initiated change, applied identically whether or not the server
/// accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    MarkRead(NotificationId),
    MarkAllRead,
    Delete(NotificationId),
    ClearAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    /// An existing record with the same id was replaced and moved to the front.
    Replaced,
}

#[derive(Debug, Clone)]
pub struct NotificationState {
    records: Vec<NotificationRecord>,
    unread_count: u64,
    origin: StateOrigin,
}

impl Default for NotificationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationState {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            unread_count: 0,
            origin: StateOrigin::Empty,
        }
    }

    /// Newest first.
    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    pub fn origin(&self) -> StateOrigin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: NotificationId) -> Option<&NotificationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Replace the whole set. Order is kept as given; a repeated id keeps its
    /// first occurrence. The unread count is recomputed from the records and
    /// `reported_unread` is only compared against it.
    pub fn replace_snapshot(
        &mut self,
        records: Vec<NotificationRecord>,
        reported_unread: Option<u64>,
        origin: StateOrigin,
    ) {
        let mut seen = HashSet::with_capacity(records.len());
        let before = records.len();
        self.records = records.into_iter().filter(|r| seen.insert(r.id)).collect();
        if self.records.len() != before {
            warn!(
                dropped = before - self.records.len(),
                "snapshot contained duplicate ids"
            );
        }
        self.unread_count = self.records.iter().filter(|r| !r.read).count() as u64;
        if let Some(reported) = reported_unread.filter(|r| *r != self.unread_count) {
            warn!(
                reported,
                computed = self.unread_count,
                "snapshot unread count disagrees with records"
            );
        }
        self.origin = origin;
    }

    /// Prepend a pushed record, replacing any record with the same id.
    pub fn merge_push(&mut self, record: NotificationRecord) -> MergeOutcome {
        let previous = self
            .records
            .iter()
            .position(|r| r.id == record.id)
            .map(|idx| self.records.remove(idx));

        if previous.as_ref().is_some_and(|old| !old.read) {
            self.unread_count = self.unread_count.saturating_sub(1);
        }
        if !record.read {
            self.unread_count += 1;
        }
        self.records.insert(0, record);

        match previous {
            Some(_) => MergeOutcome::Replaced,
            None => MergeOutcome::Added,
        }
    }

    /// Apply a mutation. Returns true if anything changed.
    pub fn apply(&mut self, mutation: Mutation) -> bool {
        match mutation {
            Mutation::MarkRead(id) => match self.records.iter_mut().find(|r| r.id == id) {
                Some(record) if !record.read => {
                    record.read = true;
                    self.unread_count = self.unread_count.saturating_sub(1);
                    true
                }
                _ => false,
            },
            Mutation::MarkAllRead => {
                let changed = self.records.iter().any(|r| !r.read);
                for record in &mut self.records {
                    record.read = true;
                }
                self.unread_count = 0;
                changed
            }
            Mutation::Delete(id) => match self.records.iter().position(|r| r.id == id) {
                Some(idx) => {
                    let removed = self.records.remove(idx);
                    if !removed.read {
                        self.unread_count = self.unread_count.saturating_sub(1);
                    }
                    true
                }
                None => false,
            },
            Mutation::ClearAll => {
                let changed = !self.records.is_empty();
                self.records.clear();
                self.unread_count = 0;
                changed
            }
        }
    }

    /// Both invariants: the unread count matches and ids are unique.
    pub fn is_consistent(&self) -> bool {
        let unread = self.records.iter().filter(|r| !r.read).count() as u64;
        let mut ids = HashSet::with_capacity(self.records.len());
        unread == self.unread_count && self.records.iter().all(|r| ids.insert(r.id))
    }
}

pub const PLACEHOLDER_REMINDER_ID: Uuid = Uuid::from_u128(0x123e4567_e89b_12d3_a456_426614174000);
pub const PLACEHOLDER_APPOINTMENT_ID: Uuid =
    Uuid::from_u128(0x123e4567_e89b_12d3_a456_426614174001);

/// The fixed set shown when the bootstrap snapshot cannot be fetched.
pub fn placeholder_set() -> Vec<NotificationRecord> {
    let now = Utc::now();
    vec![
        NotificationRecord {
            id: PLACEHOLDER_REMINDER_ID,
            category: NotificationCategory::MedicineReminder,
            title: "Medicine Reminder: Aspirin".to_owned(),
            message: "Time to take your medicine: Aspirin. Dosage: 1 tablet. Frequency: DAILY"
                .to_owned(),
            created_at: now,
            read: false,
            correlation: Some(Correlation {
                appointment_id: None,
                prescription_id: Some(1),
                reminder: NaiveTime::from_hms_opt(8, 0, 0).map(|time| ReminderSchedule {
                    time,
                    frequency: Some("DAILY".to_owned()),
                }),
            }),
        },
        NotificationRecord {
            id: PLACEHOLDER_APPOINTMENT_ID,
            category: NotificationCategory::AppointmentConfirmation,
            title: "Appointment Confirmed".to_owned(),
            message: "Your appointment with Dr. Smith has been confirmed for tomorrow at 10:00 AM."
                .to_owned(),
            created_at: now - Duration::hours(1),
            read: false,
            correlation: Some(Correlation {
                appointment_id: Some(1),
                ..Correlation::default()
            }),
        },
    ]
}
