//! Navigation targets produced by clicking a notification.

use std::fmt;
use std::str::FromStr;

use hs_protocol::NotificationRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            _ => Err(()),
        }
    }
}

/// A route in the front end, scoped by the viewer's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Appointment { role: Role, appointment_id: i64 },
    Prescription { role: Role, prescription_id: i64 },
}

impl Route {
    /// Where clicking `record` leads, if anywhere.
    ///
    /// Appointment kinds need an appointment id and prescription kinds
    /// (including medicine reminders) need a prescription id. System alerts
    /// never navigate.
    pub fn for_record(record: &NotificationRecord, role: Role) -> Option<Route> {
        if record.category.is_appointment() {
            record
                .appointment_id()
                .map(|appointment_id| Route::Appointment {
                    role,
                    appointment_id,
                })
        } else if record.category.is_prescription() {
            record
                .prescription_id()
                .map(|prescription_id| Route::Prescription {
                    role,
                    prescription_id,
                })
        } else {
            None
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Appointment {
                role,
                appointment_id,
            } => format!("/{role}/appointments/{appointment_id}"),
            Route::Prescription {
                role,
                prescription_id,
            } => format!("/{role}/prescriptions/{prescription_id}"),
        }
    }
}

impl Serialize for Route {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path())
    }
}
