// Local producers: notifications raised by the client itself.

use dentika_common::types::{Notification, NotificationKind, RawNotification};
use serde_json::{json, Value};

use super::{AddOptions, NotificationBackfill, NotificationStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentSummary {
    pub id: u64,
    pub patient_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientSummary {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentUpdateKind {
    Scheduled,
    Cancelled,
    Confirmed,
    Completed,
    Rescheduled,
    Other(String),
}

impl AppointmentUpdateKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "scheduled" => Self::Scheduled,
            "cancelled" => Self::Cancelled,
            "confirmed" => Self::Confirmed,
            "completed" => Self::Completed,
            "rescheduled" => Self::Rescheduled,
            other => Self::Other(other.to_string()),
        }
    }

    fn message(&self, patient: &str) -> String {
        match self {
            Self::Scheduled => format!("New appointment scheduled for {patient}"),
            Self::Cancelled => format!("Appointment with {patient} has been cancelled"),
            Self::Confirmed => format!("Appointment with {patient} has been confirmed"),
            Self::Completed => format!("Appointment with {patient} has been completed"),
            Self::Rescheduled => format!("Appointment with {patient} has been rescheduled"),
            Self::Other(_) => format!("Appointment with {patient} has been updated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientUpdateKind {
    Created,
    Updated,
    Other(String),
}

impl PatientUpdateKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "created" => Self::Created,
            "updated" => Self::Updated,
            other => Self::Other(other.to_string()),
        }
    }

    fn message(&self, first: &str, last: &str) -> String {
        match self {
            Self::Created => format!("New patient {first} {last} has been added"),
            Self::Updated => format!("Patient {first} {last} information has been updated"),
            Self::Other(_) => format!("Patient {first} {last} has been updated"),
        }
    }
}

fn local_raw(kind: NotificationKind, title: &str, message: String, icon: &str, color: &str) -> RawNotification {
    let mut raw = RawNotification::new();
    raw.insert("type".into(), Value::String(kind.as_str().to_string()));
    raw.insert("title".into(), Value::String(title.to_string()));
    raw.insert("message".into(), Value::String(message));
    raw.insert("icon".into(), Value::String(icon.to_string()));
    raw.insert("color".into(), Value::String(color.to_string()));
    raw
}

impl<B: NotificationBackfill> NotificationStore<B> {
    pub fn show_success(&self, message: impl Into<String>) -> Notification {
        let raw = local_raw(NotificationKind::Success, "Success", message.into(), "check-circle", "green");
        self.add_notification(raw, AddOptions::local())
    }

    /// Error toasts stay until dismissed.
    pub fn show_error(&self, message: impl Into<String>) -> Notification {
        let raw = local_raw(NotificationKind::Error, "Error", message.into(), "x-circle", "red");
        self.add_notification(raw, AddOptions::local().sticky())
    }

    pub fn show_warning(&self, message: impl Into<String>) -> Notification {
        let raw = local_raw(NotificationKind::Warning, "Warning", message.into(), "exclamation-triangle", "yellow");
        self.add_notification(raw, AddOptions::local())
    }

    pub fn show_info(&self, message: impl Into<String>) -> Notification {
        let raw = local_raw(NotificationKind::Info, "Information", message.into(), "information-circle", "blue");
        self.add_notification(raw, AddOptions::local())
    }

    pub fn show_appointment_reminder(&self, appointment: &AppointmentSummary, minutes_until: u32) -> Notification {
        let message = format!("{} has an appointment in {minutes_until} minutes", appointment.patient_name);
        let mut raw = local_raw(NotificationKind::AppointmentReminder, "Appointment Reminder", message, "clock", "blue");
        raw.insert("data".into(), json!({ "appointment_id": appointment.id }));
        raw.insert(
            "actions".into(),
            json!([
                { "label": "View", "action": "view-appointment", "payload": { "appointment_id": appointment.id } },
                { "label": "Snooze 5min", "action": "snooze-reminder", "payload": { "minutes": 5 } }
            ]),
        );
        self.add_notification(raw, AddOptions::local().sticky())
    }

    pub fn show_appointment_update(
        &self,
        appointment: &AppointmentSummary,
        update: &AppointmentUpdateKind,
    ) -> Notification {
        let color = if *update == AppointmentUpdateKind::Cancelled { "red" } else { "blue" };
        let message = update.message(&appointment.patient_name);
        let mut raw = local_raw(NotificationKind::AppointmentUpdate, "Appointment Update", message, "calendar", color);
        raw.insert("data".into(), json!({ "appointment_id": appointment.id }));
        raw.insert(
            "actions".into(),
            json!([{ "label": "View", "action": "view-appointment", "payload": { "appointment_id": appointment.id } }]),
        );
        self.add_notification(raw, AddOptions::local())
    }

    pub fn show_patient_update(&self, patient: &PatientSummary, update: &PatientUpdateKind) -> Notification {
        let message = update.message(&patient.first_name, &patient.last_name);
        let mut raw = local_raw(NotificationKind::PatientUpdate, "Patient Update", message, "user", "green");
        raw.insert("data".into(), json!({ "patient_id": patient.id }));
        raw.insert(
            "actions".into(),
            json!([{ "label": "View", "action": "view-patient", "payload": { "patient_id": patient.id } }]),
        );
        self.add_notification(raw, AddOptions::local())
    }
}
