// Core domain types shared across all Dentika crates.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Untyped notification object as it arrives from the bus or the REST API.
pub type RawNotification = Map<String, Value>;

/// Opaque notification identifier, stable across realtime, API and local sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh id for a notification produced on this client.
    pub fn local() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    /// Server ids are numeric, bus payloads may carry them as strings.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for NotificationId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Notification category. Unknown server-side kinds are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
    #[default]
    Info,
    AppointmentReminder,
    AppointmentUpdate,
    PatientUpdate,
    SystemAlert,
    ClinicAnnouncement,
    PeerReviewUpdate,
    InventoryAlert,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::AppointmentReminder => "appointment_reminder",
            Self::AppointmentUpdate => "appointment_update",
            Self::PatientUpdate => "patient_update",
            Self::SystemAlert => "system_alert",
            Self::ClinicAnnouncement => "clinic_announcement",
            Self::PeerReviewUpdate => "peer_review_update",
            Self::InventoryAlert => "inventory_alert",
            Self::Other(other) => other,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "info" => Self::Info,
            "appointment_reminder" => Self::AppointmentReminder,
            "appointment_update" => Self::AppointmentUpdate,
            "patient_update" => Self::PatientUpdate,
            "system_alert" => Self::SystemAlert,
            "clinic_announcement" => Self::ClinicAnnouncement,
            "peer_review_update" => Self::PeerReviewUpdate,
            "inventory_alert" => Self::InventoryAlert,
            other => Self::Other(other.to_string()),
        }
    }

    /// Icon shown when the producer did not pick one.
    pub fn default_icon(&self) -> &'static str {
        match self {
            Self::Success => "check-circle",
            Self::Error => "x-circle",
            Self::Warning | Self::SystemAlert => "exclamation-triangle",
            Self::AppointmentReminder => "clock",
            Self::AppointmentUpdate => "calendar",
            Self::PatientUpdate => "user",
            Self::ClinicAnnouncement => "megaphone",
            Self::PeerReviewUpdate => "users",
            Self::InventoryAlert => "box",
            Self::Info | Self::Other(_) => "information-circle",
        }
    }

    pub fn default_color(&self) -> &'static str {
        match self {
            Self::Success | Self::PatientUpdate => "green",
            Self::Error | Self::SystemAlert => "red",
            Self::Warning | Self::InventoryAlert => "yellow",
            Self::AppointmentUpdate | Self::PeerReviewUpdate => "purple",
            Self::Info
            | Self::AppointmentReminder
            | Self::ClinicAnnouncement
            | Self::Other(_) => "blue",
        }
    }
}

impl From<String> for NotificationKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<NotificationKind> for String {
    fn from(value: NotificationKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer handed a notification to the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Realtime,
    Api,
    Local,
}

impl NotificationSource {
    /// Whether the server knows about notifications from this source.
    pub fn is_server_known(self) -> bool {
        matches!(self, Self::Realtime | Self::Api)
    }
}

/// A UI action attached to a notification (e.g. "View", "Snooze 5min").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationAction {
    pub label: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl NotificationAction {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
            url: None,
            method: None,
            payload: None,
            style: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A unit of user-facing information held by the notification store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub source: NotificationSource,
    pub show_as_toast: bool,
    pub dismissed_from_toast: bool,
    pub icon: String,
    pub color: String,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Notification {
    /// Normalize an untyped object into a notification.
    ///
    /// Missing fields fall back to: generated local id, `info` kind,
    /// `created_at = now`, unread. Server payloads use `type`, `created_at`,
    /// `is_read` and `data`; locally built objects may use `kind`,
    /// `timestamp`, `read` and `payload` instead.
    pub fn from_raw(raw: &RawNotification, source: NotificationSource, now: DateTime<Utc>) -> Self {
        let id = raw.get("id").and_then(NotificationId::from_json).unwrap_or_else(NotificationId::local);
        let kind = string_field(raw, &["type", "kind"])
            .map(NotificationKind::parse)
            .unwrap_or_default();
        let created_at = ["created_at", "createdAt", "timestamp"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(parse_timestamp))
            .unwrap_or(now);
        let is_read = ["is_read", "isRead", "read"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(Value::as_bool))
            .unwrap_or(false);
        let icon = string_field(raw, &["icon"])
            .filter(|icon| !icon.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| kind.default_icon().to_string());
        let color = string_field(raw, &["color"])
            .filter(|color| !color.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| kind.default_color().to_string());
        let actions = raw
            .get("actions")
            .and_then(embedded_json::<Vec<NotificationAction>>)
            .unwrap_or_default();
        let payload = ["data", "payload"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(embedded_json::<Map<String, Value>>))
            .unwrap_or_default();

        Self {
            id,
            title: string_field(raw, &["title"]).unwrap_or_default().to_string(),
            message: string_field(raw, &["message"]).unwrap_or_default().to_string(),
            kind,
            created_at,
            is_read,
            source,
            show_as_toast: false,
            dismissed_from_toast: false,
            icon,
            color,
            actions,
            payload,
        }
    }

    /// Whether the toast projection should currently show this entry.
    pub fn is_toast_visible(&self) -> bool {
        self.show_as_toast && !self.dismissed_from_toast
    }
}

fn string_field<'a>(raw: &'a RawNotification, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| raw.get(*key).and_then(Value::as_str))
}

/// The server stores `data` and `actions` as JSON text columns, so they may
/// arrive either as structured JSON or as a string holding JSON.
fn embedded_json<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    match value {
        Value::String(text) => serde_json::from_str(text).ok(),
        Value::Null => None,
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Authenticated user as far as the realtime pipeline cares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), clinic_id: None }
    }

    pub fn with_clinic(mut self, clinic_id: impl Into<String>) -> Self {
        self.clinic_id = Some(clinic_id.into());
        self
    }
}

/// Read-state filter accepted by the notification list endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadFilter {
    #[default]
    All,
    Unread,
    Read,
}

impl ReadFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Unread => "unread",
            Self::Read => "read",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawNotification {
        value.as_object().cloned().expect("test value should be an object")
    }

    #[test]
    fn from_raw_reads_server_shape() {
        let now = Utc::now();
        let n = Notification::from_raw(
            &raw(json!({
                "id": 42,
                "title": "Appointment Update",
                "message": "Jane Doe has been confirmed",
                "type": "appointment_update",
                "created_at": "2026-03-01T10:00:00Z",
                "is_read": true,
                "data": { "appointment_id": 7 },
                "actions": [{ "label": "View", "action": "view-appointment" }]
            })),
            NotificationSource::Api,
            now,
        );

        assert_eq!(n.id, NotificationId::from(42));
        assert_eq!(n.kind, NotificationKind::AppointmentUpdate);
        assert_eq!(n.created_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
        assert!(n.is_read);
        assert_eq!(n.icon, "calendar");
        assert_eq!(n.color, "purple");
        assert_eq!(n.payload.get("appointment_id"), Some(&json!(7)));
        assert_eq!(n.actions.len(), 1);
        assert_eq!(n.source, NotificationSource::Api);
    }

    #[test]
    fn from_raw_applies_defaults() {
        let now = Utc::now();
        let n = Notification::from_raw(&raw(json!({ "message": "hi" })), NotificationSource::Local, now);

        assert!(n.id.is_local());
        assert_eq!(n.kind, NotificationKind::Info);
        assert_eq!(n.created_at, now);
        assert!(!n.is_read);
        assert_eq!(n.title, "");
        assert_eq!(n.icon, "information-circle");
    }

    #[test]
    fn from_raw_accepts_epoch_millis_and_read_alias() {
        let n = Notification::from_raw(
            &raw(json!({ "id": "abc", "timestamp": 1_700_000_000_000_i64, "read": true })),
            NotificationSource::Local,
            Utc::now(),
        );
        assert_eq!(n.id.as_str(), "abc");
        assert_eq!(n.created_at.timestamp_millis(), 1_700_000_000_000);
        assert!(n.is_read);
    }

    #[test]
    fn from_raw_decodes_json_text_columns() {
        let n = Notification::from_raw(
            &raw(json!({
                "id": 9,
                "data": "{\"patient_id\":12}",
                "actions": "[{\"label\":\"View\",\"action\":\"view-patient\"}]"
            })),
            NotificationSource::Api,
            Utc::now(),
        );
        assert_eq!(n.payload.get("patient_id"), Some(&json!(12)));
        assert_eq!(n.actions[0].action, "view-patient");
    }

    #[test]
    fn unknown_kind_roundtrips_verbatim() {
        let kind: NotificationKind = serde_json::from_value(json!("lab_result")).unwrap();
        assert_eq!(kind, NotificationKind::Other("lab_result".into()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("lab_result"));
        assert_eq!(kind.default_color(), "blue");
    }

    #[test]
    fn explicit_icon_wins_over_default() {
        let n = Notification::from_raw(
            &raw(json!({ "type": "error", "icon": "bell", "color": "" })),
            NotificationSource::Realtime,
            Utc::now(),
        );
        assert_eq!(n.icon, "bell");
        assert_eq!(n.color, "red");
    }

    #[test]
    fn source_server_known() {
        assert!(NotificationSource::Api.is_server_known());
        assert!(NotificationSource::Realtime.is_server_known());
        assert!(!NotificationSource::Local.is_server_known());
    }
}
