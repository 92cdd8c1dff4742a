// Bus subject naming.
//
// Subjects are dot-separated hierarchies under a deployment prefix:
//   <prefix>.user.<id>.{notifications,appointments,patients}
//   <prefix>.clinic.<id>.{notifications,appointments,patients}
//   <prefix>.system.{notifications,alerts}
//   <prefix>.heartbeat

use thiserror::Error;

use crate::types::Identity;

pub const DEFAULT_PREFIX: &str = "dentika";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,
    #[error("subject `{0}` contains an empty token")]
    EmptyToken(String),
    #[error("subject `{0}` contains whitespace")]
    Whitespace(String),
}

/// Check that a subject can be sent on the wire.
///
/// Wildcards (`*`, `>`) are allowed since they are valid in SUB.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace(subject.to_string()));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(SubjectError::EmptyToken(subject.to_string()));
    }
    Ok(())
}

/// Whether a concrete subject matches a subscription pattern.
///
/// `*` matches exactly one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// What a bootstrap subject carries, used to pick a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    UserNotifications,
    UserAppointments,
    UserPatients,
    ClinicNotifications,
    ClinicAppointments,
    ClinicPatients,
    SystemNotifications,
    SystemAlerts,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserNotifications => "user_notifications",
            Self::UserAppointments => "user_appointments",
            Self::UserPatients => "user_patients",
            Self::ClinicNotifications => "clinic_notifications",
            Self::ClinicAppointments => "clinic_appointments",
            Self::ClinicPatients => "clinic_patients",
            Self::SystemNotifications => "system_notifications",
            Self::SystemAlerts => "system_alerts",
        }
    }
}

/// A subject the client subscribes to on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSubject {
    pub subject: String,
    pub channel: Channel,
}

/// Subject builder bound to a deployment prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    prefix: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Subjects {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn user_notifications(&self, user_id: &str) -> String {
        format!("{}.user.{user_id}.notifications", self.prefix)
    }

    pub fn user_appointments(&self, user_id: &str) -> String {
        format!("{}.user.{user_id}.appointments", self.prefix)
    }

    pub fn user_patients(&self, user_id: &str) -> String {
        format!("{}.user.{user_id}.patients", self.prefix)
    }

    pub fn clinic_notifications(&self, clinic_id: &str) -> String {
        format!("{}.clinic.{clinic_id}.notifications", self.prefix)
    }

    pub fn clinic_appointments(&self, clinic_id: &str) -> String {
        format!("{}.clinic.{clinic_id}.appointments", self.prefix)
    }

    pub fn clinic_patients(&self, clinic_id: &str) -> String {
        format!("{}.clinic.{clinic_id}.patients", self.prefix)
    }

    pub fn system_notifications(&self) -> String {
        format!("{}.system.notifications", self.prefix)
    }

    pub fn system_alerts(&self) -> String {
        format!("{}.system.alerts", self.prefix)
    }

    pub fn heartbeat(&self) -> String {
        format!("{}.heartbeat", self.prefix)
    }

    /// Fixed subscription set for an authenticated identity.
    pub fn bootstrap(&self, identity: &Identity) -> Vec<BootstrapSubject> {
        let user = identity.user_id.as_str();
        let mut subjects = vec![
            BootstrapSubject {
                subject: self.user_notifications(user),
                channel: Channel::UserNotifications,
            },
            BootstrapSubject {
                subject: self.user_appointments(user),
                channel: Channel::UserAppointments,
            },
            BootstrapSubject { subject: self.user_patients(user), channel: Channel::UserPatients },
        ];

        if let Some(clinic) = identity.clinic_id.as_deref() {
            subjects.extend([
                BootstrapSubject {
                    subject: self.clinic_notifications(clinic),
                    channel: Channel::ClinicNotifications,
                },
                BootstrapSubject {
                    subject: self.clinic_appointments(clinic),
                    channel: Channel::ClinicAppointments,
                },
                BootstrapSubject {
                    subject: self.clinic_patients(clinic),
                    channel: Channel::ClinicPatients,
                },
            ]);
        }

        subjects.extend([
            BootstrapSubject {
                subject: self.system_notifications(),
                channel: Channel::SystemNotifications,
            },
            BootstrapSubject { subject: self.system_alerts(), channel: Channel::SystemAlerts },
        ]);
        subjects
    }
}
