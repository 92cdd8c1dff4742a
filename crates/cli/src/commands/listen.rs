// `dentika listen`: stream bus traffic for one user until interrupted.

use anyhow::Result;
use clap::Args;
use dentika_client::realtime::{ConnectionEvent, DisconnectReason};
use dentika_client::runtime::{DomainEvent, NotificationPipeline};
use dentika_common::types::{Identity, Notification, RawNotification};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{Context, TokenArgs};
use crate::exit_code::NotSignedIn;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// User whose subjects to follow.
    #[arg(long)]
    user: String,

    /// Clinic affiliation; adds the clinic subjects.
    #[arg(long)]
    clinic: Option<String>,

    /// Exit after this many bus events.
    #[arg(long)]
    count: Option<usize>,

    #[command(flatten)]
    token: TokenArgs,
}

/// One line of `listen` output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ListenLine {
    Backfill { stored: usize, unread: usize, remote_unread: Option<u64> },
    Connection { state: &'static str, detail: Option<String> },
    Notification { channel: &'static str, notification: Notification },
    AppointmentUpdated { payload: Map<String, Value> },
    AppointmentReminder { payload: Map<String, Value> },
    PatientUpdated { payload: Map<String, Value> },
    SystemNotification { payload: RawNotification },
    SystemAlert { payload: RawNotification },
}

impl From<DomainEvent> for ListenLine {
    fn from(event: DomainEvent) -> Self {
        match event {
            DomainEvent::Notification { channel, notification } => {
                Self::Notification { channel: channel.as_str(), notification }
            }
            DomainEvent::AppointmentUpdated(payload) => Self::AppointmentUpdated { payload },
            DomainEvent::AppointmentReminder(payload) => Self::AppointmentReminder { payload },
            DomainEvent::PatientUpdated(payload) => Self::PatientUpdated { payload },
            DomainEvent::SystemNotification(payload) => Self::SystemNotification { payload },
            DomainEvent::SystemAlert(payload) => Self::SystemAlert { payload },
        }
    }
}

impl From<&ConnectionEvent> for ListenLine {
    fn from(event: &ConnectionEvent) -> Self {
        let (state, detail) = match event {
            ConnectionEvent::Connected => ("connected", None),
            ConnectionEvent::ConnectFailed { error } => ("connect_failed", Some(error.clone())),
            ConnectionEvent::Disconnected { reason: DisconnectReason::ClientRequested } => ("disconnected", None),
            ConnectionEvent::Disconnected { reason: DisconnectReason::Transport(reason) } => {
                ("disconnected", Some(reason.clone()))
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                ("reconnect_scheduled", Some(format!("attempt {attempt} in {}ms", delay.as_millis())))
            }
            ConnectionEvent::ReconnectAbandoned { attempts } => {
                ("reconnect_abandoned", Some(format!("gave up after {attempts} attempts")))
            }
        };
        Self::Connection { state, detail }
    }
}

pub async fn run(args: ListenArgs, ctx: &Context) -> Result<()> {
    let tokens = args.token.store()?;
    if tokens.get()?.is_none() {
        return Err(NotSignedIn.into());
    }

    let pipeline = NotificationPipeline::from_config(&ctx.config, tokens)?;
    let mut events = pipeline.events();
    let mut connection = pipeline.realtime().events();

    let mut identity = Identity::new(args.user);
    if let Some(clinic) = args.clinic {
        identity = identity.with_clinic(clinic);
    }
    pipeline.start(identity).await?;

    if !pipeline.realtime().is_connected() {
        output::print_warning(
            ctx.format,
            "BUS_UNREACHABLE",
            &format!("realtime bus at {} unreachable, retrying in the background", pipeline.realtime().settings().endpoint),
        );
    }

    let store = pipeline.store();
    emit(
        ctx.format,
        &ListenLine::Backfill {
            stored: store.len(),
            unread: store.unread_count(),
            remote_unread: store.remote_unread_count(),
        },
    )?;

    let mut seen = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    emit(ctx.format, &ListenLine::from(event))?;
                    seen += 1;
                    if args.count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "listener fell behind, events dropped"),
                Err(RecvError::Closed) => break,
            },
            event = connection.recv() => match event {
                Ok(event) => emit(ctx.format, &ListenLine::from(&event))?,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    pipeline.realtime().disconnect().await;
    Ok(())
}

fn emit(format: OutputFormat, line: &ListenLine) -> Result<()> {
    output::print_output(format, line, format_human)?;
    Ok(())
}

fn format_human(line: &ListenLine) -> String {
    match line {
        ListenLine::Backfill { stored, unread, remote_unread } => match remote_unread {
            Some(remote) => format!("{stored} stored notifications, {unread} unread ({remote} unread on server)"),
            None => format!("{stored} stored notifications, {unread} unread"),
        },
        ListenLine::Connection { state, detail: Some(detail) } => format!("-- {state}: {detail}"),
        ListenLine::Connection { state, detail: None } => format!("-- {state}"),
        ListenLine::Notification { channel, notification } => {
            let marker = if notification.is_read { ' ' } else { '*' };
            format!(
                "{marker} [{channel}] {} {}: {}",
                notification.kind.as_str(),
                notification.title,
                notification.message
            )
        }
        ListenLine::AppointmentUpdated { payload } => format!("appointment updated {}", Value::Object(payload.clone())),
        ListenLine::AppointmentReminder { payload } => format!("appointment reminder {}", Value::Object(payload.clone())),
        ListenLine::PatientUpdated { payload } => format!("patient updated {}", Value::Object(payload.clone())),
        ListenLine::SystemNotification { payload } => format!("system: {}", summary(payload)),
        ListenLine::SystemAlert { payload } => format!("ALERT: {}", summary(payload)),
    }
}

fn summary(payload: &RawNotification) -> String {
    let text = |key: &str| payload.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    match (text("title"), text("message")) {
        (title, message) if !title.is_empty() && !message.is_empty() => format!("{title}: {message}"),
        (title, _) if !title.is_empty() => title,
        (_, message) if !message.is_empty() => message,
        _ => Value::Object(payload.clone()).to_string(),
    }
}
