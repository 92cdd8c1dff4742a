// `dentika publish`: push one notification onto the realtime bus.

use anyhow::Result;
use clap::{Args, ValueEnum};
use dentika_client::realtime::nats_ws::NatsWsConnector;
use dentika_client::realtime::{ConnectionEvent, ConnectionManager, Credentials, RealtimeSettings};
use dentika_common::types::Identity;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::{Context, TokenArgs};
use crate::exit_code::{BusUnavailable, NotSignedIn, UsageError};
use crate::output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    User,
    Clinic,
    System,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Who receives the notification.
    #[arg(value_enum)]
    target: Target,

    /// Recipient user or clinic id. Not used for system notifications.
    #[arg(long)]
    to: Option<String>,

    #[arg(long)]
    title: String,

    #[arg(long)]
    message: String,

    /// Notification type, e.g. info, warning, appointment_update.
    #[arg(long, default_value = "info")]
    kind: String,

    /// User the publishing session authenticates as.
    #[arg(long)]
    user: String,

    #[command(flatten)]
    token: TokenArgs,
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub subject: String,
    pub published: bool,
}

pub async fn run(args: PublishArgs, ctx: &Context) -> Result<()> {
    let recipient = recipient(args.target, args.to.as_deref())?;
    let token = args.token.store()?.get()?.ok_or(NotSignedIn)?;

    let manager = ConnectionManager::new(
        NatsWsConnector::new(),
        RealtimeSettings::from_config(&ctx.config.realtime, &ctx.config.api),
    );
    let endpoint = manager.settings().endpoint.clone();
    let mut events = manager.events();

    manager.initialize(Credentials::new(token, Identity::new(args.user))).await;
    if !manager.is_connected() {
        let reason = connect_failure(&mut events).unwrap_or_else(|| "no session".to_string());
        manager.disconnect().await;
        return Err(BusUnavailable { endpoint, reason }.into());
    }

    let notification = payload(&args.title, &args.message, &args.kind);
    let subjects = manager.subjects().clone();
    let (subject, published) = match (args.target, recipient) {
        (Target::User, Some(user)) => {
            (subjects.user_notifications(user), manager.publish_user_notification(user, &notification).await)
        }
        (Target::Clinic, Some(clinic)) => {
            (subjects.clinic_notifications(clinic), manager.publish_clinic_notification(clinic, &notification).await)
        }
        _ => (subjects.system_notifications(), manager.publish_system_notification(&notification).await),
    };
    manager.disconnect().await;

    if !published {
        anyhow::bail!("publish to {subject} failed");
    }
    let result = PublishResult { subject, published };
    output::print_output(ctx.format, &result, |r| format!("published to {}", r.subject))?;
    Ok(())
}

fn recipient(target: Target, to: Option<&str>) -> Result<Option<&str>, UsageError> {
    match (target, to) {
        (Target::System, _) => Ok(None),
        (_, Some(id)) if !id.trim().is_empty() => Ok(Some(id)),
        (Target::User, _) => Err(UsageError("--to <user id> is required for user notifications".into())),
        (Target::Clinic, _) => Err(UsageError("--to <clinic id> is required for clinic notifications".into())),
    }
}

fn connect_failure(events: &mut broadcast::Receiver<ConnectionEvent>) -> Option<String> {
    let mut reason = None;
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::ConnectFailed { error } = event {
            reason = Some(error);
        }
    }
    reason
}

fn payload(title: &str, message: &str, kind: &str) -> Value {
    json!({ "title": title, "message": message, "type": kind })
}
