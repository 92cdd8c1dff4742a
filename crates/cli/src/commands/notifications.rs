// `dentika notifications`: REST-side view of the notification history.

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand, ValueEnum};
use dentika_client::api::ApiClient;
use dentika_client::notifications::{AddOptions, NotificationBackfill, NotificationStore, PageQuery, StoreSettings};
use dentika_common::types::{Notification, NotificationId, ReadFilter};
use serde::Serialize;

use super::{Context, TokenArgs};
use crate::exit_code::NotSignedIn;
use crate::output;

#[derive(Debug, Args)]
pub struct NotificationsArgs {
    #[command(subcommand)]
    command: NotificationsCommand,

    #[command(flatten)]
    token: TokenArgs,
}

#[derive(Debug, Subcommand)]
pub enum NotificationsCommand {
    /// List one page of notifications, newest first.
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Page size; defaults to `[notifications].page_size`.
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, value_enum, default_value_t = FilterArg::All)]
        filter: FilterArg,
    },
    /// Print the server-side unread count.
    UnreadCount,
    /// Mark one notification as read.
    Read { id: String },
    /// Mark every notification as read.
    ReadAll,
    /// Dismiss one notification.
    Dismiss { id: String },
    /// Ask the server to push a test notification.
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    All,
    Unread,
    Read,
}

impl From<FilterArg> for ReadFilter {
    fn from(filter: FilterArg) -> Self {
        match filter {
            FilterArg::All => ReadFilter::All,
            FilterArg::Unread => ReadFilter::Unread,
            FilterArg::Read => ReadFilter::Read,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResult {
    pub page: u32,
    pub total: u64,
    pub unread: usize,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResult {
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct ActionResult {
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

pub async fn run(args: NotificationsArgs, ctx: &Context) -> Result<()> {
    let tokens = args.token.store()?;
    if tokens.get()?.is_none() {
        return Err(NotSignedIn.into());
    }
    let api = ApiClient::new(&ctx.config.api, &ctx.config.health, tokens).context("invalid API configuration")?;

    match args.command {
        NotificationsCommand::List { page, limit, filter } => {
            let settings = StoreSettings::from_config(&ctx.config.notifications);
            let limit = limit.unwrap_or(settings.page_size);
            let query = PageQuery { page, limit, filter: filter.into() };
            let result = list(api, settings, query).await?;
            output::print_output(ctx.format, &result, format_list)?;
        }
        NotificationsCommand::UnreadCount => {
            let count = api.unread_count().await.context("failed to fetch unread count")?;
            output::print_output(ctx.format, &UnreadCountResult { count }, |r| format!("{} unread", r.count))?;
        }
        NotificationsCommand::Read { id } => {
            api.mark_read(&NotificationId::new(id.clone())).await.context("failed to mark notification as read")?;
            print_action(ctx, "read", Some(id))?;
        }
        NotificationsCommand::ReadAll => {
            api.mark_all_read().await.context("failed to mark all notifications as read")?;
            print_action(ctx, "read_all", None)?;
        }
        NotificationsCommand::Dismiss { id } => {
            api.dismiss(&NotificationId::new(id.clone())).await.context("failed to dismiss notification")?;
            print_action(ctx, "dismissed", Some(id))?;
        }
        NotificationsCommand::Test => {
            api.send_test().await.context("failed to request a test notification")?;
            print_action(ctx, "test_sent", None)?;
        }
    }
    Ok(())
}

/// Fetch a page with errors surfaced, then run it through the store's
/// ingestion path so the output matches what a live session would hold.
async fn list<B: NotificationBackfill>(backfill: B, settings: StoreSettings, query: PageQuery) -> Result<ListResult> {
    let page = backfill.fetch_page(query).await.context("failed to list notifications")?;
    let store = NotificationStore::new(backfill, settings);
    for raw in page.notifications.into_iter().rev() {
        store.add_notification(raw, AddOptions::backfill());
    }
    Ok(ListResult {
        page: query.page,
        total: page.pagination.total,
        unread: store.unread_count(),
        notifications: store.notifications(),
    })
}

fn print_action(ctx: &Context, action: &'static str, id: Option<String>) -> Result<()> {
    let result = ActionResult { action, id };
    output::print_output(ctx.format, &result, |r| match &r.id {
        Some(id) => format!("{id}: {}", r.action),
        None => r.action.to_string(),
    })?;
    Ok(())
}

fn format_list(result: &ListResult) -> String {
    if result.notifications.is_empty() {
        return format!("No notifications (page {}).", result.page);
    }
    let mut lines = vec![format!(
        "page {} of {} total, {} unread on this page",
        result.page, result.total, result.unread
    )];
    for notification in &result.notifications {
        let marker = if notification.is_read { ' ' } else { '*' };
        lines.push(format!(
            "{marker} {:>6}  {}  {:<20} {}: {}",
            notification.id.as_str(),
            notification.created_at.format("%Y-%m-%d %H:%M"),
            notification.kind.as_str(),
            notification.title,
            notification.message,
        ));
    }
    lines.join("\n")
}
