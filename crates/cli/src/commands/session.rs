// `dentika login` / `dentika logout`.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use dentika_client::api::{ApiClient, ApiError};
use dentika_client::auth::{FileTokenStore, TokenStore};
use dentika_client::notifications::NotificationBackfill;
use serde::Serialize;
use tracing::warn;

use super::Context;
use crate::output;

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Bearer token issued by the Dentika server.
    #[arg(long, env = "DENTIKA_TOKEN", hide_env_values = true)]
    token: String,

    /// Store the token without checking it against the server.
    #[arg(long)]
    no_verify: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionResult {
    pub signed_in: bool,
    pub token_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<u64>,
}

pub async fn login(args: LoginArgs, ctx: &Context) -> Result<()> {
    let store = Arc::new(FileTokenStore::default_location()?);
    let token = args.token.trim();
    if token.is_empty() {
        anyhow::bail!(crate::exit_code::UsageError("token must not be empty".into()));
    }
    store.set(token)?;

    let unread = if args.no_verify {
        None
    } else {
        let api = ApiClient::new(&ctx.config.api, &ctx.config.health, store.clone())
            .context("invalid API configuration")?;
        match api.unread_count().await {
            Ok(count) => Some(count),
            Err(error @ ApiError::Unauthorized(_)) => {
                store.remove()?;
                return Err(error).context("server rejected the token");
            }
            Err(error) => return Err(error).context("could not verify the token"),
        }
    };

    let result = SessionResult { signed_in: true, token_path: store.path().display().to_string(), unread };
    output::print_output(ctx.format, &result, |r| match r.unread {
        Some(unread) => format!("Signed in ({unread} unread notifications)."),
        None => "Token stored.".to_string(),
    })?;
    Ok(())
}

pub async fn logout(ctx: &Context) -> Result<()> {
    let store = Arc::new(FileTokenStore::default_location()?);
    if store.get()?.is_some() {
        let api = ApiClient::new(&ctx.config.api, &ctx.config.health, store.clone())
            .context("invalid API configuration")?;
        if let Err(error) = api.logout().await {
            warn!(error = %error, "server-side logout failed, removing local token anyway");
        }
    }
    store.remove()?;

    let result = SessionResult { signed_in: false, token_path: store.path().display().to_string(), unread: None };
    output::print_output(ctx.format, &result, |_| "Signed out.".to_string())?;
    Ok(())
}
