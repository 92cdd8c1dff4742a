pub mod health;
pub mod listen;
pub mod notifications;
pub mod publish;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use dentika_client::auth::{FileTokenStore, MemoryTokenStore, TokenStore};
use dentika_client::config::ClientConfig;

use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum Command {
    /// Stream notifications and bus events for a user.
    Listen(listen::ListenArgs),
    /// Publish a notification on the realtime bus.
    Publish(publish::PublishArgs),
    /// Probe the API server's health endpoint.
    Health(health::HealthArgs),
    /// Inspect and update stored notifications over the REST API.
    Notifications(notifications::NotificationsArgs),
    /// Store an auth token for later commands.
    Login(session::LoginArgs),
    /// Sign out and forget the stored token.
    Logout,
}

/// Per-invocation settings shared by every command.
pub struct Context {
    pub format: OutputFormat,
    pub config: ClientConfig,
}

/// Token override shared by commands that talk to the server.
#[derive(Debug, Default, Args)]
pub struct TokenArgs {
    /// Bearer token; takes precedence over the stored one.
    #[arg(long, env = "DENTIKA_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl TokenArgs {
    pub fn store(&self) -> Result<Arc<dyn TokenStore>> {
        match &self.token {
            Some(token) => Ok(Arc::new(MemoryTokenStore::with_token(token.clone()))),
            None => Ok(Arc::new(FileTokenStore::default_location()?)),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ClientConfig::load()),
    }
}

pub async fn run(command: Command, ctx: Context) -> Result<()> {
    match command {
        Command::Listen(args) => listen::run(args, &ctx).await,
        Command::Publish(args) => publish::run(args, &ctx).await,
        Command::Health(args) => health::run(args, &ctx).await,
        Command::Notifications(args) => notifications::run(args, &ctx).await,
        Command::Login(args) => session::login(args, &ctx).await,
        Command::Logout => session::logout(&ctx).await,
    }
}
