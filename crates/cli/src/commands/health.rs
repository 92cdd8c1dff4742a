// `dentika health`: probe the API server the way the health monitor does.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;
use dentika_client::api::{ApiClient, ApiError};
use dentika_client::auth::MemoryTokenStore;
use dentika_client::health::{ConnectionHealthMonitor, HealthProbe, HealthSettings, HealthState};
use serde::Serialize;

use super::Context;
use crate::output;

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Keep probing until the server answers or the retry budget is spent.
    #[arg(long)]
    wait: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub endpoint: String,
    pub status: &'static str,
    pub server_reachable: bool,
    pub consecutive_failures: u32,
    pub show_overlay: bool,
    pub last_checked_at: Option<String>,
}

impl HealthReport {
    fn new(endpoint: String, state: &HealthState, max_retries: u32) -> Self {
        Self {
            endpoint,
            status: state.status().as_str(),
            server_reachable: state.server_reachable,
            consecutive_failures: state.consecutive_failures,
            show_overlay: state.should_show_overlay(max_retries),
            last_checked_at: state.last_checked_at.map(|at| at.to_rfc3339()),
        }
    }
}

pub async fn run(args: HealthArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let api = ApiClient::new(&config.api, &config.health, Arc::new(MemoryTokenStore::new()))
        .context("invalid API configuration")?;
    let endpoint = format!("{}{}", api.base_url(), config.health.probe_path);
    let settings = HealthSettings::from_config(&config.health);
    let monitor = ConnectionHealthMonitor::new(api, settings);

    let reachable = monitor.check_server_health().await;
    if args.wait && !reachable {
        wait_for_verdict(&monitor, settings).await;
    }

    let state = monitor.state();
    let report = HealthReport::new(endpoint, &state, settings.max_retries);
    output::print_output(ctx.format, &report, format_human)?;

    if state.connected() {
        Ok(())
    } else {
        Err(ApiError::Network(format!("{} is unreachable", report.endpoint)).into())
    }
}

/// Let the monitor's poller run until the server is back or the overlay
/// threshold is reached.
async fn wait_for_verdict<P: HealthProbe>(monitor: &ConnectionHealthMonitor<P>, settings: HealthSettings) {
    let budget = settings.probe_interval * (settings.max_retries + 1) + Duration::from_secs(1);
    let mut states = monitor.watch();
    let _ = tokio::time::timeout(budget, async {
        loop {
            {
                let state = states.borrow_and_update();
                if state.connected() || state.should_show_overlay(settings.max_retries) {
                    return;
                }
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
}

fn format_human(report: &HealthReport) -> String {
    let mut line = format!("{}: {}", report.endpoint, report.status);
    if report.consecutive_failures > 0 {
        line.push_str(&format!(" ({} consecutive failures)", report.consecutive_failures));
    }
    if report.show_overlay {
        line.push_str("\nConnection lost. Check your network and that the server is running.");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use dentika_client::health::ProbeOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownThenUp {
        calls: AtomicUsize,
        up_after: usize,
    }

    impl HealthProbe for DownThenUp {
        async fn probe(&self) -> ProbeOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.up_after {
                ProbeOutcome::Reachable(200)
            } else {
                ProbeOutcome::NoResponse("connection refused".into())
            }
        }
    }

    fn settings() -> HealthSettings {
        HealthSettings { probe_interval: Duration::from_secs(5), max_retries: 3 }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_server_answers() {
        let monitor = ConnectionHealthMonitor::new(DownThenUp { calls: AtomicUsize::new(0), up_after: 2 }, settings());
        assert!(!monitor.check_server_health().await);

        wait_for_verdict(&monitor, settings()).await;
        assert!(monitor.is_connected());
        assert_eq!(monitor.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stops_at_overlay_threshold() {
        let monitor =
            ConnectionHealthMonitor::new(DownThenUp { calls: AtomicUsize::new(0), up_after: usize::MAX }, settings());
        assert!(!monitor.check_server_health().await);

        wait_for_verdict(&monitor, settings()).await;
        assert!(monitor.should_show_overlay());
        assert_eq!(monitor.status().as_str(), "server_down");
    }

    #[test]
    fn human_report_mentions_failures_and_overlay() {
        let state = HealthState {
            browser_online: true,
            server_reachable: false,
            consecutive_failures: 3,
            last_checked_at: None,
        };
        let report = HealthReport::new("http://localhost:3000/api/auth/health".into(), &state, 3);
        let text = format_human(&report);
        assert!(text.starts_with("http://localhost:3000/api/auth/health: server_down (3 consecutive failures)"));
        assert!(text.contains("Connection lost"));
    }
}
