// dentika CLI entry point.

use std::path::PathBuf;

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "dentika", about = "Dentika realtime notification client")]
struct Cli {
    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ~/.dentika/config.toml).
    #[arg(long, global = true, env = "DENTIKA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);

    let result = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => commands::run(cli.command, commands::Context { format, config }).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}
