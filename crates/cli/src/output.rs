// How command results and failures reach the terminal.
//
// Results go to stdout: human text on a TTY, one JSON object per line when
// piped or when `--json` is given. Errors and warnings go to stderr in the
// same format, tagged with a stable code scripts can match on.

use std::io::{self, IsTerminal, Write};

use dentika_client::api::ApiError;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::exit_code::ExitCode;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// `--json` wins; otherwise JSON unless stdout is a terminal.
    pub fn detect(json_flag: bool) -> Self {
        Self::choose(json_flag, io::stdout().is_terminal())
    }

    fn choose(json_flag: bool, stdout_is_tty: bool) -> Self {
        if json_flag || !stdout_is_tty {
            Self::Json
        } else {
            Self::Human
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Error => ANSI_RED,
            Self::Warning => ANSI_YELLOW,
        }
    }
}

/// Print a command result to stdout. `human_fn` only runs in human mode.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let line = render(format, value, human_fn)?;
    writeln!(io::stdout().lock(), "{line}")
}

fn render<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<String>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => Ok(human_fn(value)),
        OutputFormat::Json => serde_json::to_string(value).map_err(io::Error::other),
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(Severity::Error, format, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(Severity::Warning, format, code, message);
}

fn print_diagnostic(severity: Severity, format: OutputFormat, code: &str, message: &str) {
    let line = render_diagnostic(severity, format, code, message, io::stderr().is_terminal());
    let _ = writeln!(io::stderr().lock(), "{line}");
}

fn render_diagnostic(severity: Severity, format: OutputFormat, code: &str, message: &str, is_tty: bool) -> String {
    match format {
        OutputFormat::Human if is_tty => {
            format!("{}{}:{ANSI_RESET} {message}", severity.color(), severity.label())
        }
        OutputFormat::Human => format!("{}: {message}", severity.label()),
        OutputFormat::Json => {
            let mut object = Map::new();
            object.insert(severity.label().to_string(), json!({ "code": code, "message": message }));
            Value::Object(object).to_string()
        }
    }
}

/// Print a command failure with a code and, where one exists, a next step.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    match ExitCode::from_error(error) {
        ExitCode::Auth => {
            return (
                "AUTH_FAILURE",
                format!("{message}. Sign in again with: dentika login --token <token>"),
            );
        }
        ExitCode::Network => {
            return (
                "NETWORK_UNREACHABLE",
                format!("{message}. Check [api].base_url and [realtime].url in ~/.dentika/config.toml"),
            );
        }
        ExitCode::Usage => return ("USAGE", message),
        _ => {}
    }

    if let Some(status) = error.chain().find_map(|cause| cause.downcast_ref::<ApiError>()).and_then(ApiError::status) {
        return ("API_ERROR", format!("Server answered HTTP {status}: {message}"));
    }

    if message.to_ascii_lowercase().contains("config") {
        return ("CONFIG_ERROR", message);
    }

    ("ERROR", message)
}
