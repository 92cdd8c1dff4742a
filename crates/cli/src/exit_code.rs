// Consistent exit codes for the dentika CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   11 = authentication error
//   13 = network error (API or realtime bus unreachable)

use std::process;

use dentika_client::api::ApiError;
use dentika_client::realtime::TransportError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<UsageError>().is_some() {
                return Self::Usage;
            }
            if cause.downcast_ref::<NotSignedIn>().is_some() {
                return Self::Auth;
            }
            if let Some(bus) = cause.downcast_ref::<BusUnavailable>() {
                return if bus.reason.contains("rejected") { Self::Auth } else { Self::Network };
            }
            if let Some(api_err) = cause.downcast_ref::<ApiError>() {
                return Self::from_api_error(api_err);
            }
            if let Some(transport_err) = cause.downcast_ref::<TransportError>() {
                return match transport_err {
                    TransportError::Rejected(_) => Self::Auth,
                    TransportError::Connect { .. } | TransportError::Closed => Self::Network,
                    _ => Self::Error,
                };
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => Self::Network,
                    std::io::ErrorKind::PermissionDenied => Self::Auth,
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }

    fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::Unauthorized(_) => Self::Auth,
            ApiError::InvalidUrl(_) => Self::Usage,
            err if err.is_network() => Self::Network,
            ApiError::Status { status: 403, .. } => Self::Auth,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// Bad arguments detected after parsing (missing target id, etc.).
#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

/// No token was given and none is stored.
#[derive(Debug)]
pub struct NotSignedIn;

impl std::fmt::Display for NotSignedIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("not signed in: no auth token available")
    }
}

impl std::error::Error for NotSignedIn {}

/// The realtime bus did not accept a session.
#[derive(Debug)]
pub struct BusUnavailable {
    pub endpoint: String,
    pub reason: String,
}

impl std::fmt::Display for BusUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "realtime bus at {} unavailable: {}", self.endpoint, self.reason)
    }
}

impl std::error::Error for BusUnavailable {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Network.code(), 13);
    }

    #[test]
    fn unauthorized_api_error_is_auth() {
        let err = anyhow::Error::new(ApiError::Unauthorized("Invalid or expired token".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);
    }

    #[test]
    fn network_api_error_is_network() {
        let err = anyhow::Error::new(ApiError::Network("connection refused".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
        let err = anyhow::Error::new(ApiError::Timeout);
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn server_status_error_is_general() {
        let err = anyhow::Error::new(ApiError::Status { status: 500, message: "Internal server error".into() });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }

    #[test]
    fn bus_rejection_is_auth() {
        let err = anyhow::Error::new(TransportError::Rejected("'Authorization Violation'".into()))
            .context("failed to open realtime session");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);
    }

    #[test]
    fn bus_connect_failure_is_network() {
        let err = anyhow::Error::new(TransportError::Connect {
            endpoint: "wss://localhost:9222".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn bus_unavailable_depends_on_reason() {
        let refused = BusUnavailable { endpoint: "wss://localhost:9222".into(), reason: "failed to open connection".into() };
        assert_eq!(ExitCode::from_error(&anyhow::Error::new(refused)), ExitCode::Network);
        let rejected = BusUnavailable {
            endpoint: "wss://localhost:9222".into(),
            reason: "server rejected the session: 'Authorization Violation'".into(),
        };
        assert_eq!(ExitCode::from_error(&anyhow::Error::new(rejected)), ExitCode::Auth);
    }

    #[test]
    fn typed_cli_errors_in_chain() {
        let err = anyhow::Error::new(UsageError("--to is required".into())).context("publish");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
        let err = anyhow::Error::new(NotSignedIn);
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);
    }

    #[test]
    fn from_error_timeout_is_network() {
        let err = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }

    #[test]
    fn exit_code_to_process_exit_code() {
        let code: process::ExitCode = ExitCode::Auth.into();
        let _ = code;
    }
}
