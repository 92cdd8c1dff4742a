// NATS client protocol (text framing) as carried over WebSocket frames.
//
// Only the subset a subscribing client needs is implemented:
//   client → server: CONNECT, PUB, SUB, UNSUB, PING, PONG
//   server → client: INFO, MSG, PING, PONG, +OK, -ERR
//
// WebSocket frames do not align with protocol operations, so inbound bytes
// are accumulated in a `Decoder` and complete operations are pulled out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";
const MAX_CONTROL_LINE: usize = 4096;

/// NATS server default for `max_payload`; used until INFO says otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("control line exceeds {MAX_CONTROL_LINE} bytes")]
    ControlLineTooLong,
    #[error("unknown protocol operation `{0}`")]
    UnknownOp(String),
    #[error("MSG payload of {size} bytes exceeds max_payload {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("malformed `{op}` line: {line}")]
    Malformed { op: &'static str, line: String },
    #[error("invalid INFO payload: {0}")]
    InvalidInfo(String),
    #[error("failed to encode CONNECT options: {0}")]
    Encode(String),
}

/// Options sent in the CONNECT handshake.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
}

impl ConnectOptions {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            auth_token: Some(token.into()),
            name: Some("dentika-client".to_string()),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: true,
        }
    }
}

/// Server INFO block; only the fields the client looks at.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    pub max_payload: Option<u64>,
    pub auth_required: bool,
}

/// Operations sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectOptions),
    Pub { subject: String, payload: Vec<u8> },
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Self::Connect(options) => {
                let json = serde_json::to_string(options)
                    .map_err(|error| ProtocolError::Encode(error.to_string()))?;
                format!("CONNECT {json}\r\n").into_bytes()
            }
            Self::Pub { subject, payload } => {
                let mut out = format!("PUB {subject} {}\r\n", payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out.extend_from_slice(CRLF);
                out
            }
            Self::Sub { subject, sid } => format!("SUB {subject} {sid}\r\n").into_bytes(),
            Self::Unsub { sid } => format!("UNSUB {sid}\r\n").into_bytes(),
            Self::Ping => b"PING\r\n".to_vec(),
            Self::Pong => b"PONG\r\n".to_vec(),
        };
        Ok(bytes)
    }
}

/// Operations received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg { subject: String, sid: u64, reply_to: Option<String>, payload: Vec<u8> },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Incremental decoder for server operations.
#[derive(Debug)]
pub struct Decoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self { buf: Vec::new(), max_payload: DEFAULT_MAX_PAYLOAD }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest `MSG` payload accepted before the stream is treated as corrupt.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete operation, or `None` if more bytes are needed.
    pub fn next_op(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            if self.buf.len() > MAX_CONTROL_LINE {
                return Err(ProtocolError::ControlLineTooLong);
            }
            return Ok(None);
        };

        let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
        let (op, rest) = match line.split_once(' ') {
            Some((op, rest)) => (op.to_ascii_uppercase(), rest.trim()),
            None => (line.trim().to_ascii_uppercase(), ""),
        };

        let consumed = line_end + CRLF.len();
        let parsed = match op.as_str() {
            "MSG" => return self.take_msg(&line, rest, consumed),
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(rest)
                    .map_err(|error| ProtocolError::InvalidInfo(error.to_string()))?;
                ServerOp::Info(info)
            }
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
            _ => return Err(ProtocolError::UnknownOp(op)),
        };
        self.buf.drain(..consumed);
        Ok(Some(parsed))
    }

    fn take_msg(
        &mut self,
        line: &str,
        args: &str,
        header_len: usize,
    ) -> Result<Option<ServerOp>, ProtocolError> {
        let malformed = || ProtocolError::Malformed { op: "MSG", line: line.to_string() };
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (subject, sid, reply_to, size) = match parts.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
            _ => return Err(malformed()),
        };
        let sid: u64 = sid.parse().map_err(|_| malformed())?;
        let size: usize = size.parse().map_err(|_| malformed())?;
        if size > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge { size, max: self.max_payload });
        }

        let payload_end = header_len.checked_add(size).ok_or_else(malformed)?;
        let total = payload_end.checked_add(CRLF.len()).ok_or_else(malformed)?;
        if self.buf.len() < total {
            return Ok(None);
        }
        if &self.buf[payload_end..total] != CRLF {
            return Err(malformed());
        }

        let payload = self.buf[header_len..payload_end].to_vec();
        let subject = subject.to_string();
        self.buf.drain(..total);
        Ok(Some(ServerOp::Msg { subject, sid, reply_to, payload }))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|window| window == CRLF)
}
