//! Daemon control protocol
//!
//! One message per newline-terminated UTF-8 line. Fields are comma separated
//! and the first field is a two-letter type code:
//!
//! | Code | Direction             | Fields                     |
//! |------|-----------------------|----------------------------|
//! | `NP` | controller → daemon   | work dir, argv0, argv1, …  |
//! | `WS` | controller → daemon   | text for the child's stdin |
//! | `RS` | daemon → controller   | one line of child output   |
//! | `PS` | daemon → controller   | `0` idle / `1` running     |
//!
//! Fields are escaped (`\\`, `\,`, `\n`, `\r`) so argv tokens and text may
//! carry commas. `WS`/`RS` decoding still rejoins surplus fields with `,`,
//! which keeps unescaped text from older peers intact.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const TYPE_NEW_PROCESS: &str = "NP";
pub const TYPE_WRITE_STDIO: &str = "WS";
pub const TYPE_RECEIVED_STDIO: &str = "RS";
pub const TYPE_REPORT_PROCESS_STATE: &str = "PS";

pub const PROCESS_STATE_IDLE: &str = "0";
pub const PROCESS_STATE_RUNNING: &str = "1";

const FIELD_SEPARATOR: char = ',';
const ESCAPE: char = '\\';

/// 프로토콜 디코딩 오류
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message line")]
    Empty,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("message '{code}' is missing field '{field}'")]
    MissingField {
        code: &'static str,
        field: &'static str,
    },

    #[error("invalid process state '{0}'")]
    InvalidState(String),

    #[error("line ends inside an escape sequence")]
    DanglingEscape,

    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
}

/// Whether the supervised child process exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Idle,
    Running,
}

impl ProcessState {
    pub fn from_running(running: bool) -> Self {
        if running {
            Self::Running
        } else {
            Self::Idle
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Idle => PROCESS_STATE_IDLE,
            Self::Running => PROCESS_STATE_RUNNING,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            PROCESS_STATE_IDLE => Some(Self::Idle),
            PROCESS_STATE_RUNNING => Some(Self::Running),
            _ => None,
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Launch a child in `work_dir` with the argv `command`.
    NewProcess { work_dir: String, command: Vec<String> },
    /// Write one line to the child's stdin.
    WriteStdio(String),
    /// One line of the child's output.
    ReceivedStdio(String),
    /// Process state report.
    ProcessState(ProcessState),
}

impl Message {
    pub fn type_code(&self) -> &'static str {
        match self {
            Self::NewProcess { .. } => TYPE_NEW_PROCESS,
            Self::WriteStdio(_) => TYPE_WRITE_STDIO,
            Self::ReceivedStdio(_) => TYPE_RECEIVED_STDIO,
            Self::ProcessState(_) => TYPE_REPORT_PROCESS_STATE,
        }
    }

    /// Encode without the trailing newline.
    pub fn encode(&self) -> String {
        let mut out = String::from(self.type_code());
        let mut push = |field: &str| {
            out.push(FIELD_SEPARATOR);
            escape_into(field, &mut out);
        };
        match self {
            Self::NewProcess { work_dir, command } => {
                push(work_dir);
                for token in command {
                    push(token);
                }
            }
            Self::WriteStdio(text) | Self::ReceivedStdio(text) => push(text),
            Self::ProcessState(state) => push(state.code()),
        }
        out
    }

    /// Encode with the trailing newline, ready to be written to a socket.
    pub fn encode_line(&self) -> String {
        let mut line = self.encode();
        line.push('\n');
        line
    }

    /// Decode one received line. A trailing `\n` / `\r\n` is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut fields = split_fields(line)?.into_iter();
        let code = fields.next().ok_or(ProtocolError::Empty)?;

        match code.as_str() {
            TYPE_NEW_PROCESS => {
                let work_dir = fields.next().ok_or(ProtocolError::MissingField {
                    code: TYPE_NEW_PROCESS,
                    field: "work_dir",
                })?;
                let command: Vec<String> = fields.collect();
                if command.is_empty() {
                    return Err(ProtocolError::MissingField {
                        code: TYPE_NEW_PROCESS,
                        field: "command",
                    });
                }
                Ok(Self::NewProcess { work_dir, command })
            }
            TYPE_WRITE_STDIO => Ok(Self::WriteStdio(rejoin(fields))),
            TYPE_RECEIVED_STDIO => Ok(Self::ReceivedStdio(rejoin(fields))),
            TYPE_REPORT_PROCESS_STATE => {
                let raw = fields.next().ok_or(ProtocolError::MissingField {
                    code: TYPE_REPORT_PROCESS_STATE,
                    field: "state",
                })?;
                ProcessState::from_code(&raw)
                    .map(Self::ProcessState)
                    .ok_or(ProtocolError::InvalidState(raw))
            }
            _ => Err(ProtocolError::UnknownType(code)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ─── Field escaping ──────────────────────────────────────────

fn escape_into(field: &str, out: &mut String) {
    for c in field.chars() {
        match c {
            ESCAPE => out.push_str("\\\\"),
            FIELD_SEPARATOR => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn split_fields(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(ESCAPE) => current.push(ESCAPE),
                Some(FIELD_SEPARATOR) => current.push(FIELD_SEPARATOR),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => return Err(ProtocolError::InvalidEscape(other)),
                None => return Err(ProtocolError::DanglingEscape),
            },
            FIELD_SEPARATOR => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    Ok(fields)
}

fn rejoin(fields: impl Iterator<Item = String>) -> String {
    fields.collect::<Vec<_>>().join(",")
}
