//! Core data models for xsh

use crate::error::{Result, XshError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Input validation limits
pub const MAX_COMMAND_LEN: usize = 4_096; // 4 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120);

/// Remote target parsed from a `user@address` token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    pub user: String,
    /// Host name or IP, optionally with `:port`
    pub address: String,
}

impl HostSpec {
    /// Parse a `user@address` token. Exactly one `@` and both parts non-empty.
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = || XshError::InvalidHostFormat {
            host: token.to_string(),
        };

        let mut parts = token.split('@');
        let (user, address) = match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(address), None) => (user, address),
            _ => return Err(invalid()),
        };

        if user.is_empty() || address.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            user: user.to_string(),
            address: address.to_string(),
        })
    }
}

impl FromStr for HostSpec {
    type Err = XshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address)
    }
}

/// Pseudo-terminal parameters requested before the shell starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub echo: bool,
    /// Input and output line speed in baud
    pub speed: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 40,
            echo: false,
            speed: 14_400,
        }
    }
}

/// Captured result of one command on one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: Vec<u8>,
    pub exit_status: i32,
}

/// Timed result of running the command against one host
#[derive(Debug, Clone)]
pub struct Outcome {
    pub host: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed: Duration,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
