//! Error types for xsh

use std::path::PathBuf;
use thiserror::Error;

/// Stage of per-host session setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    OpenSession,
    RequestPty,
    StartShell,
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupStage::OpenSession => write!(f, "open session"),
            SetupStage::RequestPty => write!(f, "request terminal"),
            SetupStage::StartShell => write!(f, "start shell"),
        }
    }
}

/// xsh error types
#[derive(Error, Debug)]
pub enum XshError {
    /// Empty host list
    #[error("no hosts specified")]
    NoHosts,

    /// Host token not of the form user@address
    #[error("invalid host: {host}, hosts must be in the format user@host")]
    InvalidHostFormat { host: String },

    /// Credential directory scan produced no usable key
    #[error("no ssh keys found in {}", dir.display())]
    NoCredentialsFound { dir: PathBuf },

    /// Key file could not be read
    #[error("failed to read key file {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key file is not a usable private key
    #[error("failed to parse private key {}: {reason}", path.display())]
    KeyParse { path: PathBuf, reason: String },

    /// TCP connect, handshake or authentication failure
    #[error("failed to dial SSH for host {host}: {message}")]
    Dial { host: String, message: String },

    /// Session, terminal or shell setup failure
    #[error("failed to {stage} for host {host}: {message}")]
    SessionSetup {
        host: String,
        stage: SetupStage,
        message: String,
    },

    /// Transport I/O failure while running a command
    #[error("SSH error: {0}")]
    Transport(String),

    /// Remote command exited non-zero
    #[error("exit status {0}")]
    ExitStatus(i32),

    /// Session was closed while in use
    #[error("session closed")]
    SessionClosed,

    /// Settings validation errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Layered settings loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Report serialization errors
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Execute called before a successful open
    #[error("plan has no open hosts; open connections before executing")]
    NotOpened,

    /// Outcomes could not be collected
    #[error("Result aggregation failed: {0}")]
    Aggregation(String),
}

impl From<serde_json::Error> for XshError {
    fn from(e: serde_json::Error) -> Self {
        XshError::Serialize(e.to_string())
    }
}

impl From<serde_yaml::Error> for XshError {
    fn from(e: serde_yaml::Error) -> Self {
        XshError::Serialize(e.to_string())
    }
}

/// Result type alias using XshError
pub type Result<T> = std::result::Result<T, XshError>;
