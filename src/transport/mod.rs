//! Remote-shell transport contract
//!
//! The orchestration core never speaks SSH itself. It dials, sets up sessions
//! and runs commands through these traits, which the `ssh` module implements
//! on libssh2. All calls are blocking and are driven from
//! `tokio::task::spawn_blocking` by the callers.

pub mod ssh;

use crate::credentials::Credential;
use crate::error::Result;
use crate::models::{CommandOutput, HostSpec, PtyRequest, MAX_OUTPUT_SIZE};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

/// Establishes authenticated connections
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Connect to `target` and authenticate with the first credential that
    /// the server accepts, giving up after `timeout`
    fn dial(
        &self,
        target: &HostSpec,
        credentials: &[Credential],
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// An authenticated connection to one host
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send {
    fn open_session(&self) -> Result<Arc<dyn RemoteSession>>;
}

/// An interactive channel on a connection.
///
/// `close` must be safe to call from another thread while `run_and_capture`
/// is blocked, and must make that call return.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteSession: Send + Sync {
    fn request_pty(&self, pty: &PtyRequest) -> Result<()>;

    fn start_shell(&self) -> Result<()>;

    fn run_and_capture(&self, command: &str) -> Result<CommandOutput>;

    fn close(&self) -> Result<()>;
}

/// Read `reader` to EOF, keeping at most MAX_OUTPUT_SIZE bytes.
///
/// Bytes past the cap are read and discarded so the stream still reaches EOF.
/// Returns the kept bytes and whether anything was discarded.
pub(crate) fn read_capped<R: Read>(reader: &mut R) -> io::Result<(Vec<u8>, bool)> {
    let mut output = Vec::new();
    reader
        .by_ref()
        .take(MAX_OUTPUT_SIZE as u64)
        .read_to_end(&mut output)?;
    let discarded = io::copy(reader, &mut io::sink())?;
    Ok((output, discarded > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_capped_small_output() {
        let (output, truncated) = read_capped(&mut Cursor::new(b"hello world".to_vec())).unwrap();
        assert!(!truncated);
        assert_eq!(output, b"hello world");
    }

    #[test]
    fn test_read_capped_exact_limit() {
        let mut reader = io::repeat(b'x').take(MAX_OUTPUT_SIZE as u64);
        let (output, truncated) = read_capped(&mut reader).unwrap();
        assert!(!truncated);
        assert_eq!(output.len(), MAX_OUTPUT_SIZE);
    }

    #[test]
    fn test_read_capped_discards_excess() {
        let mut reader = io::repeat(b'x').take(MAX_OUTPUT_SIZE as u64 + 1000);
        let (output, truncated) = read_capped(&mut reader).unwrap();
        assert!(truncated);
        assert_eq!(output.len(), MAX_OUTPUT_SIZE);

        // The whole stream was consumed
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
