//! SSH transport on libssh2
//!
//! - **Key-based authentication ONLY** (no password support)
//! - Keys are offered from memory in resolution order
//! - Name lookup and TCP connect bounded by the dial timeout, handshake
//!   bounded separately by the same value
//!
//! Commands run inside the interactive shell started on the session: the
//! command is written to the shell followed by `exit`, so the channel's exit
//! status is the command's exit status.
//!
//! # Interruption
//!
//! libssh2 holds the session lock for the whole of a blocking read, so a
//! session cannot be disconnected politely while a command is in flight.
//! [`Ssh2Session::close`] instead shuts down a cloned handle of the TCP socket,
//! which fails the blocked read and releases the channel.

use crate::credentials::Credential;
use crate::error::{Result, XshError};
use crate::models::{CommandOutput, HostSpec, PtyRequest, DEFAULT_SSH_PORT, MAX_OUTPUT_SIZE};
use crate::transport::{read_capped, Connection, RemoteSession, Transport};
use ssh2::{Channel, PtyModeOpcode, PtyModes, Session};
use std::io::{self, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Transport backed by the `ssh2` crate
#[derive(Debug, Clone, Default)]
pub struct Ssh2Transport;

impl Ssh2Transport {
    pub fn new() -> Self {
        Self
    }

    fn authenticate(session: &Session, target: &HostSpec, credentials: &[Credential]) -> Result<()> {
        for credential in credentials {
            debug!("Offering key: {:?}", credential.source());
            match session.userauth_pubkey_memory(&target.user, None, credential.pem(), None) {
                Ok(()) if session.authenticated() => {
                    debug!("Authenticated with key: {:?}", credential.source());
                    return Ok(());
                }
                Ok(()) => {}
                Err(e) => debug!("Key {:?} rejected: {}", credential.source(), e),
            }
        }

        Err(XshError::Dial {
            host: target.to_string(),
            message: format!(
                "authentication failed with {} key(s)",
                credentials.len()
            ),
        })
    }
}

impl Transport for Ssh2Transport {
    fn dial(
        &self,
        target: &HostSpec,
        credentials: &[Credential],
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let dial_err = |message: String| XshError::Dial {
            host: target.to_string(),
            message,
        };

        // Name lookup and TCP connect share the dial timeout
        let deadline = Instant::now() + timeout;
        let addr = resolve_addr_within(&target.address, timeout)
            .map_err(|e| dial_err(format!("Invalid host address: {}", e)))?;
        debug!("Creating SSH session to {}", addr);

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let tcp = TcpStream::connect_timeout(&addr, remaining)
            .map_err(|e| dial_err(format!("Failed to connect: {}", e)))?;
        let control = tcp.try_clone()?;

        let mut session =
            Session::new().map_err(|e| dial_err(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| dial_err(format!("SSH handshake failed: {}", e)))?;

        Self::authenticate(&session, target, credentials)?;

        // Commands are bounded by the run's stop signal, not by libssh2
        session.set_timeout(0);

        info!("SSH session established to {}", addr);

        Ok(Box::new(Ssh2Connection {
            session,
            control,
            host: target.to_string(),
        }))
    }
}

/// Resolve `host` or `host:port`, defaulting to port 22
fn resolve_addr(address: &str) -> io::Result<SocketAddr> {
    let mut addrs = match address.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => (address, DEFAULT_SSH_PORT).to_socket_addrs()?,
    };
    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses found for {}", address),
        )
    })
}

/// [`resolve_addr`] bounded by `timeout`.
///
/// The system resolver cannot be cancelled, so a lookup that outlives the
/// timeout finishes on its own thread and its result is dropped.
fn resolve_addr_within(address: &str, timeout: Duration) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_SSH_PORT));
    }

    let (tx, rx) = mpsc::channel();
    let name = address.to_string();
    thread::Builder::new()
        .name("xsh-resolve".to_string())
        .spawn(move || {
            // The receiver is gone if the lookup timed out
            let _ = tx.send(resolve_addr(&name));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("name lookup for {} timed out after {:?}", address, timeout),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("name lookup for {} failed", address),
        )),
    }
}

struct Ssh2Connection {
    session: Session,
    control: TcpStream,
    host: String,
}

impl Connection for Ssh2Connection {
    fn open_session(&self) -> Result<Arc<dyn RemoteSession>> {
        let channel = self
            .session
            .channel_session()
            .map_err(|e| XshError::Transport(format!("Failed to open channel: {}", e)))?;

        Ok(Arc::new(Ssh2Session {
            channel: Mutex::new(channel),
            control: self.control.try_clone()?,
            host: self.host.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Interactive shell channel on one SSH connection
pub struct Ssh2Session {
    channel: Mutex<Channel>,
    control: TcpStream,
    host: String,
    closed: AtomicBool,
}

impl Ssh2Session {
    fn with_channel<T>(&self, f: impl FnOnce(&mut Channel) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(XshError::SessionClosed);
        }
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| XshError::Transport("channel lock poisoned".to_string()))?;
        f(&mut channel)
    }

    /// Map a transport failure, reporting closure if the socket was shut down
    fn io_error(&self, context: &str, e: impl std::fmt::Display) -> XshError {
        if self.closed.load(Ordering::SeqCst) {
            XshError::SessionClosed
        } else {
            XshError::Transport(format!("{}: {}", context, e))
        }
    }
}

impl RemoteSession for Ssh2Session {
    fn request_pty(&self, pty: &PtyRequest) -> Result<()> {
        let mut modes = PtyModes::new();
        modes.set_boolean(PtyModeOpcode::ECHO, pty.echo);
        modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, pty.speed);
        modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, pty.speed);

        self.with_channel(|channel| {
            channel
                .request_pty(&pty.term, Some(modes), Some((pty.cols, pty.rows, 0, 0)))
                .map_err(|e| self.io_error("Failed to request pty", e))
        })
    }

    fn start_shell(&self) -> Result<()> {
        self.with_channel(|channel| {
            channel
                .shell()
                .map_err(|e| self.io_error("Failed to start shell", e))
        })
    }

    fn run_and_capture(&self, command: &str) -> Result<CommandOutput> {
        self.with_channel(|channel| {
            debug!("Executing command on {}: {}", self.host, command);

            let script = format!("{}\nexit\n", command);
            channel
                .write_all(script.as_bytes())
                .map_err(|e| self.io_error("Failed to send command", e))?;
            channel
                .send_eof()
                .map_err(|e| self.io_error("Failed to send EOF", e))?;

            let (output, truncated) =
                read_capped(channel).map_err(|e| self.io_error("Failed to read output", e))?;
            if truncated {
                warn!("Output from {} truncated to {} bytes", self.host, MAX_OUTPUT_SIZE);
            }

            channel
                .wait_close()
                .map_err(|e| self.io_error("Failed to close channel", e))?;
            let exit_status = channel
                .exit_status()
                .map_err(|e| self.io_error("Failed to get exit status", e))?;

            debug!("Command on {} exited with status {}", self.host, exit_status);

            Ok(CommandOutput {
                output,
                exit_status,
            })
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing SSH session to {}", self.host);
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already went away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(XshError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_resolve_addr_default_port() {
        let addr = resolve_addr("127.0.0.1").unwrap();
        assert_eq!(addr, "127.0.0.1:22".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_resolve_addr_explicit_port() {
        let addr = resolve_addr("127.0.0.1:2222").unwrap();
        assert_eq!(addr.port(), 2222);
    }

    #[test]
    fn test_resolve_addr_ipv6() {
        assert_eq!(resolve_addr("::1").unwrap().port(), 22);
        assert_eq!(resolve_addr("[::1]:2200").unwrap().port(), 2200);
    }

    #[test]
    fn test_resolve_within_literal_needs_no_lookup() {
        // A zero budget still succeeds for literal addresses
        let addr = resolve_addr_within("127.0.0.1:2222", Duration::ZERO).unwrap();
        assert_eq!(addr.port(), 2222);
        let addr = resolve_addr_within("::1", Duration::ZERO).unwrap();
        assert_eq!(addr.port(), 22);
    }

    #[test]
    fn test_resolve_within_hostname() {
        let addr = resolve_addr_within("localhost", Duration::from_secs(5)).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 22);
    }

    #[test]
    fn test_resolve_within_exhausted_budget() {
        assert!(resolve_addr_within("xsh-unresolvable.invalid", Duration::ZERO).is_err());
    }

    #[test]
    fn test_dial_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = HostSpec::parse(&format!("deploy@127.0.0.1:{}", port)).unwrap();

        let result = Ssh2Transport::new().dial(&target, &[], Duration::from_secs(1));
        match result {
            Err(XshError::Dial { host, message }) => {
                assert_eq!(host, target.to_string());
                assert!(message.contains("Failed to connect"));
            }
            Err(other) => panic!("expected Dial error, got {}", other),
            Ok(_) => panic!("dial should fail"),
        }
    }
}
