//! Connection manager: one interactive session per host
//!
//! Opening is all-or-nothing. Every host token is validated before any
//! network activity, credentials are resolved once, and hosts are then dialed
//! one after another. If any host fails, sessions opened earlier in the same
//! call are closed before the error is returned.

use crate::cancel::close_all;
use crate::credentials::{Credential, CredentialResolver};
use crate::error::{Result, SetupStage, XshError};
use crate::models::{CommandOutput, HostSpec, PtyRequest, DEFAULT_DIAL_TIMEOUT};
use crate::transport::{RemoteSession, Transport};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A host with a live interactive session
pub struct Host {
    spec: HostSpec,
    session: Arc<dyn RemoteSession>,
    closed: AtomicBool,
}

impl Host {
    pub fn new(spec: HostSpec, session: Arc<dyn RemoteSession>) -> Self {
        Self {
            spec,
            session,
            closed: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Run `command` on the session and capture its output
    pub fn run(&self, command: &str) -> Result<CommandOutput> {
        self.session.run_and_capture(command)
    }

    /// Close the session once. Returns false if it was already closed.
    pub fn close(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.session.close()?;
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("spec", &self.spec)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Establishes sessions through a [`Transport`]
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    dial_timeout: Duration,
    pty: PtyRequest,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            pty: PtyRequest::default(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = pty;
        self
    }

    /// Open one session per host token.
    ///
    /// # Errors
    ///
    /// * `XshError::NoHosts` - `tokens` is empty
    /// * `XshError::InvalidHostFormat` - a token is not `user@address`
    /// * credential errors from [`CredentialResolver::resolve`]
    /// * `XshError::Dial` / `XshError::SessionSetup` - naming the failed host
    pub async fn open(
        &self,
        tokens: &[String],
        resolver: &CredentialResolver,
        key_path: Option<&Path>,
    ) -> Result<Vec<Arc<Host>>> {
        if tokens.is_empty() {
            return Err(XshError::NoHosts);
        }

        let specs = tokens
            .iter()
            .map(|token| HostSpec::parse(token))
            .collect::<Result<Vec<_>>>()?;

        let credentials = resolver.resolve(key_path)?;

        self.connect_all(specs, Arc::new(credentials)).await
    }

    /// Dial and set up every host in order, closing earlier sessions on failure
    pub(crate) async fn connect_all(
        &self,
        specs: Vec<HostSpec>,
        credentials: Arc<Vec<Credential>>,
    ) -> Result<Vec<Arc<Host>>> {
        let mut hosts: Vec<Arc<Host>> = Vec::with_capacity(specs.len());

        for spec in specs {
            let label = spec.to_string();
            let manager = self.clone();
            let credentials = credentials.clone();

            let result =
                tokio::task::spawn_blocking(move || manager.connect_host(spec, &credentials))
                    .await
                    .unwrap_or_else(|e| {
                        Err(XshError::Dial {
                            host: label.clone(),
                            message: format!("connect task failed: {}", e),
                        })
                    });

            match result {
                Ok(host) => hosts.push(Arc::new(host)),
                Err(e) => {
                    error!("Failed to open session for {}: {}", label, e);
                    if !hosts.is_empty() {
                        warn!(
                            "Closing {} session(s) opened before the failure",
                            hosts.len()
                        );
                        let opened = std::mem::take(&mut hosts);
                        if let Err(join) =
                            tokio::task::spawn_blocking(move || close_all(&opened)).await
                        {
                            warn!("Cleanup after failed open did not finish: {}", join);
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!("Opened {} session(s)", hosts.len());
        Ok(hosts)
    }

    /// Blocking: dial, open a session, request a pty and start a shell
    fn connect_host(&self, spec: HostSpec, credentials: &[Credential]) -> Result<Host> {
        let label = spec.to_string();
        debug!("Connecting to {}", label);

        let connection = self.transport.dial(&spec, credentials, self.dial_timeout)?;

        let setup_err = |stage: SetupStage, e: XshError| XshError::SessionSetup {
            host: label.clone(),
            stage,
            message: e.to_string(),
        };

        let session = connection
            .open_session()
            .map_err(|e| setup_err(SetupStage::OpenSession, e))?;

        let prepared = session
            .request_pty(&self.pty)
            .map_err(|e| setup_err(SetupStage::RequestPty, e))
            .and_then(|()| {
                session
                    .start_shell()
                    .map_err(|e| setup_err(SetupStage::StartShell, e))
            });

        if let Err(e) = prepared {
            if let Err(close_err) = session.close() {
                warn!("Failed to close session for {}: {}", label, close_err);
            }
            return Err(e);
        }

        debug!("Shell started on {}", label);
        Ok(Host::new(spec, session))
    }
}
