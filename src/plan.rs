//! A single fan-out run
//!
//! A [`Plan`] goes through three phases:
//!
//! 1. [`Plan::open`] validates every host, resolves credentials and opens one
//!    interactive session per host, then starts the teardown listener.
//! 2. [`Plan::execute`] runs the command on every session and collects a
//!    [`ResultSet`].
//! 3. [`Plan::shutdown`] fires the stop signal and waits for the listener to
//!    close the sessions.
//!
//! The stop signal can also be fired at any time from outside, e.g. by
//! [`Plan::arm_deadline`] or on Ctrl-C, to interrupt in-flight commands.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xsh::plan::Plan;
//! use xsh::transport::ssh::Ssh2Transport;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut plan = Plan::new(
//!     vec!["deploy@10.0.0.1".to_string(), "deploy@10.0.0.2".to_string()],
//!     "uptime",
//!     Arc::new(Ssh2Transport::new()),
//! )
//! .with_parallel_limit(Some(1));
//!
//! plan.open().await?;
//! let deadline = plan.arm_deadline(Duration::from_secs(120));
//! let results = plan.execute().await;
//! plan.shutdown().await;
//! deadline.abort();
//!
//! plan.write_report(&results?.snapshot())?;
//! # Ok(())
//! # }
//! ```

use crate::cancel::{spawn_listener, StopSignal, Teardown};
use crate::connection::{ConnectionManager, Host};
use crate::credentials::CredentialResolver;
use crate::error::Result;
use crate::executor::Executor;
use crate::models::{PtyRequest, DEFAULT_DIAL_TIMEOUT};
use crate::output::{OutputFormat, OutputTarget};
use crate::results::{Report, ResultSet};
use crate::settings::Settings;
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Aggregate root for one run
pub struct Plan {
    run_id: Uuid,
    host_tokens: Vec<String>,
    command: String,
    key_path: Option<PathBuf>,
    resolver: CredentialResolver,
    parallel_limit: Option<usize>,
    output: OutputTarget,
    output_format: OutputFormat,
    dial_timeout: Duration,
    pty: PtyRequest,
    transport: Arc<dyn Transport>,
    hosts: Vec<Arc<Host>>,
    stop: StopSignal,
    listener: Option<JoinHandle<Teardown>>,
}

impl Plan {
    pub fn new(
        host_tokens: Vec<String>,
        command: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            host_tokens,
            command: command.into(),
            key_path: None,
            resolver: CredentialResolver::from_home(),
            parallel_limit: None,
            output: OutputTarget::Stdout,
            output_format: OutputFormat::Json,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            pty: PtyRequest::default(),
            transport,
            hosts: Vec::new(),
            stop: StopSignal::new(),
            listener: None,
        }
    }

    /// Build a plan from loaded settings
    pub fn from_settings(settings: &Settings, transport: Arc<dyn Transport>) -> Self {
        Self::new(settings.hosts.clone(), settings.command.clone(), transport)
            .with_key_path(settings.key_path.clone())
            .with_resolver(settings.resolver())
            .with_parallel_limit(settings.parallel_limit())
            .with_output(settings.output_target(), settings.output_format)
            .with_dial_timeout(settings.dial_timeout())
    }

    pub fn with_key_path(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// `None` or `Some(0)` runs every host at once
    pub fn with_parallel_limit(mut self, limit: Option<usize>) -> Self {
        self.parallel_limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn with_output(mut self, target: OutputTarget, format: OutputFormat) -> Self {
        self.output = target;
        self.output_format = format;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = pty;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn output_target(&self) -> &OutputTarget {
        &self.output
    }

    /// Handle to the run's stop signal
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Open one session per host and start the teardown listener.
    ///
    /// On error no session from this call is left open.
    pub async fn open(&mut self) -> Result<()> {
        let span = info_span!("open", run_id = %self.run_id);
        let manager = ConnectionManager::new(self.transport.clone())
            .with_dial_timeout(self.dial_timeout)
            .with_pty(self.pty.clone());

        let hosts = manager
            .open(&self.host_tokens, &self.resolver, self.key_path.as_deref())
            .instrument(span)
            .await?;

        self.listener = Some(spawn_listener(&self.stop, hosts.clone()));
        self.hosts = hosts;
        Ok(())
    }

    /// Run the command on every open host
    pub async fn execute(&self) -> Result<ResultSet> {
        let span = info_span!("execute", run_id = %self.run_id);
        Executor::new(self.hosts.clone(), self.command.as_str())
            .with_parallel_limit(self.parallel_limit)
            .execute()
            .instrument(span)
            .await
    }

    /// Fire the stop signal after `timeout`
    pub fn arm_deadline(&self, timeout: Duration) -> JoinHandle<()> {
        self.stop.fire_after(timeout)
    }

    /// Fire the stop signal and wait for every session to be closed.
    ///
    /// Returns `None` if the plan was never opened or was already shut down.
    pub async fn shutdown(&mut self) -> Option<Teardown> {
        self.stop.fire();
        let listener = self.listener.take()?;
        match listener.await {
            Ok(teardown) => {
                info!(run_id = %self.run_id, "Teardown complete: {} session(s) closed", teardown.closed);
                Some(teardown)
            }
            Err(e) => {
                warn!("Teardown listener failed: {}", e);
                None
            }
        }
    }

    /// Write `report` to the configured sink
    pub fn write_report(&self, report: &Report) -> Result<()> {
        self.output.write(report, self.output_format)
    }
}
