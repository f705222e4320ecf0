//! Execution engine: run one command on every open host
//!
//! Bounded and unbounded execution share one code path. Each host gets its
//! own task, and a semaphore admits at most `limit` of them into the blocking
//! run-and-capture call at once; without a limit the semaphore is sized to the
//! host count so every task is admitted immediately.
//!
//! A host's failure only ever becomes a failure [`Outcome`]; it never stops
//! the other hosts. The engine does not close sessions. A timeout interrupts
//! in-flight commands by closing their sessions from the stop-signal listener.

use crate::connection::Host;
use crate::error::{Result, XshError};
use crate::models::Outcome;
use crate::results::ResultSet;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Number of simultaneous executions to admit
pub fn admission_limit(parallel_limit: Option<usize>, host_count: usize) -> usize {
    let unbounded = host_count.max(1);
    match parallel_limit {
        Some(limit) if limit > 0 => limit.min(unbounded),
        _ => unbounded,
    }
}

/// Runs a command on a fixed set of hosts
pub struct Executor {
    hosts: Vec<Arc<Host>>,
    command: Arc<str>,
    parallel_limit: Option<usize>,
}

impl Executor {
    pub fn new(hosts: Vec<Arc<Host>>, command: impl Into<Arc<str>>) -> Self {
        Self {
            hosts,
            command: command.into(),
            parallel_limit: None,
        }
    }

    /// Cap concurrent executions. `None` or `Some(0)` means unbounded.
    pub fn with_parallel_limit(mut self, limit: Option<usize>) -> Self {
        self.parallel_limit = limit;
        self
    }

    /// Run the command on every host and collect one outcome per host.
    ///
    /// # Errors
    ///
    /// * `XshError::NotOpened` - there are no hosts to run on
    /// * `XshError::Aggregation` - outcomes could not be collected
    pub async fn execute(&self) -> Result<ResultSet> {
        if self.hosts.is_empty() {
            return Err(XshError::NotOpened);
        }

        let limit = admission_limit(self.parallel_limit, self.hosts.len());
        info!(
            "Executing on {} host(s), at most {} at a time",
            self.hosts.len(),
            limit
        );

        let gate = Arc::new(Semaphore::new(limit));
        let results = Arc::new(ResultSet::new());
        let mut tasks = JoinSet::new();

        for host in &self.hosts {
            let host = host.clone();
            let gate = gate.clone();
            let results = results.clone();
            let command = self.command.clone();
            let span = info_span!("host", host = %host.spec());

            tasks.spawn(
                async move {
                    let outcome = match gate.acquire_owned().await {
                        Ok(permit) => {
                            let label = host.spec().to_string();
                            let started = Utc::now();
                            match tokio::task::spawn_blocking(move || {
                                let outcome = run_on_host(&host, &command);
                                drop(permit);
                                outcome
                            })
                            .await
                            {
                                Ok(outcome) => outcome,
                                Err(e) => failed_outcome(label, started, format!("task failed: {}", e)),
                            }
                        }
                        Err(e) => failed_outcome(host.spec().to_string(), Utc::now(), e.to_string()),
                    };
                    results.record(outcome);
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Host task did not complete: {}", e);
            }
        }

        let results = Arc::try_unwrap(results).map_err(|_| {
            XshError::Aggregation("result set still shared after all tasks finished".to_string())
        })?;

        info!(
            "Execution finished: {} succeeded, {} failed",
            results.success_count(),
            results.failure_count()
        );
        Ok(results)
    }
}

/// Blocking unit of work for one host
pub(crate) fn run_on_host(host: &Host, command: &str) -> Outcome {
    let start = Utc::now();
    let clock = Instant::now();

    let result = host.run(command);

    let elapsed = clock.elapsed();
    let end = Utc::now().max(start);

    let (output, error) = match result {
        Ok(captured) if captured.exit_status == 0 => (captured.output, None),
        Ok(captured) => (
            captured.output,
            Some(XshError::ExitStatus(captured.exit_status).to_string()),
        ),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    match &error {
        None => debug!("Command succeeded in {:?}", elapsed),
        Some(e) => warn!("Command failed after {:?}: {}", elapsed, e),
    }

    Outcome {
        host: host.spec().to_string(),
        start,
        end,
        elapsed,
        output,
        error,
    }
}

fn failed_outcome(host: String, at: chrono::DateTime<Utc>, error: String) -> Outcome {
    Outcome {
        host,
        start: at,
        end: Utc::now().max(at),
        elapsed: std::time::Duration::ZERO,
        output: Vec::new(),
        error: Some(error),
    }
}
