//! Stop signal and session teardown
//!
//! Every open session is closed by the listener task spawned here once the
//! run's [`StopSignal`] fires. The signal is fired at the normal end of a run
//! and may also be fired early by a deadline or Ctrl-C. Closing a session out
//! from under an in-flight command is how a timeout interrupts it.

use crate::connection::Host;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-shot, cloneable stop signal. Firing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns true only for the call that fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal has fired
    pub async fn fired(&self) {
        let mut rx = self.subscribe();
        // The sender lives in self, so this cannot observe a closed channel
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Fire the signal after `timeout` unless the task is aborted first
    pub fn fire_after(&self, timeout: Duration) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if signal.fire() {
                warn!("Run deadline of {:?} reached, closing sessions", timeout);
            }
        })
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What the listener did when the signal fired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    /// Sessions closed by this teardown
    pub closed: usize,
    /// Close failures, logged and not propagated
    pub errors: Vec<String>,
}

/// Spawn the background task that closes `hosts` once `stop` fires
pub(crate) fn spawn_listener(stop: &StopSignal, hosts: Vec<Arc<Host>>) -> JoinHandle<Teardown> {
    let mut rx = stop.subscribe();
    tokio::spawn(async move {
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            debug!("Stop signal dropped, tearing down");
        }

        match tokio::task::spawn_blocking(move || close_all(&hosts)).await {
            Ok(teardown) => teardown,
            Err(e) => Teardown {
                closed: 0,
                errors: vec![format!("teardown task failed: {}", e)],
            },
        }
    })
}

/// Close every host best-effort. Already-closed hosts are skipped.
pub(crate) fn close_all(hosts: &[Arc<Host>]) -> Teardown {
    let mut teardown = Teardown::default();

    for host in hosts {
        match host.close() {
            Ok(true) => teardown.closed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to close session for {}: {}", host.spec(), e);
                teardown.errors.push(format!("{}: {}", host.spec(), e));
            }
        }
    }

    info!(
        "Closed {} session(s), {} close error(s)",
        teardown.closed,
        teardown.errors.len()
    );
    teardown
}
