//! Runs a scan session on a dedicated thread.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{debug, error, info};

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::pipeline::{ChannelSink, ScanEvent, ScanOrchestrator, ScanOutcome};
use crate::scanner::CancellationToken;

// Re-export crossbeam_channel for callers draining the event stream
pub use crossbeam_channel;

pub struct ScanWorker;

impl ScanWorker {
    /// Starts a session for `config` on a new thread.
    pub fn spawn(config: ScanConfig) -> Result<ScanHandle, ScanError> {
        Self::spawn_orchestrator(ScanOrchestrator::new(config))
    }

    /// Starts a prepared orchestrator, e.g. one with custom drivers.
    pub fn spawn_orchestrator(orchestrator: ScanOrchestrator) -> Result<ScanHandle, ScanError> {
        let (sender, events) = unbounded::<ScanEvent>();
        let cancel = orchestrator.cancellation_token();
        let root = orchestrator.config().root_directory.display().to_string();

        let thread = thread::Builder::new()
            .name("geocatalog-scan".to_string())
            .spawn(move || {
                let mut orchestrator = orchestrator;
                let sink = ChannelSink::new(sender);
                debug!("Scan worker started");
                let outcome = orchestrator.run(&sink);
                debug!("Scan worker finished: {}", outcome.state());
                outcome
            })
            .map_err(|e| ScanError::SpawnFailed(e.to_string()))?;

        info!("Started scan worker for {}", root);

        Ok(ScanHandle {
            events,
            cancel,
            thread,
        })
    }
}

/// Caller's side of a running scan.
pub struct ScanHandle {
    events: Receiver<ScanEvent>,
    cancel: CancellationToken,
    thread: JoinHandle<ScanOutcome>,
}

impl ScanHandle {
    /// Ordered event stream. Disconnects after the terminal event.
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    /// Requests cancellation. The worker stops before its next item and
    /// commits nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the next event, up to `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<ScanEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Waits for the worker and returns the session outcome.
    pub fn join(self) -> ScanOutcome {
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Scan worker panicked: {:?}", e);
                ScanOutcome::Failed(ScanError::WorkerPanicked)
            }
        }
    }

    /// Drains every remaining event, then joins.
    pub fn wait(self) -> (Vec<ScanEvent>, ScanOutcome) {
        let events: Vec<ScanEvent> = self.events.iter().collect();
        (events, self.join())
    }
}
