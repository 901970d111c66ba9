use std::cell::Cell;
use std::sync::Mutex;

use crossbeam_channel::Sender;
use serde::Serialize;

use super::runner::ScanSummary;

/// Severity of a [`ScanEvent::Log`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Events emitted by a scan session, in order. Exactly one terminal event
/// (`Completed`, `Failed` or `Canceled`) ends every session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScanEvent {
    /// Percentage in `0..=100`, strictly increasing within a session.
    Progress { percent: u8 },
    Log { level: LogLevel, message: String },
    Completed(ScanSummary),
    Failed { reason: String },
    Canceled { reason: String },
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanEvent::Completed(_) | ScanEvent::Failed { .. } | ScanEvent::Canceled { .. }
        )
    }
}

pub trait ScanEventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

/// Discards every event.
pub struct NoopSink;

impl ScanEventSink for NoopSink {
    fn emit(&self, _event: ScanEvent) {}
}

/// Forwards events over a crossbeam channel. A dropped receiver is not an
/// error; the scan keeps running.
pub struct ChannelSink {
    sender: Sender<ScanEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ScanEvent>) -> Self {
        Self { sender }
    }
}

impl ScanEventSink for ChannelSink {
    fn emit(&self, event: ScanEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Scan event receiver dropped");
        }
    }
}

/// Keeps every event in memory. Handy in tests.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ScanEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Every progress percentage, in emission order.
    pub fn progress(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ScanEvent::Progress { percent } => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl ScanEventSink for CollectingSink {
    fn emit(&self, event: ScanEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Pipeline phase and its share of the progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    Extraction,
    Retirement,
    Commit,
}

impl Phase {
    /// `(start, end)` percentages.
    pub fn band(self) -> (u8, u8) {
        match self {
            Phase::Discovery => (0, 10),
            Phase::Extraction => (10, 90),
            Phase::Retirement => (90, 95),
            Phase::Commit => (95, 100),
        }
    }
}

/// Session-side front of a sink: turns phase fractions into monotonic
/// integer percentages and mirrors log events into tracing.
pub(crate) struct EventReporter<'a> {
    sink: &'a dyn ScanEventSink,
    last_percent: Cell<Option<u8>>,
}

impl<'a> EventReporter<'a> {
    pub(crate) fn new(sink: &'a dyn ScanEventSink) -> Self {
        Self {
            sink,
            last_percent: Cell::new(None),
        }
    }

    /// Reports `done` of `total` units of work in `phase`.
    pub(crate) fn phase_progress(&self, phase: Phase, done: usize, total: usize) {
        let (start, end) = phase.band();
        let fraction = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).clamp(0.0, 1.0)
        };
        let percent = start as f64 + (end - start) as f64 * fraction;
        self.progress(percent.floor() as u8);
    }

    pub(crate) fn phase_start(&self, phase: Phase) {
        self.progress(phase.band().0);
    }

    fn progress(&self, percent: u8) {
        let percent = percent.min(100);
        if self.last_percent.get().is_some_and(|last| percent <= last) {
            return;
        }
        self.last_percent.set(Some(percent));
        self.sink.emit(ScanEvent::Progress { percent });
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error | LogLevel::Critical => tracing::error!("{}", message),
        }
        self.sink.emit(ScanEvent::Log { level, message });
    }

    pub(crate) fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub(crate) fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub(crate) fn terminal(&self, event: ScanEvent) {
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_strictly_increasing() {
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);

        reporter.phase_start(Phase::Discovery);
        reporter.phase_start(Phase::Discovery);
        for done in 0..=1000 {
            reporter.phase_progress(Phase::Extraction, done, 1000);
        }
        reporter.phase_progress(Phase::Discovery, 1, 1);
        reporter.phase_start(Phase::Commit);
        reporter.phase_progress(Phase::Commit, 1, 1);

        let progress = sink.progress();
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert!(progress.contains(&90));
        assert!(!progress.contains(&96));
    }

    #[test]
    fn test_empty_phase_counts_as_done() {
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        reporter.phase_progress(Phase::Extraction, 0, 0);
        assert_eq!(sink.progress(), vec![90]);
    }

    #[test]
    fn test_log_events_reach_sink() {
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        reporter.warn("Cannot read roads.dbf");

        assert_eq!(
            sink.events(),
            vec![ScanEvent::Log {
                level: LogLevel::Warning,
                message: "Cannot read roads.dbf".to_string()
            }]
        );
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelSink::new(tx);
        sink.emit(ScanEvent::Progress { percent: 5 });
        assert_eq!(rx.recv().unwrap(), ScanEvent::Progress { percent: 5 });

        drop(rx);
        sink.emit(ScanEvent::Progress { percent: 6 });
    }

    #[test]
    fn test_terminal_events() {
        assert!(ScanEvent::Failed {
            reason: "disk full".into()
        }
        .is_terminal());
        assert!(!ScanEvent::Progress { percent: 1 }.is_terminal());
    }
}
