pub mod progress;
pub mod runner;
pub mod state;

pub use progress::{
    ChannelSink, CollectingSink, LogLevel, NoopSink, Phase, ScanEvent, ScanEventSink,
};
pub use runner::{ScanOrchestrator, ScanOutcome, ScanSummary};
pub use state::ScanState;
