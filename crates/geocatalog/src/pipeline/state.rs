use std::fmt;

use serde::Serialize;

/// Lifecycle of one scan session: `Idle → Scanning → {Completed | Canceled | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Scanning,
    Completed,
    Canceled,
    Failed,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Completed => "completed",
            ScanState::Canceled => "canceled",
            ScanState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Canceled | ScanState::Failed
        )
    }

    pub fn can_transition_to(&self, next: ScanState) -> bool {
        matches!(
            (self, next),
            (ScanState::Idle, ScanState::Scanning)
                | (ScanState::Scanning, ScanState::Completed)
                | (ScanState::Scanning, ScanState::Canceled)
                | (ScanState::Scanning, ScanState::Failed)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(ScanState::Idle.can_transition_to(ScanState::Scanning));
        assert!(ScanState::Scanning.can_transition_to(ScanState::Canceled));
        assert!(!ScanState::Idle.can_transition_to(ScanState::Completed));
        assert!(!ScanState::Completed.can_transition_to(ScanState::Scanning));
        assert!(!ScanState::Failed.can_transition_to(ScanState::Idle));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ScanState::Idle.is_terminal());
        assert!(!ScanState::Scanning.is_terminal());
        assert!(ScanState::Canceled.is_terminal());
        assert_eq!(ScanState::Failed.to_string(), "failed");
    }
}
