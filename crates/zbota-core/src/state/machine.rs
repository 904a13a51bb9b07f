//! Update session states.

use std::fmt;

/// Where one update attempt currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    NotStarted,
    /// `imageNotify` sent, waiting for the device to query.
    AwaitingInitialQuery,
    /// Serving `imageBlockRequest`s.
    TransferringBlocks,
    /// Last byte served, waiting for `upgradeEndRequest`.
    AwaitingCompletion,
    Succeeded,
    Failed(String),
    TimedOut,
    Canceled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed(_)
                | SessionState::TimedOut
                | SessionState::Canceled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "Not Started"),
            SessionState::AwaitingInitialQuery => write!(f, "Awaiting Initial Query"),
            SessionState::TransferringBlocks => write!(f, "Transferring Blocks"),
            SessionState::AwaitingCompletion => write!(f, "Awaiting Completion"),
            SessionState::Succeeded => write!(f, "Succeeded"),
            SessionState::Failed(reason) => write!(f, "Failed ({})", reason),
            SessionState::TimedOut => write!(f, "Timed Out"),
            SessionState::Canceled => write!(f, "Canceled"),
        }
    }
}
