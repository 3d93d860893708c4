//! Result of dispatching a signal.

use crate::error::ErrorRecord;
use crate::signal::{Signal, SignalStatus};

/// What happened when a signal was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handled; carries the produced events in emission order.
    ///
    /// Empty for scheduled signals and for handlers producing nothing.
    Success(Vec<Signal>),
    /// Refused on business grounds; carries the rejection event.
    Rejection(Signal),
    /// Failed with a technical or routing error.
    Failure(ErrorRecord),
}

impl DispatchOutcome {
    /// Whether the signal was handled successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the signal was rejected.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejection(_))
    }

    /// Whether the signal failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// The produced events; empty unless `Success`.
    pub fn events(&self) -> &[Signal] {
        match self {
            Self::Success(events) => events,
            _ => &[],
        }
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Failure(record) => Some(record),
            _ => None,
        }
    }

    /// The status a dispatched signal settles into.
    pub fn status(&self) -> SignalStatus {
        match self {
            Self::Success(_) => SignalStatus::Ok,
            Self::Rejection(_) => SignalStatus::Rejected,
            Self::Failure(_) => SignalStatus::Error,
        }
    }
}
