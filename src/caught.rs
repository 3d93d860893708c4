//! Classification of handler failures into rejections and runtime errors.
//!
//! A handler either refuses a command on business grounds or fails for a
//! technical reason. The two are reported differently: a rejection becomes
//! a rejection event and a `REJECTED` status, a runtime error becomes an
//! [`ErrorRecord`] and an `ERROR` status. Configuration errors never reach
//! this module; they propagate as fatal errors.

use crate::error::ErrorRecord;
use crate::handler::{HandlerError, Rejection};
use crate::outcome::DispatchOutcome;
use crate::signal::{Signal, SignalContext, SignalStatus};

/// Producer identifier stamped on rejection events.
pub const REJECTION_PRODUCER_ID: &str = "eventfold.rejections";

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CaughtError {
    /// The handler rejected the command.
    Rejection {
        /// The rejection raised by the handler.
        rejection: Rejection,
        /// The rejected command.
        command: Signal,
    },
    /// The handler failed with a technical error.
    Runtime {
        /// The captured error.
        error: ErrorRecord,
        /// Whether [`rethrow_once`](CaughtError::rethrow_once) already
        /// surfaced it.
        rethrown: bool,
    },
    /// The failure was already handled elsewhere; nothing to report.
    Handled,
}

impl CaughtError {
    /// Classify a handler error raised while handling `command`.
    pub fn classify(error: HandlerError, command: &Signal) -> Self {
        match error {
            HandlerError::Rejected(rejection) => Self::Rejection {
                rejection,
                command: command.clone(),
            },
            failed @ HandlerError::Failed { .. } => Self::Runtime {
                error: failed.to_record(),
                rethrown: false,
            },
        }
    }

    /// The "nothing to report" sentinel.
    pub fn handled() -> Self {
        Self::Handled
    }

    /// Surface a runtime error exactly once.
    ///
    /// # Errors
    ///
    /// Returns the captured error on the first call for a `Runtime`
    /// value. Later calls, and calls on the other variants, return `Ok`.
    pub fn rethrow_once(&mut self) -> Result<(), ErrorRecord> {
        match self {
            Self::Runtime { error, rethrown } if !*rethrown => {
                *rethrown = true;
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }

    /// The rejection event, if this is a rejection.
    pub fn as_rejection(&self) -> Option<Signal> {
        match self {
            Self::Rejection { rejection, command } => Some(rejection_event(rejection, command)),
            _ => None,
        }
    }

    /// The status the command settles into, if any.
    pub fn status(&self) -> Option<SignalStatus> {
        match self {
            Self::Rejection { .. } => Some(SignalStatus::Rejected),
            Self::Runtime { .. } => Some(SignalStatus::Error),
            Self::Handled => None,
        }
    }

    /// Convert into the dispatch outcome reported to the caller.
    ///
    /// Returns `None` for `Handled`.
    pub fn into_outcome(self) -> Option<DispatchOutcome> {
        match self {
            Self::Rejection { rejection, command } => {
                Some(DispatchOutcome::Rejection(rejection_event(&rejection, &command)))
            }
            Self::Runtime { error, .. } => Some(DispatchOutcome::Failure(error)),
            Self::Handled => None,
        }
    }
}

/// Build the event announcing that `command` was rejected.
///
/// The event originates from the command and targets the same entity. It
/// carries no version: a rejection never changes the entity.
pub fn rejection_event(rejection: &Rejection, command: &Signal) -> Signal {
    let context = SignalContext::derived(command, REJECTION_PRODUCER_ID, None);
    Signal::from_event_message(rejection.to_event_message(), command.target.clone(), context)
}
