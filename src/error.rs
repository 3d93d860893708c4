//! Crate-level error types for registration, routing, storage, and dispatch.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::EntityKey;
use crate::handler::HandlerError;
use crate::message::ConstraintViolation;
use crate::registry::ConsumerCategory;
use crate::signal::SignalId;

/// Serializable capture of a failure.
///
/// Recorded against signals in the [`SignalStore`](crate::SignalStore),
/// carried in error acknowledgements, and held by
/// [`DispatchOutcome::Failure`](crate::DispatchOutcome::Failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Short name of the error type (e.g. `"UnsupportedSignal"`).
    pub error_type: String,
    /// Human-readable message, usually the error's `Display` output.
    pub message: String,
    /// Numeric code within the error type. `0` when unspecified.
    #[serde(default)]
    pub code: i32,
    /// Extra structured details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl ErrorRecord {
    /// Create a record with the given type and message.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            code: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// Capture an arbitrary error under the given type name.
    pub fn from_error<E>(error_type: impl Into<String>, error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self::new(error_type, error.to_string())
    }

    /// Set the numeric code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Attach a structured attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Error returned when a consumer cannot be added to a
/// [`HandlerRegistry`](crate::HandlerRegistry).
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The signal type is already owned by another consumer.
    ///
    /// Raised when the owner belongs to the other category (dispatcher vs.
    /// handler), or when the registry is exclusive and the owner is another
    /// instance of the same category.
    #[error(
        "cannot register {category} `{consumer}`: signal type `{signal_type}` \
         is already owned by {owner_category} `{owner}`"
    )]
    Conflict {
        /// The contested signal type.
        signal_type: String,
        /// Identifier of the consumer that already owns the type.
        owner: String,
        /// Category of the current owner.
        owner_category: ConsumerCategory,
        /// Identifier of the consumer being registered.
        consumer: String,
        /// Category of the consumer being registered.
        category: ConsumerCategory,
    },

    /// A handler set declares two methods for the same signal type.
    #[error("handler set `{consumer}` declares more than one method for `{signal_type}`")]
    DuplicateMethod {
        /// Identifier of the offending handler set.
        consumer: String,
        /// The signal type declared twice.
        signal_type: String,
    },
}

/// A defect in how an aggregate or handler was wired.
///
/// Configuration errors are never classified as runtime failures: they
/// propagate out of the bus as [`BusError::Configuration`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// No handler is registered for a command dispatched to the aggregate.
    #[error("aggregate `{aggregate_type}` has no handler for command `{signal_type}`")]
    MissingHandler {
        /// The aggregate type name.
        aggregate_type: String,
        /// The unhandled command type.
        signal_type: String,
    },

    /// A produced or replayed event has no applier and is not state-neutral.
    #[error("aggregate `{aggregate_type}` has no applier for event `{signal_type}`")]
    MissingApplier {
        /// The aggregate type name.
        aggregate_type: String,
        /// The event type that could not be applied.
        signal_type: String,
    },
}

/// A signal rejected by the router before it reaches any consumer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    /// No consumer is registered for the signal type.
    #[error("signal type `{signal_type}` is not supported by any registered consumer")]
    Unsupported {
        /// The unsupported signal type.
        signal_type: String,
    },

    /// The bus is multitenant but the signal carries no tenant.
    #[error("signal `{signal_id}` does not specify a tenant")]
    MissingTenant {
        /// The offending signal.
        signal_id: SignalId,
    },

    /// The signal payload failed structural validation.
    #[error("signal `{signal_id}` of type `{signal_type}` is invalid: {}", join_violations(.violations))]
    Invalid {
        /// The offending signal.
        signal_id: SignalId,
        /// The signal type whose validator rejected the payload.
        signal_type: String,
        /// Every violated constraint.
        violations: Vec<ConstraintViolation>,
    },
}

impl SignalError {
    /// Convert into an [`ErrorRecord`] with a stable type name and code.
    pub fn to_record(&self) -> ErrorRecord {
        let record = match self {
            Self::Unsupported { .. } => ErrorRecord::from_error("UnsupportedSignal", self).with_code(1),
            Self::MissingTenant { .. } => ErrorRecord::from_error("MissingTenant", self).with_code(2),
            Self::Invalid { .. } => ErrorRecord::from_error("InvalidSignal", self).with_code(3),
        };
        match self {
            Self::Invalid { violations, .. } => record.with_attribute(
                "violations",
                serde_json::to_value(violations).unwrap_or(Value::Null),
            ),
            _ => record,
        }
    }
}

fn join_violations(violations: &[ConstraintViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of a backing store or signal store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A key component cannot be used as a storage name.
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: EntityKey,
        /// Why the key was rejected.
        reason: &'static str,
    },
}

/// Error returned by [`EntityCache`](crate::EntityCache) operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `stop_caching` was called for an entity with no cached value.
    ///
    /// This is a caller bug, not a runtime condition.
    #[error("entity `{0}` is not cached")]
    NotCached(EntityKey),

    /// Flushing the cached entity failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of an [`Aggregate`](crate::Aggregate) dispatch or replay.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// The aggregate model is missing a handler or applier.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The command handler rejected the command or failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// An event payload did not decode into its declared message type.
    #[error("failed to decode event `{event_type}`: {source}")]
    Decode {
        /// The event type being applied.
        event_type: String,
        /// The underlying decoding error.
        source: serde_json::Error,
    },
}

/// Error returned by a [`SignalDispatcher`](crate::SignalDispatcher).
///
/// Only the `Configuration` variant is fatal; the router records the others
/// against the signal as technical errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher is wired incorrectly.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The aggregate actor has exited and cannot take the signal.
    #[error("aggregate actor is no longer running")]
    ActorGone,

    /// Loading or storing the target entity failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DispatchError {
    /// Convert a non-fatal dispatch error into an [`ErrorRecord`].
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            Self::Configuration(_) => ErrorRecord::from_error("ConfigurationError", self),
            Self::ActorGone => ErrorRecord::from_error("ActorGone", self),
            Self::Storage(_) => ErrorRecord::from_error("StorageError", self),
        }
    }
}

/// Error returned by [`AckMonitor`](crate::AckMonitor) lookups.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    /// The acknowledged signal was never posted through the monitor.
    #[error("unknown signal ID encountered: `{0}`")]
    UnknownSignal(SignalId),

    /// The acknowledgement carries a status the monitor never expects.
    #[error("signal `{signal_id}` has invalid acknowledgement status `{status}`")]
    InvalidStatus {
        /// The acknowledged signal.
        signal_id: SignalId,
        /// Name of the unexpected status.
        status: &'static str,
    },

    /// The system event could not be serialized.
    #[error("failed to encode system event: {0}")]
    Encode(String),
}

/// Fatal error returned by [`SignalBus`](crate::SignalBus) operations.
///
/// Runtime failures of handlers never surface here; they are classified
/// and returned as [`DispatchOutcome`](crate::DispatchOutcome) values.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// An aggregate or handler is wired incorrectly.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Registering a consumer failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The signal store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_signal_record_has_stable_type_and_code() {
        let err = SignalError::Unsupported {
            signal_type: "test.CreateProject".to_string(),
        };
        let record = err.to_record();
        assert_eq!(record.error_type, "UnsupportedSignal");
        assert_eq!(record.code, 1);
        assert!(record.message.contains("test.CreateProject"));
    }

    #[test]
    fn invalid_signal_lists_every_violation() {
        let err = SignalError::Invalid {
            signal_id: SignalId::new(),
            signal_type: "test.CreateProject".to_string(),
            violations: vec![
                ConstraintViolation::new("name", "must not be empty"),
                ConstraintViolation::new("id", "must not be empty"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("name: must not be empty"));
        assert!(message.contains("id: must not be empty"));

        let record = err.to_record();
        assert_eq!(record.code, 3);
        assert_eq!(record.attributes["violations"][0]["field"], "name");
    }

    #[test]
    fn configuration_error_names_aggregate_and_type() {
        let err = ConfigurationError::MissingApplier {
            aggregate_type: "project".to_string(),
            signal_type: "test.TaskAdded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "aggregate `project` has no applier for event `test.TaskAdded`"
        );
    }

    #[test]
    fn registration_conflict_display() {
        let err = RegistrationError::Conflict {
            signal_type: "test.StartProject".to_string(),
            owner: "aggregate:project".to_string(),
            owner_category: ConsumerCategory::Dispatcher,
            consumer: "starter".to_string(),
            category: ConsumerCategory::Handler,
        };
        assert_eq!(
            err.to_string(),
            "cannot register handler `starter`: signal type `test.StartProject` \
             is already owned by dispatcher `aggregate:project`"
        );
    }

    #[test]
    fn storage_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn dispatch_error_actor_gone_record() {
        let record = DispatchError::ActorGone.to_record();
        assert_eq!(record.error_type, "ActorGone");
        assert_eq!(record.message, "aggregate actor is no longer running");
    }

    #[test]
    fn error_record_serde_skips_empty_attributes() {
        let record = ErrorRecord::new("Boom", "it broke");
        let json = serde_json::to_string(&record).expect("serialization should succeed");
        assert!(!json.contains("attributes"));
        let back: ErrorRecord = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, record);
    }

    // Errors cross actor threads and tokio tasks.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<BusError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<AggregateError>();
            assert_send_sync::<CacheError>();
        }
    };
}
