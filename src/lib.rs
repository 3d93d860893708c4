//! Signal routing and event-sourced aggregate dispatch.
//!
//! A [`SignalBus`] validates, persists and routes commands and events.
//! Commands reach an [`AggregateRepository`], which runs one actor per
//! entity, or a [`HandlerSet`] method. Handler failures come back as
//! [`DispatchOutcome`] values: business refusals become rejection events,
//! technical failures become error records.

mod ack;
pub use ack::{
    Ack, AckCollector, AckMonitor, AckObserver, AckStatus, InMemorySystemLog, SYSTEM_PRODUCER_ID, SignalAcknowledged,
    SignalErrored, SystemWriteSide,
};
mod actor;
pub use actor::AggregateHandle;
mod aggregate;
pub use aggregate::{Aggregate, AggregateModel, AggregateRoot, Applies, HandlerContext, Handles};
mod bus;
pub use bus::{RescheduleReport, SignalBus, SignalBusBuilder};
mod cache;
pub use cache::{CachedEntity, EntityCache, EntityKey};
mod caught;
pub use caught::{CaughtError, REJECTION_PRODUCER_ID, rejection_event};
mod error;
pub use error::{
    AggregateError, BusError, CacheError, ConfigurationError, DispatchError, ErrorRecord, MonitorError,
    RegistrationError, SignalError, StorageError,
};
mod handler;
pub use handler::{HandlerError, HandlerMethod, HandlerResult, HandlerSet, ParamShape, Rejection};
mod message;
pub use message::{Command, ConstraintViolation, EventMessage, IntoEvents, Message, SignalClass};
mod mismatch;
pub use mismatch::{MismatchKind, ValueMismatch};
mod outcome;
pub use outcome::DispatchOutcome;
mod registry;
pub use registry::{Consumer, ConsumerCategory, DispatchFuture, HandlerRegistry, Ownership, SignalDispatcher};
mod repository;
pub use repository::{AggregateRepository, AggregateRepositoryBuilder};
mod signal;
pub use signal::{Signal, SignalContext, SignalId, SignalKind, SignalStatus, TenantId, now_millis};
mod signal_store;
pub use signal_store::{InMemorySignalStore, SignalRecord, SignalStore};
mod snapshot;
pub use snapshot::{Lifecycle, Snapshot};
mod storage;
pub use storage::{EntityStorage, FileStorage, InMemoryStorage};
mod sweep;
pub use sweep::{SweepConfig, SweepHandle};
