//! Acknowledgements sent to the poster of a signal, and the monitor that
//! mirrors them onto the system write side.
//!
//! The router acknowledges every posted signal exactly once: `Ok` once the
//! signal is durably accepted (or scheduled), `Error` when it is
//! unsupported or invalid. Business rejections are never acknowledged as
//! such; a rejected command was accepted, so its acknowledgement is `Ok`
//! and the rejection travels as an event.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ErrorRecord, MonitorError};
use crate::handler::Rejection;
use crate::message::{EventMessage, Message};
use crate::signal::{Signal, SignalContext, SignalId};

/// Producer identifier stamped on system events.
pub const SYSTEM_PRODUCER_ID: &str = "eventfold.system";

/// Status carried by an [`Ack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "UPPERCASE")]
pub enum AckStatus {
    /// The signal was accepted.
    Ok,
    /// The signal was refused before dispatch.
    Error(ErrorRecord),
    /// The signal was rejected by business logic. Never emitted by the
    /// router; see [`AckMonitor`].
    Rejection(Rejection),
}

impl AckStatus {
    /// Upper-case name of the status.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error(_) => "ERROR",
            Self::Rejection(_) => "REJECTION",
        }
    }
}

/// Acknowledgement of one posted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledged signal.
    pub signal_id: SignalId,
    /// Outcome of acceptance.
    pub status: AckStatus,
}

impl Ack {
    /// Successful acknowledgement.
    pub fn ok(signal_id: SignalId) -> Self {
        Self {
            signal_id,
            status: AckStatus::Ok,
        }
    }

    /// Error acknowledgement.
    pub fn error(signal_id: SignalId, error: ErrorRecord) -> Self {
        Self {
            signal_id,
            status: AckStatus::Error(error),
        }
    }

    /// Whether the signal was accepted.
    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Receiver of acknowledgements.
pub trait AckObserver: Send + Sync {
    /// Called once per posted signal.
    fn on_ack(&self, ack: &Ack);
}

/// Discards acknowledgements.
impl AckObserver for () {
    fn on_ack(&self, _ack: &Ack) {}
}

/// Forwards acknowledgements onto a channel. A closed channel drops them.
impl AckObserver for mpsc::UnboundedSender<Ack> {
    fn on_ack(&self, ack: &Ack) {
        let _ = self.send(ack.clone());
    }
}

/// Collects acknowledgements in memory.
#[derive(Debug, Default)]
pub struct AckCollector {
    acks: Mutex<Vec<Ack>>,
}

impl AckCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acknowledgement received so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn acks(&self) -> Vec<Ack> {
        self.acks.lock().expect("ack collector lock poisoned").clone()
    }
}

impl AckObserver for AckCollector {
    fn on_ack(&self, ack: &Ack) {
        self.acks
            .lock()
            .expect("ack collector lock poisoned")
            .push(ack.clone());
    }
}

/// Destination of system events.
pub trait SystemWriteSide: Send + Sync {
    /// Record one system event.
    fn post_system_event(&self, signal: Signal);
}

/// System write side keeping events in memory.
#[derive(Debug, Default)]
pub struct InMemorySystemLog {
    events: Mutex<Vec<Signal>>,
}

impl InMemorySystemLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event written so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn events(&self) -> Vec<Signal> {
        self.events.lock().expect("system log lock poisoned").clone()
    }

    /// Number of events written.
    pub fn len(&self) -> usize {
        self.events().len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SystemWriteSide for InMemorySystemLog {
    fn post_system_event(&self, signal: Signal) {
        self.events
            .lock()
            .expect("system log lock poisoned")
            .push(signal);
    }
}

impl SystemWriteSide for mpsc::UnboundedSender<Signal> {
    fn post_system_event(&self, signal: Signal) {
        let _ = self.send(signal);
    }
}

/// System event: a signal was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalAcknowledged {
    /// The accepted signal.
    pub id: SignalId,
}

impl Message for SignalAcknowledged {
    const TYPE_NAME: &'static str = "eventfold.system.SignalAcknowledged";
}

/// System event: a signal was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalErrored {
    /// The refused signal.
    pub id: SignalId,
    /// Why it was refused.
    pub error: ErrorRecord,
}

impl Message for SignalErrored {
    const TYPE_NAME: &'static str = "eventfold.system.SignalErrored";
}

/// Observer that forwards acknowledgements and mirrors each one as a
/// system event.
///
/// The monitor only knows the signals it was created with. An
/// acknowledgement for any other signal, or one with
/// [`AckStatus::Rejection`], is a bookkeeping bug in the caller and
/// panics in [`on_ack`](AckObserver::on_ack).
///
/// # Examples
///
/// ```
/// use eventfold_bus::{Ack, AckCollector, AckMonitor, AckObserver, InMemorySystemLog};
/// use eventfold_bus::{Signal, SignalAcknowledged, SignalContext};
///
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct Ping;
/// # impl eventfold_bus::Message for Ping { const TYPE_NAME: &'static str = "demo.Ping"; }
/// let signal = Signal::event(&Ping, SignalContext::default()).unwrap();
/// let caller = AckCollector::new();
/// let system = InMemorySystemLog::new();
///
/// let monitor = AckMonitor::new(&caller, &system, std::slice::from_ref(&signal));
/// monitor.on_ack(&Ack::ok(signal.id));
///
/// assert_eq!(caller.acks().len(), 1);
/// assert!(system.events()[0].is::<SignalAcknowledged>());
/// ```
pub struct AckMonitor<'a> {
    delegate: &'a dyn AckObserver,
    write_side: &'a dyn SystemWriteSide,
    signals: HashMap<SignalId, &'a Signal>,
}

impl<'a> AckMonitor<'a> {
    /// Monitor acknowledgements of `signals`.
    ///
    /// # Arguments
    ///
    /// * `delegate` - Observer that receives every acknowledgement first.
    /// * `write_side` - Destination of the mirrored system events.
    /// * `signals` - The signals whose acknowledgements are expected.
    pub fn new(delegate: &'a dyn AckObserver, write_side: &'a dyn SystemWriteSide, signals: &'a [Signal]) -> Self {
        Self {
            delegate,
            write_side,
            signals: signals.iter().map(|s| (s.id, s)).collect(),
        }
    }

    /// The system event mirroring `ack`.
    ///
    /// The event originates from the acknowledged signal and keeps its
    /// tenant and target.
    ///
    /// # Errors
    ///
    /// * [`MonitorError::UnknownSignal`] if `ack` names a signal this
    ///   monitor was not created with.
    /// * [`MonitorError::InvalidStatus`] for a rejection acknowledgement.
    pub fn system_event_for(&self, ack: &Ack) -> Result<Signal, MonitorError> {
        let signal = self
            .signals
            .get(&ack.signal_id)
            .ok_or(MonitorError::UnknownSignal(ack.signal_id))?;

        let message = match &ack.status {
            AckStatus::Ok => EventMessage::of(&SignalAcknowledged { id: signal.id }),
            AckStatus::Error(error) => EventMessage::of(&SignalErrored {
                id: signal.id,
                error: error.clone(),
            }),
            AckStatus::Rejection(_) => {
                return Err(MonitorError::InvalidStatus {
                    signal_id: signal.id,
                    status: ack.status.name(),
                });
            }
        }
        .map_err(|e| MonitorError::Encode(e.to_string()))?;

        let context = SignalContext::derived(signal, SYSTEM_PRODUCER_ID, None);
        Ok(Signal::from_event_message(message, signal.target.clone(), context))
    }
}

impl AckObserver for AckMonitor<'_> {
    /// Forward `ack` to the delegate, then write its system event.
    ///
    /// # Panics
    ///
    /// Panics if [`system_event_for`](AckMonitor::system_event_for) fails:
    /// both failure modes are caller bugs.
    fn on_ack(&self, ack: &Ack) {
        self.delegate.on_ack(ack);
        match self.system_event_for(ack) {
            Ok(event) => self.write_side.post_system_event(event),
            Err(e) => panic!("acknowledgement monitor invariant violated: {e}"),
        }
    }
}

impl std::fmt::Debug for AckMonitor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckMonitor")
            .field("signals", &self.signals.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{ProjectAlreadyStarted, create};
    use crate::signal::TenantId;

    fn tenant_signal() -> Signal {
        let mut signal = create("p-1", "Apollo");
        signal.context.tenant = Some(TenantId::new("acme"));
        signal
    }

    #[test]
    fn ok_ack_mirrored_as_acknowledged() {
        let signal = tenant_signal();
        let caller = AckCollector::new();
        let system = InMemorySystemLog::new();
        let monitor = AckMonitor::new(&caller, &system, std::slice::from_ref(&signal));

        monitor.on_ack(&Ack::ok(signal.id));

        assert_eq!(caller.acks(), vec![Ack::ok(signal.id)]);
        let events = system.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        let body: SignalAcknowledged = event.message().expect("decode should succeed");
        assert_eq!(body.id, signal.id);
        assert_eq!(event.context.origin, Some(signal.id));
        assert_eq!(event.tenant(), signal.tenant());
        assert_eq!(event.context.producer_id.as_deref(), Some(SYSTEM_PRODUCER_ID));
    }

    #[test]
    fn error_ack_carries_original_error() {
        let signal = tenant_signal();
        let system = InMemorySystemLog::new();
        let monitor = AckMonitor::new(&(), &system, std::slice::from_ref(&signal));
        let error = ErrorRecord::new("InvalidSignal", "name: must not be empty").with_code(3);

        let event = monitor
            .system_event_for(&Ack::error(signal.id, error.clone()))
            .expect("event should be built");
        let body: SignalErrored = event.message().expect("decode should succeed");
        assert_eq!(body.error, error);
    }

    #[test]
    fn unknown_signal_is_reported() {
        let signal = tenant_signal();
        let system = InMemorySystemLog::new();
        let monitor = AckMonitor::new(&(), &system, std::slice::from_ref(&signal));
        let stranger = SignalId::new();

        let err = monitor
            .system_event_for(&Ack::ok(stranger))
            .expect_err("unknown id should fail");
        assert_eq!(err, MonitorError::UnknownSignal(stranger));
    }

    // A rejected command is acknowledged OK; the rejection travels as an
    // event. A REJECTION acknowledgement therefore never reaches the
    // monitor from the router, and one arriving anyway is a bug.
    #[test]
    fn rejection_ack_is_invalid_status() {
        let signal = tenant_signal();
        let system = InMemorySystemLog::new();
        let monitor = AckMonitor::new(&(), &system, std::slice::from_ref(&signal));
        let rejection = Rejection::new(&ProjectAlreadyStarted { id: "p-1".into() })
            .expect("rejection should serialize");

        let err = monitor
            .system_event_for(&Ack {
                signal_id: signal.id,
                status: AckStatus::Rejection(rejection),
            })
            .expect_err("rejection ack should fail");
        assert!(matches!(err, MonitorError::InvalidStatus { status: "REJECTION", .. }));
    }

    #[test]
    #[should_panic(expected = "unknown signal ID")]
    fn on_ack_panics_for_unknown_signal() {
        let system = InMemorySystemLog::new();
        let monitor = AckMonitor::new(&(), &system, &[]);
        monitor.on_ack(&Ack::ok(SignalId::new()));
    }

    #[tokio::test]
    async fn channel_observer_forwards_acks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SignalId::new();
        tx.on_ack(&Ack::ok(id));
        let ack = rx.recv().await.expect("ack should arrive");
        assert!(ack.is_ok());
        assert_eq!(ack.signal_id, id);
    }

    #[test]
    fn ack_serializes_status_tag() {
        let id = SignalId::new();
        let json = serde_json::to_value(Ack::ok(id)).expect("serialization should succeed");
        assert_eq!(json["status"]["status"], "OK");
        let back: Ack = serde_json::from_value(json).expect("deserialization should succeed");
        assert_eq!(back, Ack::ok(id));
    }
}
