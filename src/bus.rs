//! The signal bus: validation, persistence, routing and outcome reporting.
//!
//! Every posted signal walks the same pipeline:
//!
//! 1. **Type check.** No consumer for the type: `Failure`, nothing stored.
//! 2. **Validation.** Missing tenant on a multitenant bus, missing command
//!    target, or a structural violation: stored as `ERROR`, `Failure`.
//! 3. **Scheduling.** A signal due in the future is stored as `SCHEDULED`
//!    and left for [`SignalBus::reschedule`].
//! 4. **Persistence.** Stored as `RECEIVED` and acknowledged `OK`.
//! 5. **Delivery.** Commands go to their one consumer, events to every
//!    subscriber. Handler failures are classified, never propagated.
//! 6. **Settlement.** The record moves to `OK`, `REJECTED` or `ERROR`;
//!    produced events and rejection events are published in turn.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::Instrument;

use crate::ack::{Ack, AckMonitor, AckObserver, SystemWriteSide};
use crate::caught::CaughtError;
use crate::error::{BusError, DispatchError, ErrorRecord, RegistrationError, SignalError};
use crate::handler::HandlerSet;
use crate::message::{ConstraintViolation, SignalClass};
use crate::outcome::DispatchOutcome;
use crate::registry::{Consumer, HandlerRegistry, Ownership, SignalDispatcher};
use crate::signal::{Signal, SignalId, SignalKind, SignalStatus, now_millis};
use crate::signal_store::{InMemorySignalStore, SignalRecord, SignalStore};
use crate::sweep::{SweepConfig, SweepHandle, spawn_sweeper};

/// Summary of one rescheduling sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescheduleReport {
    /// Signals claimed and delivered by this sweep.
    pub delivered: usize,
    /// Scheduled signals not yet due.
    pub pending: usize,
    /// Due signals another sweep claimed first.
    pub already_claimed: usize,
}

/// Routes commands and events to their registered consumers.
///
/// Commands have exactly one consumer: a [`SignalDispatcher`] such as an
/// [`AggregateRepository`](crate::AggregateRepository), or a method of a
/// [`HandlerSet`]. Events have any number of subscribers.
///
/// The bus is safe to post to from many tasks at once. `Clone` is cheap:
/// all fields are `Arc`-wrapped.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use eventfold_bus::{AckCollector, InMemorySignalStore, SignalBus};
///
/// # async fn example(signal: eventfold_bus::Signal) -> Result<(), eventfold_bus::BusError> {
/// let bus = SignalBus::builder()
///     .signal_store(Arc::new(InMemorySignalStore::new()))
///     .open()
///     .await?;
///
/// let acks = AckCollector::new();
/// let outcome = bus.post(signal, &acks).await?;
/// println!("{:?}", outcome.status());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SignalBus {
    commands: Arc<HandlerRegistry>,
    events: Arc<HandlerRegistry>,
    store: Arc<dyn SignalStore>,
    system: Option<Arc<dyn SystemWriteSide>>,
    multitenant: bool,
}

impl SignalBus {
    /// Start building a bus.
    pub fn builder() -> SignalBusBuilder {
        SignalBusBuilder::new()
    }

    /// Whether signals must carry a tenant.
    pub fn is_multitenant(&self) -> bool {
        self.multitenant
    }

    fn registry_for(&self, kind: SignalKind) -> &HandlerRegistry {
        match kind {
            SignalKind::Command => &self.commands,
            SignalKind::Event => &self.events,
        }
    }

    /// Register a command dispatcher for every class it declares.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Conflict`] if any declared command type
    /// already has a consumer. Nothing is registered in that case.
    pub fn register_dispatcher<D>(&self, dispatcher: Arc<D>) -> Result<(), RegistrationError>
    where
        D: SignalDispatcher + 'static,
    {
        self.commands.register(Consumer::Dispatcher(dispatcher))
    }

    /// Register a set of command handler methods.
    ///
    /// # Returns
    ///
    /// The registered set, for later [`unregister`](SignalBus::unregister).
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] on a conflict or a duplicate method.
    pub fn register_handler(&self, handlers: HandlerSet) -> Result<Arc<HandlerSet>, RegistrationError> {
        let handlers = Arc::new(handlers);
        self.commands.register(Consumer::Handler(Arc::clone(&handlers)))?;
        Ok(handlers)
    }

    /// Subscribe a set of event handler methods.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if the same set id already subscribes
    /// to a declared type, a dispatcher owns one, or the set declares a
    /// type twice.
    pub fn subscribe(&self, handlers: HandlerSet) -> Result<Arc<HandlerSet>, RegistrationError> {
        let handlers = Arc::new(handlers);
        self.events.register(Consumer::Handler(Arc::clone(&handlers)))?;
        Ok(handlers)
    }

    /// Subscribe an event dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if a handler set owns a declared type
    /// or the dispatcher already subscribes to one.
    pub fn subscribe_dispatcher<D>(&self, dispatcher: Arc<D>) -> Result<(), RegistrationError>
    where
        D: SignalDispatcher + 'static,
    {
        self.events.register(Consumer::Dispatcher(dispatcher))
    }

    /// Remove a command consumer. Returns the command types released.
    pub fn unregister(&self, consumer: &Consumer) -> Vec<String> {
        self.commands.unregister(consumer)
    }

    /// Remove an event subscriber. Returns the event types released.
    pub fn unsubscribe(&self, consumer: &Consumer) -> Vec<String> {
        self.events.unregister(consumer)
    }

    /// Whether any consumer accepts `signal_type`.
    pub fn supports(&self, signal_type: &str) -> bool {
        self.commands.supports(signal_type) || self.events.supports(signal_type)
    }

    /// Every command and event type with a consumer, sorted.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types = self.commands.signal_types();
        types.extend(self.events.signal_types());
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Unregister every consumer.
    pub fn close(&self) {
        self.commands.clear();
        self.events.clear();
        tracing::debug!("signal bus closed");
    }

    /// The stored record of a signal.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Storage`] if the signal store fails.
    pub fn record(&self, id: &SignalId) -> Result<Option<SignalRecord>, BusError> {
        Ok(self.store.record(id)?)
    }

    /// Post one signal and run it to its outcome.
    ///
    /// `observer` receives exactly one acknowledgement. If the bus has a
    /// system write side, the acknowledgement is also mirrored there as a
    /// system event.
    ///
    /// # Returns
    ///
    /// The outcome of the signal. Unsupported and invalid signals, business
    /// rejections and handler failures are all outcomes, not errors.
    ///
    /// # Errors
    ///
    /// * [`BusError::Configuration`] if an aggregate is missing a handler
    ///   or applier.
    /// * [`BusError::Storage`] if the signal store fails.
    pub async fn post(&self, signal: Signal, observer: &dyn AckObserver) -> Result<DispatchOutcome, BusError> {
        match &self.system {
            Some(system) => {
                let signals = std::slice::from_ref(&signal);
                let monitor = AckMonitor::new(observer, system.as_ref(), signals);
                self.post_observed(signal.clone(), &monitor).await
            }
            None => self.post_observed(signal, observer).await,
        }
    }

    /// Post several signals in order under one acknowledgement monitor.
    ///
    /// # Returns
    ///
    /// One outcome per signal, in input order.
    ///
    /// # Errors
    ///
    /// See [`post`](SignalBus::post). Signals after a fatal error are not
    /// posted.
    pub async fn post_all(
        &self,
        signals: Vec<Signal>,
        observer: &dyn AckObserver,
    ) -> Result<Vec<DispatchOutcome>, BusError> {
        let mut outcomes = Vec::with_capacity(signals.len());
        match &self.system {
            Some(system) => {
                let monitor = AckMonitor::new(observer, system.as_ref(), &signals);
                for signal in &signals {
                    outcomes.push(self.post_observed(signal.clone(), &monitor).await?);
                }
            }
            None => {
                for signal in signals {
                    outcomes.push(self.post_observed(signal, observer).await?);
                }
            }
        }
        Ok(outcomes)
    }

    async fn post_observed(&self, signal: Signal, ack: &dyn AckObserver) -> Result<DispatchOutcome, BusError> {
        let span = tracing::debug_span!(
            "post",
            signal_id = %signal.id,
            signal_type = %signal.signal_type
        );
        self.run_pipeline(signal, ack).instrument(span).await
    }

    async fn run_pipeline(&self, signal: Signal, ack: &dyn AckObserver) -> Result<DispatchOutcome, BusError> {
        let Some(class) = self.registry_for(signal.kind).class_of(&signal.signal_type) else {
            tracing::debug!("no consumer for signal type");
            let error = unsupported(&signal);
            ack.on_ack(&Ack::error(signal.id, error.clone()));
            return Ok(DispatchOutcome::Failure(error));
        };

        if let Err(e) = self.validate(&signal, class) {
            tracing::debug!(error = %e, "signal failed validation");
            let error = e.to_record();
            self.store.save_with_status(&signal, SignalStatus::Error, Some(&error))?;
            ack.on_ack(&Ack::error(signal.id, error.clone()));
            return Ok(DispatchOutcome::Failure(error));
        }

        if signal.context.is_delayed(now_millis()) {
            self.store.save_with_status(&signal, SignalStatus::Scheduled, None)?;
            tracing::info!(deliver_at = signal.context.deliver_at(), "signal scheduled");
            ack.on_ack(&Ack::ok(signal.id));
            return Ok(DispatchOutcome::Success(Vec::new()));
        }

        self.store.save_with_status(&signal, SignalStatus::Received, None)?;
        tracing::info!("signal accepted");
        ack.on_ack(&Ack::ok(signal.id));

        let (outcome, follow_ups) = self.process(&signal).await?;
        self.publish(follow_ups).await?;
        Ok(outcome)
    }

    fn validate(&self, signal: &Signal, class: SignalClass) -> Result<(), SignalError> {
        if self.multitenant && signal.tenant().is_none() {
            return Err(SignalError::MissingTenant { signal_id: signal.id });
        }

        let mut violations = Vec::new();
        if signal.kind == SignalKind::Command && signal.target.as_deref().is_none_or(str::is_empty) {
            violations.push(ConstraintViolation::new("target", "must not be empty"));
        }
        if let Err(found) = class.validate(&signal.payload) {
            violations.extend(found);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SignalError::Invalid {
                signal_id: signal.id,
                signal_type: signal.signal_type.clone(),
                violations,
            })
        }
    }

    /// Deliver a stored signal and settle its record.
    ///
    /// Returns the settled outcome and the events to publish next.
    async fn process(&self, signal: &Signal) -> Result<(DispatchOutcome, Vec<Signal>), BusError> {
        let outcomes = self.deliver(signal).await?;
        let outcome = if outcomes.is_empty() && signal.kind == SignalKind::Command {
            // Unregistered between the type check and delivery.
            DispatchOutcome::Failure(unsupported(signal))
        } else {
            merge(&outcomes)
        };
        self.settle(signal, &outcome)?;
        let follow_ups = outcomes.iter().flat_map(follow_ups).collect();
        Ok((outcome, follow_ups))
    }

    async fn deliver(&self, signal: &Signal) -> Result<Vec<DispatchOutcome>, BusError> {
        let consumers = self.registry_for(signal.kind).consumers_for(&signal.signal_type);
        let mut outcomes = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            tracing::debug!(consumer = consumer.id(), "delivering signal");
            let outcome = match consumer {
                Consumer::Dispatcher(dispatcher) => run_dispatcher(dispatcher.as_ref(), signal.clone()).await?,
                Consumer::Handler(handlers) => invoke_handler(&handlers, signal),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn settle(&self, signal: &Signal, outcome: &DispatchOutcome) -> Result<(), BusError> {
        match outcome {
            DispatchOutcome::Success(_) => {
                self.store.save_with_status(signal, SignalStatus::Ok, None)?;
            }
            DispatchOutcome::Rejection(event) => {
                tracing::debug!(
                    signal_id = %signal.id,
                    rejection = %event.signal_type,
                    "signal rejected"
                );
                let record = rejection_record(event);
                self.store.save_with_status(signal, SignalStatus::Rejected, Some(&record))?;
            }
            DispatchOutcome::Failure(error) => {
                tracing::error!(
                    signal_id = %signal.id,
                    signal_type = %signal.signal_type,
                    error = %error,
                    "signal handling failed"
                );
                self.store.save_with_status(signal, SignalStatus::Error, Some(error))?;
            }
        }
        Ok(())
    }

    /// Persist and deliver produced events, breadth first.
    ///
    /// An event without subscribers is stored and settled `OK`.
    async fn publish(&self, events: Vec<Signal>) -> Result<(), BusError> {
        let mut queue: VecDeque<Signal> = events.into();
        while let Some(event) = queue.pop_front() {
            self.store.save_with_status(&event, SignalStatus::Received, None)?;
            let (_, follow_ups) = self.process(&event).await?;
            queue.extend(follow_ups);
        }
        Ok(())
    }

    /// Deliver every scheduled signal whose delivery time has passed.
    ///
    /// Each due signal is claimed atomically before delivery, so sweeps
    /// running concurrently (or alongside live posting) deliver it once.
    ///
    /// # Errors
    ///
    /// * [`BusError::Configuration`] if an aggregate is miswired.
    /// * [`BusError::Storage`] if the signal store fails.
    pub async fn reschedule(&self) -> Result<RescheduleReport, BusError> {
        self.reschedule_due(now_millis())
            .instrument(tracing::debug_span!("reschedule"))
            .await
    }

    async fn reschedule_due(&self, now: u64) -> Result<RescheduleReport, BusError> {
        let mut report = RescheduleReport::default();
        for signal in self.store.scheduled()? {
            if signal.context.is_delayed(now) {
                report.pending += 1;
                continue;
            }
            if !self.store.claim_scheduled(&signal.id)? {
                report.already_claimed += 1;
                continue;
            }
            tracing::info!(
                signal_id = %signal.id,
                signal_type = %signal.signal_type,
                "delivering rescheduled signal"
            );
            let (_, follow_ups) = self.process(&signal).await?;
            self.publish(follow_ups).await?;
            report.delivered += 1;
        }
        Ok(report)
    }

    /// Run [`reschedule`](SignalBus::reschedule) periodically in the
    /// background until the returned handle is shut down.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_sweeper(&self, config: SweepConfig) -> SweepHandle {
        spawn_sweeper(self.clone(), config)
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus")
            .field("commands", &self.commands)
            .field("events", &self.events)
            .field("multitenant", &self.multitenant)
            .field("system", &self.system.is_some())
            .finish_non_exhaustive()
    }
}

async fn run_dispatcher(dispatcher: &dyn SignalDispatcher, signal: Signal) -> Result<DispatchOutcome, BusError> {
    match dispatcher.dispatch(signal).await {
        Ok(outcome) => Ok(outcome),
        Err(DispatchError::Configuration(e)) => Err(e.into()),
        Err(e) => Ok(DispatchOutcome::Failure(e.to_record())),
    }
}

fn invoke_handler(handlers: &HandlerSet, signal: &Signal) -> DispatchOutcome {
    let Some(method) = handlers.method(&signal.signal_type) else {
        return DispatchOutcome::Failure(unsupported(signal));
    };
    match method.invoke(signal) {
        Ok(messages) => DispatchOutcome::Success(
            messages
                .into_iter()
                .map(|m| Signal::produced(m, signal, handlers.id(), None))
                .collect(),
        ),
        Err(e) => CaughtError::classify(e, signal)
            .into_outcome()
            .unwrap_or_else(|| DispatchOutcome::Success(Vec::new())),
    }
}

/// Combine the outcomes of every consumer into the signal's outcome.
///
/// A failure wins over a rejection, which wins over success.
fn merge(outcomes: &[DispatchOutcome]) -> DispatchOutcome {
    if let Some(failure) = outcomes.iter().find(|o| o.is_failure()) {
        return failure.clone();
    }
    if let Some(rejection) = outcomes.iter().find(|o| o.is_rejection()) {
        return rejection.clone();
    }
    DispatchOutcome::Success(outcomes.iter().flat_map(|o| o.events().iter().cloned()).collect())
}

fn follow_ups(outcome: &DispatchOutcome) -> Vec<Signal> {
    match outcome {
        DispatchOutcome::Success(events) => events.clone(),
        DispatchOutcome::Rejection(event) => vec![event.clone()],
        DispatchOutcome::Failure(_) => Vec::new(),
    }
}

fn unsupported(signal: &Signal) -> ErrorRecord {
    SignalError::Unsupported {
        signal_type: signal.signal_type.clone(),
    }
    .to_record()
}

fn rejection_record(event: &Signal) -> ErrorRecord {
    ErrorRecord::new(&event.signal_type, "command rejected").with_attribute("rejection", event.payload.clone())
}

/// Builder for configuring and constructing a [`SignalBus`].
pub struct SignalBusBuilder {
    store: Option<Arc<dyn SignalStore>>,
    system: Option<Arc<dyn SystemWriteSide>>,
    multitenant: bool,
    consumers: Vec<(SignalKind, Consumer)>,
}

impl SignalBusBuilder {
    fn new() -> Self {
        Self {
            store: None,
            system: None,
            multitenant: false,
            consumers: Vec::new(),
        }
    }

    /// Set the signal store.
    ///
    /// Defaults to a fresh [`InMemorySignalStore`].
    pub fn signal_store<S: SignalStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Require a tenant on every posted signal.
    ///
    /// Default: `false`.
    pub fn multitenant(mut self, multitenant: bool) -> Self {
        self.multitenant = multitenant;
        self
    }

    /// Mirror every acknowledgement as a system event on `write_side`.
    pub fn system_write_side<W: SystemWriteSide + 'static>(mut self, write_side: Arc<W>) -> Self {
        self.system = Some(write_side);
        self
    }

    /// Register a command dispatcher when the bus is built.
    pub fn dispatcher<D: SignalDispatcher + 'static>(mut self, dispatcher: Arc<D>) -> Self {
        self.consumers
            .push((SignalKind::Command, Consumer::Dispatcher(dispatcher)));
        self
    }

    /// Register command handler methods when the bus is built.
    pub fn handler(mut self, handlers: HandlerSet) -> Self {
        self.consumers
            .push((SignalKind::Command, Consumer::Handler(Arc::new(handlers))));
        self
    }

    /// Subscribe event handler methods when the bus is built.
    pub fn subscriber(mut self, handlers: HandlerSet) -> Self {
        self.consumers
            .push((SignalKind::Event, Consumer::Handler(Arc::new(handlers))));
        self
    }

    /// Build the bus and register the configured consumers.
    ///
    /// Scheduled signals left in the store are not touched; use
    /// [`open`](SignalBusBuilder::open) to deliver the overdue ones.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if two consumers conflict.
    pub fn build(self) -> Result<SignalBus, RegistrationError> {
        let store: Arc<dyn SignalStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemorySignalStore::new()),
        };
        let bus = SignalBus {
            commands: Arc::new(HandlerRegistry::new(Ownership::Exclusive)),
            events: Arc::new(HandlerRegistry::new(Ownership::Shared)),
            store,
            system: self.system,
            multitenant: self.multitenant,
        };
        for (kind, consumer) in self.consumers {
            bus.registry_for(kind).register(consumer)?;
        }
        Ok(bus)
    }

    /// Build the bus and run the startup rescheduling sweep.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Registration`] if two consumers conflict, or any
    /// error of [`SignalBus::reschedule`].
    pub async fn open(self) -> Result<SignalBus, BusError> {
        let bus = self.build()?;
        let report = bus.reschedule().await?;
        tracing::info!(
            delivered = report.delivered,
            pending = report.pending,
            "signal bus opened"
        );
        Ok(bus)
    }
}

impl fmt::Debug for SignalBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBusBuilder")
            .field("multitenant", &self.multitenant)
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}
