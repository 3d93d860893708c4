//! Aggregate model, typed handler traits, and the event-sourced root.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::cache::{CachedEntity, EntityKey};
use crate::error::{AggregateError, ConfigurationError};
use crate::handler::{HandlerError, HandlerResult};
use crate::message::{Command, IntoEvents, Message, SignalClass};
use crate::mismatch::ValueMismatch;
use crate::signal::{Signal, SignalContext};
use crate::snapshot::{Lifecycle, Snapshot};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. The
/// commands it handles and the events it applies are declared in its
/// [`AggregateModel`], built from [`Handles`] and [`Applies`] impls.
///
/// # Contract
///
/// - Command handlers must be pure decision functions: no I/O, no side
///   effects. They validate a command against the current state and return
///   zero or more events, or reject it.
/// - Appliers must be pure, total functions. They take ownership of the
///   current state and a reference to an event, returning the next state.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{
///     Aggregate, AggregateModel, AggregateRoot, Applies, Command, HandlerContext,
///     HandlerError, Handles, Message, Signal, SignalContext,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Counter { value: u64 }
///
/// #[derive(Serialize, Deserialize)]
/// struct Increment { id: String }
///
/// impl Message for Increment {
///     const TYPE_NAME: &'static str = "counter.Increment";
/// }
///
/// impl Command for Increment {
///     fn target_id(&self) -> String { self.id.clone() }
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct Incremented;
///
/// impl Message for Incremented {
///     const TYPE_NAME: &'static str = "counter.Incremented";
/// }
///
/// impl Handles<Increment> for Counter {
///     type Output = Incremented;
///
///     fn handle(&self, _: Increment, _: &HandlerContext<'_>) -> Result<Incremented, HandlerError> {
///         Ok(Incremented)
///     }
/// }
///
/// impl Applies<Incremented> for Counter {
///     fn apply(mut self, _: &Incremented) -> Self {
///         self.value += 1;
///         self
///     }
/// }
///
/// impl Aggregate for Counter {
///     const AGGREGATE_TYPE: &'static str = "counter";
///
///     fn model() -> AggregateModel<Self> {
///         AggregateModel::new()
///             .handles::<Increment>()
///             .applies::<Incremented>()
///     }
/// }
///
/// let mut root = AggregateRoot::<Counter>::new("c-1");
/// let cmd = Signal::command(&Increment { id: "c-1".into() }, SignalContext::default()).unwrap();
/// let events = root.dispatch(&cmd).unwrap();
///
/// assert_eq!(events.len(), 1);
/// assert_eq!(root.version(), 1);
/// assert_eq!(root.state().value, 1);
/// ```
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "project"). Part of every
    /// entity key and used as a directory name by file storage.
    const AGGREGATE_TYPE: &'static str;

    /// The routing table of this aggregate type.
    fn model() -> AggregateModel<Self>;
}

/// Capability of an aggregate to handle command `C`.
pub trait Handles<C: Command>: Aggregate {
    /// The events produced on success.
    type Output: IntoEvents;

    /// Decide on the command against the current state.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Rejected`] to refuse the command on
    /// business grounds, or [`HandlerError::Failed`] for anything else.
    fn handle(&self, command: C, ctx: &HandlerContext<'_>) -> Result<Self::Output, HandlerError>;
}

/// Capability of an aggregate to fold event `E` into its state.
pub trait Applies<E: Message>: Aggregate {
    /// Apply a single event to produce the next state.
    fn apply(self, event: &E) -> Self;
}

type HandleFn<A> = fn(&A, &Value, &HandlerContext<'_>) -> HandlerResult;
type ApplyFn<A> = fn(A, &Value) -> serde_json::Result<A>;

fn handle_erased<A, C>(state: &A, payload: &Value, ctx: &HandlerContext<'_>) -> HandlerResult
where
    C: Command,
    A: Handles<C>,
{
    let command: C = serde_json::from_value(payload.clone())?;
    Ok(state.handle(command, ctx)?.into_events()?)
}

fn apply_erased<A, E>(state: A, payload: &Value) -> serde_json::Result<A>
where
    E: Message,
    A: Applies<E>,
{
    let event: E = serde_json::from_value(payload.clone())?;
    Ok(state.apply(&event))
}

struct HandlerEntry<A> {
    class: SignalClass,
    handle: HandleFn<A>,
}

/// Per-type routing table of an aggregate.
///
/// Built once per aggregate type and shared by every instance. An event
/// type declared [`neutral`](AggregateModel::neutral) is applied as a
/// no-op and does not advance the version, even if it also has an
/// applier. Any other event type with an applier is state-changing; one
/// without is a configuration error when produced or replayed.
///
/// Lifecycle flags set by [`archived_by`](AggregateModel::archived_by) and
/// [`deleted_by`](AggregateModel::deleted_by) sit beside the state, not in
/// it: a neutral event may set them without advancing the version.
pub struct AggregateModel<A> {
    handlers: HashMap<&'static str, HandlerEntry<A>>,
    appliers: HashMap<&'static str, ApplyFn<A>>,
    neutral: HashSet<&'static str>,
    archiving: HashSet<&'static str>,
    deleting: HashSet<&'static str>,
}

impl<A: Aggregate> AggregateModel<A> {
    /// An empty model.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            appliers: HashMap::new(),
            neutral: HashSet::new(),
            archiving: HashSet::new(),
            deleting: HashSet::new(),
        }
    }

    /// Route command `C` to `A`'s [`Handles<C>`] impl.
    pub fn handles<C>(mut self) -> Self
    where
        C: Command,
        A: Handles<C>,
    {
        self.handlers.insert(
            C::TYPE_NAME,
            HandlerEntry {
                class: SignalClass::of::<C>(),
                handle: handle_erased::<A, C>,
            },
        );
        self
    }

    /// Route event `E` to `A`'s [`Applies<E>`] impl.
    pub fn applies<E>(mut self) -> Self
    where
        E: Message,
        A: Applies<E>,
    {
        self.appliers.insert(E::TYPE_NAME, apply_erased::<A, E>);
        self
    }

    /// Declare `E` state-neutral: it needs no applier and never advances
    /// the version. Takes precedence over [`applies`](AggregateModel::applies).
    pub fn neutral<E: Message>(mut self) -> Self {
        self.neutral.insert(E::TYPE_NAME);
        self
    }

    /// Applying `E` marks the entity archived.
    pub fn archived_by<E: Message>(mut self) -> Self {
        self.archiving.insert(E::TYPE_NAME);
        self
    }

    /// Applying `E` marks the entity deleted.
    ///
    /// Lifecycle flags are not state; marking alone never advances the
    /// version.
    pub fn deleted_by<E: Message>(mut self) -> Self {
        self.deleting.insert(E::TYPE_NAME);
        self
    }

    /// Names of every handled command type, sorted.
    pub fn command_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Names of every applied or neutral event type, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self
            .appliers
            .keys()
            .chain(self.neutral.iter())
            .copied()
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Classes of every handled command type, sorted by name.
    pub fn command_classes(&self) -> Vec<SignalClass> {
        let mut classes: Vec<SignalClass> = self.handlers.values().map(|h| h.class).collect();
        classes.sort_by_key(SignalClass::name);
        classes
    }

    /// Whether applying `event_type` advances the version.
    pub fn is_state_changing(&self, event_type: &str) -> bool {
        !self.neutral.contains(event_type) && self.appliers.contains_key(event_type)
    }

    fn handler(&self, signal_type: &str) -> Result<HandleFn<A>, ConfigurationError> {
        self.handlers
            .get(signal_type)
            .map(|h| h.handle)
            .ok_or_else(|| ConfigurationError::MissingHandler {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                signal_type: signal_type.to_string(),
            })
    }
}

impl<A: Aggregate> Default for AggregateModel<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> fmt::Debug for AggregateModel<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateModel")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("command_types", &self.command_types())
            .field("event_types", &self.event_types())
            .finish()
    }
}

/// What a command handler can see besides the command itself.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    aggregate_id: &'a str,
    version: u64,
    signal: &'a Signal,
}

impl<'a> HandlerContext<'a> {
    /// Identifier of the handling aggregate.
    pub fn aggregate_id(&self) -> &'a str {
        self.aggregate_id
    }

    /// Version of the aggregate before this command.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The command signal being handled.
    pub fn signal(&self) -> &'a Signal {
        self.signal
    }

    /// Shorthand for `self.signal().context`.
    pub fn context(&self) -> &'a SignalContext {
        &self.signal.context
    }

    /// A field expected to be default held `actual`.
    pub fn expected_default<T: Serialize + Default>(&self, actual: &T, new_value: &T) -> ValueMismatch {
        ValueMismatch::expected_default(actual, new_value, self.version)
    }

    /// A field expected to hold `expected` was default.
    pub fn expected_not_default<T: Serialize + Default>(
        &self,
        expected: &T,
        new_value: Option<&T>,
    ) -> ValueMismatch {
        ValueMismatch::expected_not_default(expected, new_value, self.version)
    }

    /// A field expected to hold `expected` held `actual`.
    pub fn unexpected_value<T: Serialize>(&self, expected: &T, actual: &T, new_value: &T) -> ValueMismatch {
        ValueMismatch::unexpected_value(expected, actual, new_value, self.version)
    }

    /// A string expected to be empty held `actual`.
    pub fn expected_empty(&self, actual: &str, new_value: &str) -> ValueMismatch {
        ValueMismatch::expected_empty(actual, new_value, self.version)
    }

    /// A string expected to hold `expected` was empty.
    pub fn expected_not_empty(&self, expected: &str) -> ValueMismatch {
        ValueMismatch::expected_not_empty(expected, self.version)
    }

    /// A string expected to be `expected` was `actual`.
    pub fn unexpected_string(&self, expected: &str, actual: &str, new_value: &str) -> ValueMismatch {
        ValueMismatch::unexpected_string(expected, actual, new_value, self.version)
    }
}

/// Working copy of an aggregate's mutable fields.
///
/// Dispatch and replay mutate a draft and commit it back only when
/// every event applied.
struct Draft<A> {
    state: A,
    version: u64,
    modified_at: u64,
    lifecycle: Lifecycle,
}

impl<A: Aggregate> Draft<A> {
    fn apply(&mut self, model: &AggregateModel<A>, event: &Signal) -> Result<(), AggregateError> {
        let event_type = event.signal_type.as_str();
        match model.appliers.get(event_type) {
            _ if model.neutral.contains(event_type) => {}
            Some(apply) => {
                let state = std::mem::take(&mut self.state);
                self.state = apply(state, &event.payload).map_err(|source| AggregateError::Decode {
                    event_type: event_type.to_string(),
                    source,
                })?;
                self.version += 1;
                self.modified_at = event.context.timestamp;
            }
            None => {
                return Err(ConfigurationError::MissingApplier {
                    aggregate_type: A::AGGREGATE_TYPE.to_string(),
                    signal_type: event_type.to_string(),
                }
                .into());
            }
        }
        if model.archiving.contains(event_type) {
            self.lifecycle.archived = true;
        }
        if model.deleting.contains(event_type) {
            self.lifecycle.deleted = true;
        }
        Ok(())
    }
}

/// A live aggregate instance: identity, state, version, and the events
/// produced since the last commit.
///
/// Mutated only through [`dispatch`](AggregateRoot::dispatch),
/// [`play`](AggregateRoot::play), and [`restore`](AggregateRoot::restore).
/// The version counts state-changing events and never decreases.
#[derive(Clone)]
pub struct AggregateRoot<A> {
    key: EntityKey,
    state: A,
    version: u64,
    modified_at: u64,
    lifecycle: Lifecycle,
    uncommitted: Vec<Signal>,
    model: Arc<AggregateModel<A>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh instance with default state at version 0.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_model(EntityKey::new(A::AGGREGATE_TYPE, id), Arc::new(A::model()))
    }

    /// A fresh instance sharing an existing model.
    pub fn with_model(key: EntityKey, model: Arc<AggregateModel<A>>) -> Self {
        Self {
            key,
            state: A::default(),
            version: 0,
            modified_at: 0,
            lifecycle: Lifecycle::default(),
            uncommitted: Vec::new(),
            model,
        }
    }

    /// An instance restored from a persisted snapshot.
    pub fn from_snapshot(key: EntityKey, snapshot: Snapshot<A>, model: Arc<AggregateModel<A>>) -> Self {
        let mut root = Self::with_model(key, model);
        root.restore(snapshot);
        root
    }

    /// The entity key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// The aggregate identifier.
    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// The current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Number of state-changing events applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Timestamp of the last state-changing event, if any.
    pub fn when_modified(&self) -> Option<u64> {
        (self.version > 0).then_some(self.modified_at)
    }

    /// Lifecycle flags.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// The shared routing table.
    pub fn model(&self) -> &AggregateModel<A> {
        &self.model
    }

    /// Handle a command and apply the produced events.
    ///
    /// Runs as a transaction: the handler decides against the current
    /// state, the produced events are applied to a working copy, and the
    /// copy replaces the live state only if every event applied. On
    /// success the events are appended to the uncommitted buffer.
    ///
    /// # Returns
    ///
    /// The produced events in emission order, each stamped with this
    /// aggregate as producer, the command as origin, and the version
    /// reached after it.
    ///
    /// # Errors
    ///
    /// * [`AggregateError::Configuration`] if no handler is declared for
    ///   the command, or a produced event has no applier and is not neutral.
    /// * [`AggregateError::Handler`] if the handler rejects or fails.
    /// * [`AggregateError::Decode`] if an event payload does not decode.
    ///
    /// In every error case state, version, and uncommitted events are left
    /// unchanged.
    pub fn dispatch(&mut self, command: &Signal) -> Result<Vec<Signal>, AggregateError> {
        let handle = self.model.handler(&command.signal_type)?;
        let ctx = HandlerContext {
            aggregate_id: &self.key.id,
            version: self.version,
            signal: command,
        };
        let produced = handle(&self.state, &command.payload, &ctx)?;

        let mut draft = self.draft();
        let mut events = Vec::with_capacity(produced.len());
        for message in produced {
            let mut event = Signal::produced(message, command, &self.key.id, None);
            draft.apply(&self.model, &event)?;
            event.context.version = Some(draft.version);
            events.push(event);
        }

        self.commit(draft);
        self.uncommitted.extend(events.iter().cloned());
        Ok(events)
    }

    /// Replay events onto the current state without recording them.
    ///
    /// Applied atomically: if any event fails, nothing changes.
    ///
    /// # Errors
    ///
    /// Same conditions as the apply phase of [`dispatch`](Self::dispatch).
    pub fn play(&mut self, events: &[Signal]) -> Result<(), AggregateError> {
        let mut draft = self.draft();
        for event in events {
            draft.apply(&self.model, event)?;
        }
        self.commit(draft);
        Ok(())
    }

    /// Events produced since the last [`commit_events`](Self::commit_events).
    pub fn uncommitted_events(&self) -> &[Signal] {
        &self.uncommitted
    }

    /// Uncommitted events that advanced the version.
    pub fn state_changing_uncommitted(&self) -> Vec<&Signal> {
        self.uncommitted
            .iter()
            .filter(|e| self.model.is_state_changing(&e.signal_type))
            .collect()
    }

    /// Take the uncommitted events, leaving the buffer empty.
    pub fn commit_events(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Capture state, version, and lifecycle.
    pub fn to_snapshot(&self) -> Snapshot<A> {
        Snapshot {
            state: self.state.clone(),
            version: self.version,
            timestamp: self.modified_at,
            lifecycle: self.lifecycle,
        }
    }

    /// Replace state, version, and lifecycle with a snapshot's.
    ///
    /// Uncommitted events are kept.
    pub fn restore(&mut self, snapshot: Snapshot<A>) {
        self.state = snapshot.state;
        self.version = snapshot.version;
        self.modified_at = snapshot.timestamp;
        self.lifecycle = snapshot.lifecycle;
    }

    fn draft(&self) -> Draft<A> {
        Draft {
            state: self.state.clone(),
            version: self.version,
            modified_at: self.modified_at,
            lifecycle: self.lifecycle,
        }
    }

    fn commit(&mut self, draft: Draft<A>) {
        self.state = draft.state;
        self.version = draft.version;
        self.modified_at = draft.modified_at;
        self.lifecycle = draft.lifecycle;
    }
}

impl<A: Aggregate> CachedEntity for AggregateRoot<A> {
    fn key(&self) -> &EntityKey {
        &self.key
    }
}

impl<A: Aggregate> fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("lifecycle", &self.lifecycle)
            .field("uncommitted", &self.uncommitted.len())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::mismatch::MismatchKind;

    fn project_at_version_3() -> AggregateRoot<Project> {
        let mut root = AggregateRoot::<Project>::new("p-1");
        root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");
        root.dispatch(&add_tasks("p-1", &["design", "build"]))
            .expect("add should succeed");
        root.commit_events();
        root
    }

    #[test]
    fn dispatch_applies_produced_event() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        let events = root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");

        assert_eq!(events.len(), 1);
        assert!(events[0].is::<ProjectCreated>());
        assert_eq!(root.version(), 1);
        assert_eq!(root.state().name, "Apollo");
    }

    #[test]
    fn two_events_advance_version_by_two() {
        let mut root = project_at_version_3();
        assert_eq!(root.version(), 3);

        let events = root
            .dispatch(&add_tasks("p-1", &["test", "ship"]))
            .expect("add should succeed");
        assert_eq!(events.len(), 2);
        assert_eq!(root.version(), 5);
        assert_eq!(events[0].context.version, Some(4));
        assert_eq!(events[1].context.version, Some(5));

        let committed = root.commit_events();
        assert_eq!(committed, events);
        assert!(root.commit_events().is_empty());
    }

    #[test]
    fn produced_events_record_provenance() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        let cmd = create("p-1", "Apollo");
        let events = root.dispatch(&cmd).expect("create should succeed");

        let ctx = &events[0].context;
        assert_eq!(ctx.origin, Some(cmd.id));
        assert_eq!(ctx.producer_id.as_deref(), Some("p-1"));
        assert_eq!(events[0].target.as_deref(), Some("p-1"));
    }

    #[test]
    fn neutral_event_needs_no_applier_and_keeps_version() {
        let mut root = project_at_version_3();
        let before = root.state().clone();

        let events = root
            .dispatch(&command(PingProject { id: "p-1".into() }))
            .expect("ping should succeed");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].context.version, Some(3));
        assert_eq!(root.version(), 3);
        assert_eq!(root.state(), &before);
        assert_eq!(root.uncommitted_events().len(), 1);
        assert!(root.state_changing_uncommitted().is_empty());
    }

    #[test]
    fn state_changing_uncommitted_filters_neutral_events() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");
        root.dispatch(&command(PingProject { id: "p-1".into() }))
            .expect("ping should succeed");
        root.dispatch(&command(StartProject { id: "p-1".into() }))
            .expect("start should succeed");

        let changing: Vec<&str> = root
            .state_changing_uncommitted()
            .iter()
            .map(|e| e.signal_type.as_str())
            .collect();
        assert_eq!(changing, vec!["test.ProjectCreated", "test.ProjectStarted"]);
        assert_eq!(root.uncommitted_events().len(), 3);
    }

    #[test]
    fn missing_handler_is_configuration_error() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        let err = root
            .dispatch(&command(ForgottenCommand { id: "p-1".into() }))
            .expect_err("unhandled command should fail");

        assert!(
            matches!(
                err,
                AggregateError::Configuration(ConfigurationError::MissingHandler { .. })
            ),
            "expected MissingHandler, got: {err:?}"
        );
        assert_eq!(root.version(), 0);
    }

    #[test]
    fn missing_applier_leaves_entity_untouched() {
        let mut root = AggregateRoot::<Unwired>::new("u-1");
        let err = root
            .dispatch(&create("u-1", "Apollo"))
            .expect_err("unapplied event should fail");

        assert!(
            matches!(
                err,
                AggregateError::Configuration(ConfigurationError::MissingApplier { .. })
            ),
            "expected MissingApplier, got: {err:?}"
        );
        assert_eq!(root.version(), 0);
        assert!(root.uncommitted_events().is_empty());
    }

    #[test]
    fn rejection_propagates_and_state_unchanged() {
        let mut root = project_at_version_3();
        root.dispatch(&command(StartProject { id: "p-1".into() }))
            .expect("first start should succeed");
        let snapshot = root.to_snapshot();

        let err = root
            .dispatch(&command(StartProject { id: "p-1".into() }))
            .expect_err("second start should be rejected");

        match err {
            AggregateError::Handler(HandlerError::Rejected(rejection)) => {
                assert!(rejection.is::<ProjectAlreadyStarted>());
            }
            other => panic!("expected rejection, got: {other:?}"),
        }
        assert_eq!(root.to_snapshot(), snapshot);
    }

    #[test]
    fn technical_failure_propagates() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        let err = root
            .dispatch(&command(BreakProject { id: "p-1".into() }))
            .expect_err("break should fail");
        assert!(matches!(err, AggregateError::Handler(HandlerError::Failed { .. })));
    }

    #[test]
    fn mismatch_helper_records_current_version() {
        let mut root = project_at_version_3();
        let err = root
            .dispatch(&command(RenameProject {
                id: "p-1".into(),
                expected: "Gemini".into(),
                name: "Artemis".into(),
            }))
            .expect_err("stale rename should be rejected");

        let rejection = match err {
            AggregateError::Handler(HandlerError::Rejected(rejection)) => rejection,
            other => panic!("expected rejection, got: {other:?}"),
        };
        let mismatch: ValueMismatch = rejection.decode().expect("decode should succeed");
        assert_eq!(mismatch.kind, MismatchKind::UnexpectedValue);
        assert_eq!(mismatch.version, 3);
        assert_eq!(mismatch.actual, serde_json::json!("Apollo"));
    }

    #[test]
    fn play_replays_history_without_recording() {
        let mut source = project_at_version_3();
        source
            .dispatch(&command(StartProject { id: "p-1".into() }))
            .expect("start should succeed");
        let mut history = Vec::new();
        let mut fresh = AggregateRoot::<Project>::new("p-1");
        fresh.dispatch(&create("p-1", "Apollo")).expect("create should succeed");
        fresh
            .dispatch(&add_tasks("p-1", &["design", "build"]))
            .expect("add should succeed");
        fresh
            .dispatch(&command(StartProject { id: "p-1".into() }))
            .expect("start should succeed");
        history.extend(fresh.commit_events());

        let mut replayed = AggregateRoot::<Project>::new("p-1");
        replayed.play(&history).expect("play should succeed");

        assert_eq!(replayed.state(), source.state());
        assert_eq!(replayed.version(), 4);
        assert!(replayed.uncommitted_events().is_empty());
    }

    #[test]
    fn play_is_atomic_on_failure() {
        let mut producer = AggregateRoot::<Project>::new("u-1");
        let events = producer
            .dispatch(&create("u-1", "Apollo"))
            .expect("create should succeed");

        let mut unwired = AggregateRoot::<Unwired>::new("u-1");
        let err = unwired.play(&events).expect_err("unapplied event should fail");
        assert!(matches!(err, AggregateError::Configuration(_)));
        assert_eq!(unwired.version(), 0);
    }

    #[test]
    fn restore_then_play_tail_equals_full_replay() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");
        root.dispatch(&add_tasks("p-1", &["design"])).expect("add should succeed");
        let head = root.commit_events();
        let snapshot = root.to_snapshot();

        root.dispatch(&command(StartProject { id: "p-1".into() }))
            .expect("start should succeed");
        root.dispatch(&command(PingProject { id: "p-1".into() }))
            .expect("ping should succeed");
        let tail = root.commit_events();

        let mut full = AggregateRoot::<Project>::new("p-1");
        full.play(&head).expect("play head should succeed");
        full.play(&tail).expect("play tail should succeed");

        let mut fast = AggregateRoot::<Project>::new("p-1");
        fast.restore(snapshot);
        fast.play(&tail).expect("play tail should succeed");

        assert_eq!(fast.to_snapshot(), full.to_snapshot());
        assert_eq!(fast.to_snapshot(), root.to_snapshot());
    }

    #[test]
    fn restore_of_own_snapshot_is_identity() {
        let mut root = project_at_version_3();
        let snapshot = root.to_snapshot();
        root.restore(snapshot.clone());
        assert_eq!(root.to_snapshot(), snapshot);
    }

    #[test]
    fn when_modified_tracks_state_changing_events_only() {
        let mut root = AggregateRoot::<Project>::new("p-1");
        assert_eq!(root.when_modified(), None);

        let events = root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");
        assert_eq!(root.when_modified(), Some(events[0].context.timestamp));

        let before = root.when_modified();
        root.dispatch(&command(PingProject { id: "p-1".into() }))
            .expect("ping should succeed");
        assert_eq!(root.when_modified(), before);
    }

    #[test]
    fn lifecycle_flags_follow_marked_events() {
        let mut root = project_at_version_3();
        assert_eq!(root.lifecycle(), Lifecycle::default());

        root.dispatch(&command(ArchiveProject { id: "p-1".into() }))
            .expect("archive should succeed");
        assert!(root.lifecycle().archived);
        assert_eq!(root.version(), 4);

        root.dispatch(&command(DeleteProject { id: "p-1".into() }))
            .expect("delete should succeed");
        assert!(root.lifecycle().deleted);
        assert_eq!(root.version(), 4);
        assert!(root.to_snapshot().lifecycle.deleted);
    }

    #[test]
    fn neutral_declaration_overrides_applier() {
        let model = Project::model().neutral::<ProjectRenamed>();
        assert!(!model.is_state_changing("test.ProjectRenamed"));
        let mut root = AggregateRoot::with_model(EntityKey::new("project", "p-1"), Arc::new(model));
        root.dispatch(&create("p-1", "Apollo")).expect("create should succeed");

        let events = root
            .dispatch(&command(RenameProject {
                id: "p-1".into(),
                expected: "Apollo".into(),
                name: "Artemis".into(),
            }))
            .expect("rename should succeed");

        assert_eq!(events.len(), 1);
        assert_eq!(root.version(), 1);
        assert_eq!(root.state().name, "Apollo");
        assert!(root.state_changing_uncommitted().iter().all(|e| !e.is::<ProjectRenamed>()));
    }

    #[test]
    fn model_introspection() {
        let model = Project::model();
        assert_eq!(
            model.command_types(),
            vec![
                "test.AddTasks",
                "test.ArchiveProject",
                "test.BreakProject",
                "test.CreateProject",
                "test.DeleteProject",
                "test.PingProject",
                "test.RenameProject",
                "test.StartProject",
            ]
        );
        assert!(model.event_types().contains(&"test.ProjectPinged"));
        assert!(model.is_state_changing("test.TaskAdded"));
        assert!(!model.is_state_changing("test.ProjectPinged"));
        assert_eq!(model.command_classes().len(), 8);
    }
}
