//! Handler errors, rejections, and declarative handler sets.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorRecord, RegistrationError};
use crate::message::{EventMessage, IntoEvents, Message, SignalClass};
use crate::signal::{Signal, SignalContext};

/// A business refusal raised by a command handler.
///
/// Rejections are expected outcomes: the router publishes them as
/// rejection events and marks the command `REJECTED` rather than `ERROR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Wire name of the rejection message type.
    pub rejection_type: String,
    /// Serialized rejection message.
    pub data: Value,
    /// Human-readable reason.
    pub message: String,
}

impl Rejection {
    /// Capture a typed rejection message.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the message cannot be serialized.
    pub fn new<R: Message + fmt::Display>(rejection: &R) -> serde_json::Result<Self> {
        Ok(Self {
            rejection_type: R::TYPE_NAME.to_string(),
            data: serde_json::to_value(rejection)?,
            message: rejection.to_string(),
        })
    }

    /// Whether the rejection carries a message of type `R`.
    pub fn is<R: Message>(&self) -> bool {
        self.rejection_type == R::TYPE_NAME
    }

    /// Decode the rejection message as `R`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the data does not match `R`.
    pub fn decode<R: Message>(&self) -> serde_json::Result<R> {
        serde_json::from_value(self.data.clone())
    }

    /// The rejection message as an erased event payload.
    pub fn to_event_message(&self) -> EventMessage {
        EventMessage {
            event_type: self.rejection_type.clone(),
            data: self.data.clone(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Error returned by command and event handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler refused the signal on business grounds.
    #[error("rejected: {0}")]
    Rejected(Rejection),

    /// Any other failure during handling.
    #[error("{error}")]
    Failed {
        /// Short type name of the underlying error.
        error_type: String,
        /// The underlying error.
        error: Box<dyn Error + Send + Sync>,
    },
}

impl HandlerError {
    /// Reject with a typed rejection message.
    ///
    /// If the message cannot be serialized the result is a `Failed`
    /// error instead.
    pub fn reject<R: Message + fmt::Display>(rejection: R) -> Self {
        match Rejection::new(&rejection) {
            Ok(rejection) => Self::Rejected(rejection),
            Err(e) => Self::failed(e),
        }
    }

    /// Wrap a technical error.
    pub fn failed<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Failed {
            error_type: short_type_name::<E>().to_string(),
            error: Box::new(error),
        }
    }

    /// Capture the error as a serializable record.
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            Self::Rejected(rejection) => ErrorRecord::new(&rejection.rejection_type, &rejection.message)
                .with_attribute("rejection", rejection.data.clone()),
            Self::Failed { error_type, error } => ErrorRecord::new(error_type, error.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::failed(e)
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Result of invoking a handler method: the produced events, in order.
pub type HandlerResult = Result<Vec<EventMessage>, HandlerError>;

type InvokeFn = Box<dyn Fn(&Value, &SignalContext) -> HandlerResult + Send + Sync>;

/// Declared parameter shape of a handler method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// `(message)`
    Message,
    /// `(message, context)`
    MessageAndContext,
}

/// One handler method: the class it accepts and a type-erased invoker.
pub struct HandlerMethod {
    class: SignalClass,
    params: ParamShape,
    invoke: InvokeFn,
}

impl HandlerMethod {
    /// The accepted signal class.
    pub fn class(&self) -> SignalClass {
        self.class
    }

    /// The declared parameter shape.
    pub fn params(&self) -> ParamShape {
        self.params
    }

    /// Decode the signal's payload and run the method.
    ///
    /// # Errors
    ///
    /// Returns whatever the method returns, or `HandlerError::Failed` if
    /// the payload does not decode.
    pub fn invoke(&self, signal: &Signal) -> HandlerResult {
        (self.invoke)(&signal.payload, &signal.context)
    }
}

impl fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("class", &self.class)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A named set of handler methods, one per accepted message type.
///
/// Methods are declared up front; the set is immutable once registered.
/// Declaring two methods for one type is recorded and surfaces as
/// [`RegistrationError::DuplicateMethod`] when the set is registered.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{HandlerError, HandlerSet, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ProjectCreated { id: String }
///
/// impl Message for ProjectCreated {
///     const TYPE_NAME: &'static str = "projects.ProjectCreated";
/// }
///
/// let audit = HandlerSet::new("audit").on(|e: ProjectCreated| {
///     println!("created {}", e.id);
///     Ok::<_, HandlerError>(())
/// });
///
/// assert_eq!(audit.id(), "audit");
/// assert!(audit.method("projects.ProjectCreated").is_some());
/// ```
pub struct HandlerSet {
    id: String,
    methods: HashMap<&'static str, HandlerMethod>,
    duplicates: Vec<&'static str>,
}

impl HandlerSet {
    /// Create an empty set with the given consumer identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            methods: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Declare a method taking only the message.
    pub fn on<M, O, F>(self, handler: F) -> Self
    where
        M: Message,
        O: IntoEvents,
        F: Fn(M) -> Result<O, HandlerError> + Send + Sync + 'static,
    {
        let invoke: InvokeFn = Box::new(move |payload, _ctx| {
            let message: M = serde_json::from_value(payload.clone())?;
            Ok(handler(message)?.into_events()?)
        });
        self.declare(SignalClass::of::<M>(), ParamShape::Message, invoke)
    }

    /// Declare a method taking the message and its context.
    pub fn on_with_context<M, O, F>(self, handler: F) -> Self
    where
        M: Message,
        O: IntoEvents,
        F: Fn(M, &SignalContext) -> Result<O, HandlerError> + Send + Sync + 'static,
    {
        let invoke: InvokeFn = Box::new(move |payload, ctx| {
            let message: M = serde_json::from_value(payload.clone())?;
            Ok(handler(message, ctx)?.into_events()?)
        });
        self.declare(SignalClass::of::<M>(), ParamShape::MessageAndContext, invoke)
    }

    fn declare(mut self, class: SignalClass, params: ParamShape, invoke: InvokeFn) -> Self {
        let method = HandlerMethod {
            class,
            params,
            invoke,
        };
        if self.methods.insert(class.name(), method).is_some() {
            self.duplicates.push(class.name());
        }
        self
    }

    /// The consumer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The method for a signal type, if declared.
    pub fn method(&self, signal_type: &str) -> Option<&HandlerMethod> {
        self.methods.get(signal_type)
    }

    /// Every accepted class, sorted by name.
    pub fn signal_classes(&self) -> Vec<SignalClass> {
        let mut classes: Vec<SignalClass> = self.methods.values().map(HandlerMethod::class).collect();
        classes.sort_by_key(SignalClass::name);
        classes
    }

    pub(crate) fn check(&self) -> Result<(), RegistrationError> {
        match self.duplicates.first() {
            Some(signal_type) => Err(RegistrationError::DuplicateMethod {
                consumer: self.id.clone(),
                signal_type: (*signal_type).to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("id", &self.id)
            .field("signal_classes", &self.signal_classes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Notify {
        to: String,
    }

    impl Message for Notify {
        const TYPE_NAME: &'static str = "test.Notify";
    }

    impl Command for Notify {
        fn target_id(&self) -> String {
            self.to.clone()
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Notified {
        to: String,
        by: Option<String>,
    }

    impl Message for Notified {
        const TYPE_NAME: &'static str = "test.Notified";
    }

    #[derive(Debug, Serialize, Deserialize, thiserror::Error)]
    #[error("recipient {to} has opted out")]
    struct OptedOut {
        to: String,
    }

    impl Message for OptedOut {
        const TYPE_NAME: &'static str = "test.OptedOut";
    }

    fn notify_signal(to: &str) -> Signal {
        Signal::command(
            &Notify { to: to.into() },
            SignalContext::default().with_actor("ops"),
        )
        .expect("encode should succeed")
    }

    #[test]
    fn context_method_sees_signal_context() {
        let set = HandlerSet::new("notifier").on_with_context(|cmd: Notify, ctx: &SignalContext| {
            Ok::<_, HandlerError>(Notified {
                to: cmd.to,
                by: ctx.actor.clone(),
            })
        });

        let method = set.method("test.Notify").expect("method should be declared");
        assert_eq!(method.params(), ParamShape::MessageAndContext);

        let events = method.invoke(&notify_signal("ann")).expect("invoke should succeed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!({"to": "ann", "by": "ops"}));
    }

    #[test]
    fn rejection_is_preserved() {
        let set = HandlerSet::new("notifier").on(|cmd: Notify| {
            Err::<(), _>(HandlerError::reject(OptedOut { to: cmd.to }))
        });

        let err = set
            .method("test.Notify")
            .expect("method should be declared")
            .invoke(&notify_signal("bob"))
            .expect_err("handler should reject");

        match err {
            HandlerError::Rejected(rejection) => {
                assert!(rejection.is::<OptedOut>());
                assert_eq!(rejection.message, "recipient bob has opted out");
                let decoded: OptedOut = rejection.decode().expect("decode should succeed");
                assert_eq!(decoded.to, "bob");
            }
            other => panic!("expected rejection, got: {other:?}"),
        }
    }

    #[test]
    fn undecodable_payload_is_a_failure() {
        let set = HandlerSet::new("notifier").on(|_: Notify| Ok::<_, HandlerError>(()));
        let mut signal = notify_signal("ann");
        signal.payload = json!({"unexpected": true});

        let err = set
            .method("test.Notify")
            .expect("method should be declared")
            .invoke(&signal)
            .expect_err("decode should fail");
        assert!(matches!(err, HandlerError::Failed { .. }));
        assert_eq!(err.to_record().error_type, "Error");
    }

    #[test]
    fn failed_error_records_short_type_name() {
        let err = HandlerError::failed(std::io::Error::other("disk on fire"));
        let record = err.to_record();
        assert_eq!(record.error_type, "Error");
        assert_eq!(record.message, "disk on fire");
    }

    #[test]
    fn duplicate_method_detected_on_check() {
        let set = HandlerSet::new("twice")
            .on(|_: Notify| Ok::<_, HandlerError>(()))
            .on_with_context(|_: Notify, _: &SignalContext| Ok::<_, HandlerError>(()));

        match set.check() {
            Err(RegistrationError::DuplicateMethod {
                consumer,
                signal_type,
            }) => {
                assert_eq!(consumer, "twice");
                assert_eq!(signal_type, "test.Notify");
            }
            other => panic!("expected DuplicateMethod, got: {other:?}"),
        }
    }

    #[test]
    fn signal_classes_sorted() {
        let set = HandlerSet::new("multi")
            .on(|_: Notify| Ok::<_, HandlerError>(()))
            .on(|_: Notified| Ok::<_, HandlerError>(()));
        let names: Vec<&str> = set.signal_classes().iter().map(SignalClass::name).collect();
        assert_eq!(names, vec!["test.Notified", "test.Notify"]);
        assert!(set.check().is_ok());
    }
}
