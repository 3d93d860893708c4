//! Typed message traits and their type-erased counterparts.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A serializable message with a stable wire name.
///
/// Commands, events, and rejections are all messages. `TYPE_NAME` is the
/// routing key: the bus, the registries, and aggregate models look
/// consumers up by it, so it must be unique within a deployment.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{ConstraintViolation, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct RenameProject {
///     id: String,
///     name: String,
/// }
///
/// impl Message for RenameProject {
///     const TYPE_NAME: &'static str = "projects.RenameProject";
///
///     fn validate(&self) -> Vec<ConstraintViolation> {
///         if self.name.is_empty() {
///             vec![ConstraintViolation::new("name", "must not be empty")]
///         } else {
///             Vec::new()
///         }
///     }
/// }
///
/// let cmd = RenameProject { id: "p-1".into(), name: String::new() };
/// assert_eq!(cmd.validate().len(), 1);
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable, unique name of this message type.
    const TYPE_NAME: &'static str;

    /// Check structural constraints on the payload.
    ///
    /// Returns every violated constraint; an empty vector means valid.
    fn validate(&self) -> Vec<ConstraintViolation> {
        Vec::new()
    }
}

/// A message that instructs exactly one consumer to act on one target.
pub trait Command: Message {
    /// Identifier of the entity this command targets.
    fn target_id(&self) -> String;
}

/// A single violated constraint reported by [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Path of the offending field (`"$"` for the whole payload).
    pub field: String,
    /// What is wrong with the field.
    pub message: String,
}

impl ConstraintViolation {
    /// Create a violation for the given field.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A type-erased event payload: wire name plus JSON data.
///
/// This is what handlers produce before the router wraps each message
/// into a full [`Signal`](crate::Signal) with context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Wire name of the event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Serialized event payload.
    pub data: Value,
}

impl EventMessage {
    /// Serialize a typed message.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the message cannot be serialized.
    pub fn of<M: Message>(message: &M) -> serde_json::Result<Self> {
        Ok(Self {
            event_type: M::TYPE_NAME.to_string(),
            data: serde_json::to_value(message)?,
        })
    }

    /// Whether this payload carries a message of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.event_type == M::TYPE_NAME
    }

    /// Decode the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the data does not match `M`.
    pub fn decode<M: Message>(&self) -> serde_json::Result<M> {
        serde_json::from_value(self.data.clone())
    }
}

/// Conversion of a handler's return value into zero or more events.
///
/// Implemented for `()` (no events), any single [`Message`], `Option` and
/// `Vec` of messages, pairs of messages, and already-erased
/// [`EventMessage`] vectors. Handlers returning "one of several event
/// types" implement it on their own enum.
pub trait IntoEvents {
    /// Produce the events in emission order.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if an event cannot be serialized.
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>>;
}

impl IntoEvents for () {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        Ok(Vec::new())
    }
}

impl<M: Message> IntoEvents for M {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        Ok(vec![EventMessage::of(&self)?])
    }
}

impl<M: Message> IntoEvents for Option<M> {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        self.map_or_else(|| Ok(Vec::new()), IntoEvents::into_events)
    }
}

impl<M: Message> IntoEvents for Vec<M> {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        self.iter().map(EventMessage::of).collect()
    }
}

impl<A: Message, B: Message> IntoEvents for (A, B) {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        Ok(vec![EventMessage::of(&self.0)?, EventMessage::of(&self.1)?])
    }
}

impl IntoEvents for Vec<EventMessage> {
    fn into_events(self) -> serde_json::Result<Vec<EventMessage>> {
        Ok(self)
    }
}

type ValidateFn = fn(&Value) -> Result<(), Vec<ConstraintViolation>>;

/// Runtime descriptor of a message type: its name and its validator.
///
/// Consumers declare the classes they accept; registries store them so the
/// router can validate a type-erased payload without knowing `M`.
#[derive(Clone, Copy)]
pub struct SignalClass {
    name: &'static str,
    validate: ValidateFn,
}

impl SignalClass {
    /// Descriptor for message type `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            name: M::TYPE_NAME,
            validate: validate_payload::<M>,
        }
    }

    /// The wire name of the class.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decode the payload as this class and run its constraints.
    ///
    /// # Errors
    ///
    /// Returns every violated constraint. A payload that does not decode
    /// yields a single violation on field `"$"`.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<ConstraintViolation>> {
        (self.validate)(payload)
    }
}

impl fmt::Debug for SignalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignalClass").field(&self.name).finish()
    }
}

impl PartialEq for SignalClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SignalClass {}

fn validate_payload<M: Message>(payload: &Value) -> Result<(), Vec<ConstraintViolation>> {
    let message: M = serde_json::from_value(payload.clone())
        .map_err(|e| vec![ConstraintViolation::new("$", e.to_string())])?;
    let violations = message.validate();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
