//! Signal envelope, identity, and cross-cutting context.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::{Command, EventMessage, Message};

/// Unique identifier of a posted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(Uuid);

impl SignalId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the tenant a signal or entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a tenant name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The tenant name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a signal is an instruction or a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Routed to exactly one consumer.
    Command,
    /// Broadcast to every subscriber.
    Event,
}

/// Lifecycle status of a signal in the [`SignalStore`](crate::SignalStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalStatus {
    /// Accepted and awaiting dispatch.
    Received,
    /// Accepted for delivery at a later time.
    Scheduled,
    /// Handled successfully.
    Ok,
    /// Handling failed with a technical error.
    Error,
    /// The target refused the signal on business grounds.
    Rejected,
}

impl SignalStatus {
    /// Name of the status as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Scheduled => "SCHEDULED",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .expect("system clock is before Unix epoch")
        .as_millis() as u64
}

/// Cross-cutting metadata carried by every signal.
///
/// Holds audit trail, tenancy, scheduling, and provenance. Callers set
/// the actor, tenant, correlation, delay, and metadata; the router and
/// aggregates fill in `origin`, `producer_id`, and `version` on the
/// signals they produce.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_bus::{SignalContext, TenantId};
/// use serde_json::json;
///
/// let ctx = SignalContext::default()
///     .with_actor("user-42")
///     .with_tenant(TenantId::new("acme"))
///     .with_correlation_id("req-abc-123")
///     .with_delay(Duration::from_secs(30))
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.tenant.as_ref().map(TenantId::as_str), Some("acme"));
/// assert_eq!(ctx.deliver_at(), ctx.timestamp + 30_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContext {
    /// Identity of the actor issuing the signal (e.g. a user ID).
    pub actor: Option<String>,
    /// Tenant the signal belongs to. Required on multitenant buses.
    pub tenant: Option<TenantId>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Requested delivery delay in milliseconds.
    pub delay_ms: Option<u64>,
    /// The signal whose handling produced this one.
    pub origin: Option<SignalId>,
    /// Correlation ID for tracing a request across consumers.
    pub correlation_id: Option<String>,
    /// Identifier of the entity or consumer that produced this signal.
    pub producer_id: Option<String>,
    /// Version of the producing aggregate after this signal, if any.
    pub version: Option<u64>,
    /// Arbitrary caller metadata.
    pub metadata: Option<Value>,
}

impl Default for SignalContext {
    fn default() -> Self {
        Self {
            actor: None,
            tenant: None,
            timestamp: now_millis(),
            delay_ms: None,
            origin: None,
            correlation_id: None,
            producer_id: None,
            version: None,
            metadata: None,
        }
    }
}

impl SignalContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the signal (e.g. a user ID or service name).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Request delivery `delay` after the context's timestamp.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Override the creation timestamp (milliseconds since the Unix epoch).
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Earliest delivery time in milliseconds since the Unix epoch.
    pub fn deliver_at(&self) -> u64 {
        self.timestamp.saturating_add(self.delay_ms.unwrap_or(0))
    }

    /// Whether delivery must wait past `now`.
    pub fn is_delayed(&self, now: u64) -> bool {
        self.deliver_at() > now
    }

    /// Context for a signal produced while handling `origin`.
    ///
    /// Keeps actor, tenant, correlation, and metadata; records the
    /// origin and producer; clears scheduling.
    pub(crate) fn derived(origin: &Signal, producer_id: &str, version: Option<u64>) -> Self {
        Self {
            actor: origin.context.actor.clone(),
            tenant: origin.context.tenant.clone(),
            timestamp: now_millis(),
            delay_ms: None,
            origin: Some(origin.id),
            correlation_id: origin.context.correlation_id.clone(),
            producer_id: Some(producer_id.to_string()),
            version,
            metadata: origin.context.metadata.clone(),
        }
    }
}

/// A type-erased signal: a command or event plus its context.
///
/// The payload is a `serde_json::Value` because the router does not know
/// the concrete message type; consumers decode it with
/// [`Signal::message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal identifier.
    pub id: SignalId,
    /// Command or event.
    pub kind: SignalKind,
    /// Wire name of the payload's message type.
    pub signal_type: String,
    /// Identifier of the targeted (command) or producing (event) entity.
    pub target: Option<String>,
    /// Serialized message.
    pub payload: Value,
    /// Cross-cutting metadata.
    pub context: SignalContext,
}

impl Signal {
    /// Wrap a typed command.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn command<C: Command>(command: &C, context: SignalContext) -> serde_json::Result<Self> {
        Ok(Self {
            id: SignalId::new(),
            kind: SignalKind::Command,
            signal_type: C::TYPE_NAME.to_string(),
            target: Some(command.target_id()),
            payload: serde_json::to_value(command)?,
            context,
        })
    }

    /// Wrap a typed event.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized.
    pub fn event<E: Message>(event: &E, context: SignalContext) -> serde_json::Result<Self> {
        Ok(Self::from_event_message(EventMessage::of(event)?, None, context))
    }

    /// Wrap an already-erased event payload.
    pub fn from_event_message(
        message: EventMessage,
        target: Option<String>,
        context: SignalContext,
    ) -> Self {
        Self {
            id: SignalId::new(),
            kind: SignalKind::Event,
            signal_type: message.event_type,
            target,
            payload: message.data,
            context,
        }
    }

    /// Event produced while handling `origin`, stamped with provenance.
    pub(crate) fn produced(
        message: EventMessage,
        origin: &Signal,
        producer_id: &str,
        version: Option<u64>,
    ) -> Self {
        let context = SignalContext::derived(origin, producer_id, version);
        Self::from_event_message(message, origin.target.clone(), context)
    }

    /// Whether the payload carries a message of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.signal_type == M::TYPE_NAME
    }

    /// Decode the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `M`.
    pub fn message<M: Message>(&self) -> serde_json::Result<M> {
        serde_json::from_value(self.payload.clone())
    }

    /// The payload as an erased [`EventMessage`].
    pub fn event_message(&self) -> EventMessage {
        EventMessage {
            event_type: self.signal_type.clone(),
            data: self.payload.clone(),
        }
    }

    /// Shorthand for `self.context.tenant.as_ref()`.
    pub fn tenant(&self) -> Option<&TenantId> {
        self.context.tenant.as_ref()
    }
}
