//! Consumer registration: which dispatcher or handler owns which signal type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::error::{DispatchError, RegistrationError};
use crate::handler::HandlerSet;
use crate::message::SignalClass;
use crate::outcome::DispatchOutcome;
use crate::signal::Signal;

/// Boxed future returned by [`SignalDispatcher::dispatch`].
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send + 'a>>;

/// A consumer that takes full responsibility for delivering a signal.
///
/// Dispatchers route signals onward (typically to aggregates) and
/// classify their own outcome. Rejections and runtime failures are
/// returned as [`DispatchOutcome`] values; only the error channel's
/// [`DispatchError::Configuration`] is fatal to the router.
pub trait SignalDispatcher: Send + Sync {
    /// Stable identifier, used in registration conflicts and logs.
    fn consumer_id(&self) -> &str;

    /// Every signal class this dispatcher accepts.
    fn signal_classes(&self) -> Vec<SignalClass>;

    /// Deliver one signal.
    fn dispatch<'a>(&'a self, signal: Signal) -> DispatchFuture<'a>;
}

/// The two kinds of consumer a registry can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerCategory {
    /// A [`SignalDispatcher`].
    Dispatcher,
    /// A [`HandlerSet`].
    Handler,
}

impl fmt::Display for ConsumerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatcher => f.write_str("dispatcher"),
            Self::Handler => f.write_str("handler"),
        }
    }
}

/// A registered consumer.
#[derive(Clone)]
pub enum Consumer {
    /// Routes signals onward and reports its own outcome.
    Dispatcher(Arc<dyn SignalDispatcher>),
    /// Invokes a handler method directly.
    Handler(Arc<HandlerSet>),
}

impl Consumer {
    /// The consumer's identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Dispatcher(d) => d.consumer_id(),
            Self::Handler(h) => h.id(),
        }
    }

    /// Whether this is a dispatcher or a handler.
    pub fn category(&self) -> ConsumerCategory {
        match self {
            Self::Dispatcher(_) => ConsumerCategory::Dispatcher,
            Self::Handler(_) => ConsumerCategory::Handler,
        }
    }

    /// The classes the consumer accepts.
    pub fn signal_classes(&self) -> Vec<SignalClass> {
        match self {
            Self::Dispatcher(d) => d.signal_classes(),
            Self::Handler(h) => h.signal_classes(),
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id())
            .field("category", &self.category())
            .finish()
    }
}

/// How many consumers may own one signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Exactly one consumer per type (commands).
    Exclusive,
    /// Any number of consumers of one category per type (events).
    Shared,
}

struct Entry {
    class: SignalClass,
    consumers: Vec<Consumer>,
}

/// Thread-safe map from signal type to its consumers.
///
/// Dispatchers and handlers never share a type. In an
/// [`Exclusive`](Ownership::Exclusive) registry a type has at most one
/// consumer; in a [`Shared`](Ownership::Shared) registry it may have many
/// of the same category, each registered once.
pub struct HandlerRegistry {
    ownership: Ownership,
    entries: RwLock<HashMap<String, Entry>>,
}

impl HandlerRegistry {
    /// A registry with the given ownership rule.
    pub fn new(ownership: Ownership) -> Self {
        Self {
            ownership,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The ownership rule.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Register a consumer for every class it declares.
    ///
    /// All-or-nothing: if any class conflicts, nothing is registered.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateMethod`] if a handler set declares
    ///   a type twice.
    /// * [`RegistrationError::Conflict`] if a declared type is already
    ///   owned by a consumer of the other category, or by any consumer in
    ///   an exclusive registry, or by this same consumer.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register(&self, consumer: Consumer) -> Result<(), RegistrationError> {
        if let Consumer::Handler(set) = &consumer {
            set.check()?;
        }
        let classes = consumer.signal_classes();
        let mut entries = self.entries.write().expect("registry lock poisoned");

        for class in &classes {
            let Some(entry) = entries.get(class.name()) else {
                continue;
            };
            let owner = entry.consumers.iter().find(|existing| {
                existing.category() != consumer.category()
                    || self.ownership == Ownership::Exclusive
                    || existing.id() == consumer.id()
            });
            if let Some(owner) = owner {
                return Err(RegistrationError::Conflict {
                    signal_type: class.name().to_string(),
                    owner: owner.id().to_string(),
                    owner_category: owner.category(),
                    consumer: consumer.id().to_string(),
                    category: consumer.category(),
                });
            }
        }

        for class in classes {
            entries
                .entry(class.name().to_string())
                .or_insert_with(|| Entry {
                    class,
                    consumers: Vec::new(),
                })
                .consumers
                .push(consumer.clone());
        }
        tracing::debug!(
            consumer = consumer.id(),
            category = %consumer.category(),
            "consumer registered"
        );
        Ok(())
    }

    /// Remove a consumer from every type it declares.
    ///
    /// Types the consumer does not own are skipped with a warning.
    ///
    /// # Returns
    ///
    /// The types that were released.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn unregister(&self, consumer: &Consumer) -> Vec<String> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let mut released = Vec::new();
        for class in consumer.signal_classes() {
            let name = class.name();
            let owned = entries
                .get(name)
                .is_some_and(|e| e.consumers.iter().any(|c| c.id() == consumer.id()));
            if !owned {
                tracing::warn!(
                    consumer = consumer.id(),
                    signal_type = name,
                    "signal type is not owned by consumer; skipping"
                );
                continue;
            }
            if let Some(entry) = entries.get_mut(name) {
                entry.consumers.retain(|c| c.id() != consumer.id());
                if entry.consumers.is_empty() {
                    entries.remove(name);
                }
            }
            released.push(name.to_string());
        }
        released
    }

    /// Remove every consumer.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn clear(&self) {
        self.entries.write().expect("registry lock poisoned").clear();
    }

    /// Whether any consumer accepts `signal_type`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn supports(&self, signal_type: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(signal_type)
    }

    /// The registered class for `signal_type`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn class_of(&self, signal_type: &str) -> Option<SignalClass> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.get(signal_type).map(|e| e.class)
    }

    /// Every consumer of `signal_type`, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn consumers_for(&self, signal_type: &str) -> Vec<Consumer> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .get(signal_type)
            .map(|e| e.consumers.clone())
            .unwrap_or_default()
    }

    /// The first consumer of `signal_type`.
    pub fn consumer_for(&self, signal_type: &str) -> Option<Consumer> {
        self.consumers_for(signal_type).into_iter().next()
    }

    /// Every registered type, sorted.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn signal_types(&self) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut types: Vec<String> = entries.keys().cloned().collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("ownership", &self.ownership)
            .field("signal_types", &self.signal_types())
            .finish()
    }
}
