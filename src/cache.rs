//! Opt-in per-entity cache in front of a load/store pair.
//!
//! Caching is enabled per entity key with [`EntityCache::start_caching`]
//! and ended with [`EntityCache::stop_caching`], which flushes the cached
//! value to the backing store. While enabled, loads are served from
//! memory and stores only update the cached value. Ids that are not
//! enabled bypass the cache entirely.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, StorageError};
use crate::signal::TenantId;

/// Identity of a stored entity: tenant, type, and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Owning tenant; `None` on single-tenant deployments.
    pub tenant: Option<TenantId>,
    /// Entity type name (e.g. an aggregate type).
    pub entity_type: String,
    /// Entity identifier within its type.
    pub id: String,
}

impl EntityKey {
    /// A key without a tenant.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: None,
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant {
            Some(tenant) => write!(f, "{tenant}/{}/{}", self.entity_type, self.id),
            None => write!(f, "{}/{}", self.entity_type, self.id),
        }
    }
}

/// An entity that knows its own key.
pub trait CachedEntity: Clone + Send {
    /// The entity's key.
    fn key(&self) -> &EntityKey;
}

type LoadFn<E> = Box<dyn Fn(&EntityKey) -> Result<E, StorageError> + Send + Sync>;
type StoreFn<E> = Box<dyn Fn(&E) -> Result<(), StorageError> + Send + Sync>;
type Slot<E> = Arc<Mutex<Option<E>>>;

/// Per-entity cache over a load/store pair.
///
/// `load`, `store`, and `stop_caching` for the same key are mutually
/// exclusive. On a single-tenant cache the tenant component of every key
/// is ignored, so keys differing only by tenant share one entry.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use eventfold_bus::{CachedEntity, EntityCache, EntityKey};
///
/// #[derive(Clone)]
/// struct Note { key: EntityKey, text: String }
///
/// impl CachedEntity for Note {
///     fn key(&self) -> &EntityKey { &self.key }
/// }
///
/// let stored = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&stored);
/// let cache = EntityCache::new(
///     false,
///     |key: &EntityKey| Ok(Note { key: key.clone(), text: String::new() }),
///     move |note: &Note| {
///         sink.lock().unwrap().push(note.text.clone());
///         Ok(())
///     },
/// );
///
/// let key = EntityKey::new("note", "n-1");
/// cache.start_caching(&key);
/// let mut note = cache.load(&key).unwrap();
/// note.text = "draft".into();
/// cache.store(note).unwrap();
/// assert!(stored.lock().unwrap().is_empty());
///
/// cache.stop_caching(&key).unwrap();
/// assert_eq!(*stored.lock().unwrap(), vec!["draft".to_string()]);
/// ```
pub struct EntityCache<E> {
    multitenant: bool,
    slots: Mutex<HashMap<EntityKey, Slot<E>>>,
    load_fn: LoadFn<E>,
    store_fn: StoreFn<E>,
}

impl<E: CachedEntity> EntityCache<E> {
    /// Create a cache over the given load and store functions.
    ///
    /// # Arguments
    ///
    /// * `multitenant` - Whether keys are distinguished by tenant.
    /// * `load` - Loads (or creates) the entity for a key from the backing store.
    /// * `store` - Persists an entity to the backing store.
    pub fn new<L, S>(multitenant: bool, load: L, store: S) -> Self
    where
        L: Fn(&EntityKey) -> Result<E, StorageError> + Send + Sync + 'static,
        S: Fn(&E) -> Result<(), StorageError> + Send + Sync + 'static,
    {
        Self {
            multitenant,
            slots: Mutex::new(HashMap::new()),
            load_fn: Box::new(load),
            store_fn: Box::new(store),
        }
    }

    fn normalize(&self, key: &EntityKey) -> EntityKey {
        let mut key = key.clone();
        if !self.multitenant {
            key.tenant = None;
        }
        key
    }

    fn slot(&self, key: &EntityKey) -> Option<Slot<E>> {
        let slots = self.slots.lock().expect("cache lock poisoned");
        slots.get(key).cloned()
    }

    /// Enable caching for `key`. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn start_caching(&self, key: &EntityKey) {
        let key = self.normalize(key);
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        slots.entry(key).or_default();
    }

    /// Flush the cached entity for `key` and disable caching for it.
    ///
    /// The entity is written to the backing store before the entry is
    /// removed; if the write fails the entry stays cached.
    ///
    /// # Errors
    ///
    /// * [`CacheError::NotCached`] if caching is not enabled for `key` or
    ///   nothing was loaded or stored since it was enabled.
    /// * [`CacheError::Storage`] if the flush fails.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    pub fn stop_caching(&self, key: &EntityKey) -> Result<(), CacheError> {
        let key = self.normalize(key);
        let slot = self
            .slot(&key)
            .ok_or_else(|| CacheError::NotCached(key.clone()))?;
        let cached = slot.lock().expect("cache entry lock poisoned");
        if !self.is_current(&key, &slot) {
            // Another stop_caching evicted the entry while we waited.
            return Err(CacheError::NotCached(key));
        }
        let entity = cached
            .as_ref()
            .ok_or_else(|| CacheError::NotCached(key.clone()))?;
        (self.store_fn)(entity)?;

        // Evict under the entry lock so waiting loads and stores see it.
        self.slots.lock().expect("cache lock poisoned").remove(&key);
        tracing::debug!(key = %key, "entity flushed and evicted from cache");
        Ok(())
    }

    /// Whether `slot` is still the live entry for `key`.
    ///
    /// Called with the entry lock held; the lock order is entry, then map.
    fn is_current(&self, key: &EntityKey, slot: &Slot<E>) -> bool {
        self.slot(key).is_some_and(|live| Arc::ptr_eq(&live, slot))
    }

    /// Whether caching is enabled for `key`.
    pub fn is_caching(&self, key: &EntityKey) -> bool {
        self.slot(&self.normalize(key)).is_some()
    }

    /// Load the entity for `key`.
    ///
    /// Served from the cache if enabled and present; loaded and cached if
    /// enabled and absent; loaded directly otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing load fails.
    pub fn load(&self, key: &EntityKey) -> Result<E, StorageError> {
        let key = self.normalize(key);
        loop {
            let Some(slot) = self.slot(&key) else {
                return (self.load_fn)(&key);
            };
            let mut cached = slot.lock().expect("cache entry lock poisoned");
            if !self.is_current(&key, &slot) {
                continue;
            }
            if let Some(entity) = cached.as_ref() {
                return Ok(entity.clone());
            }
            let entity = (self.load_fn)(&key)?;
            *cached = Some(entity.clone());
            return Ok(entity);
        }
    }

    /// Store an entity under its own key.
    ///
    /// Updates only the cached value if caching is enabled for the key;
    /// writes to the backing store otherwise. A store racing with
    /// [`stop_caching`](EntityCache::stop_caching) waits for the flush and
    /// then writes through.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing store fails.
    pub fn store(&self, entity: E) -> Result<(), StorageError> {
        let key = self.normalize(entity.key());
        loop {
            let Some(slot) = self.slot(&key) else {
                return (self.store_fn)(&entity);
            };
            let mut cached = slot.lock().expect("cache entry lock poisoned");
            if self.is_current(&key, &slot) {
                *cached = Some(entity);
                return Ok(());
            }
        }
    }
}

impl<E> fmt::Debug for EntityCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.slots.lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("EntityCache")
            .field("multitenant", &self.multitenant)
            .field("cached", &cached)
            .finish_non_exhaustive()
    }
}
