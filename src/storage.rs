//! Entity storage trait and built-in backends.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Serialize, de::DeserializeOwned};

use crate::cache::EntityKey;
use crate::error::StorageError;

/// Backing store for entity records, keyed by [`EntityKey`].
///
/// Implementations must be safe to call from any thread; the cache and
/// aggregate actors call them synchronously.
pub trait EntityStorage<R>: Send + Sync {
    /// Load the record for `key`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn load(&self, key: &EntityKey) -> Result<Option<R>, StorageError>;

    /// Persist the record for `key`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn store(&self, key: &EntityKey, record: &R) -> Result<(), StorageError>;
}

/// In-memory backend. Counts loads and stores.
pub struct InMemoryStorage<R> {
    records: RwLock<HashMap<EntityKey, R>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
}

impl<R> InMemoryStorage<R> {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
        }
    }

    /// Number of `load` calls served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of `store` calls served.
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of stored records.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn len(&self) -> usize {
        self.records.read().expect("storage lock poisoned").len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Default for InMemoryStorage<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send + Sync> EntityStorage<R> for InMemoryStorage<R> {
    fn load(&self, key: &EntityKey) -> Result<Option<R>, StorageError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().expect("storage lock poisoned");
        Ok(records.get(key).cloned())
    }

    fn store(&self, key: &EntityKey, record: &R) -> Result<(), StorageError> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write().expect("storage lock poisoned");
        records.insert(key.clone(), record.clone());
        Ok(())
    }
}

/// Directory name used for entities without a tenant.
const SHARED_TENANT_DIR: &str = "_shared";

/// File-backed store: one JSON document per entity.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     entities/
///         <tenant or _shared>/
///             <entity_type>/
///                 <id>.json
/// ```
///
/// Writes are atomic via a temp-rename pattern, so readers never see a
/// partially-written file. A file that fails to deserialize is an error,
/// never a missing record: the file is the entity's only copy.
///
/// Key components become path segments, so tenants, entity types, and ids
/// containing path separators, `.` or `..` are rejected.
#[derive(Debug, Clone)]
pub struct FileStorage<R> {
    base_dir: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R> FileStorage<R> {
    /// Create a store rooted at `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for entity files. It does not need to
    ///   exist yet; directories are created on the first store.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            _record: PhantomData,
        }
    }

    /// Returns the root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Compute the path of the file holding `key`'s record.
    ///
    /// # Returns
    ///
    /// `<base_dir>/entities/<tenant or _shared>/<entity_type>/<id>.json`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if a key component is empty,
    /// `.` or `..`, or contains a path separator or NUL.
    pub fn record_path(&self, key: &EntityKey) -> Result<PathBuf, StorageError> {
        let tenant = key
            .tenant
            .as_ref()
            .map_or(SHARED_TENANT_DIR, |t| t.as_str());
        for segment in [tenant, key.entity_type.as_str(), key.id.as_str()] {
            check_segment(key, segment)?;
        }
        Ok(self
            .base_dir
            .join("entities")
            .join(tenant)
            .join(&key.entity_type)
            .join(format!("{}.json", key.id)))
    }
}

fn check_segment(key: &EntityKey, segment: &str) -> Result<(), StorageError> {
    let reason = if segment.is_empty() {
        "empty component"
    } else if segment == "." || segment == ".." {
        "relative path component"
    } else if segment.contains(['/', '\\', '\0']) {
        "path separator in component"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: key.clone(),
        reason,
    })
}

impl<R> EntityStorage<R> for FileStorage<R>
where
    R: Serialize + DeserializeOwned + Send + Sync,
{
    fn load(&self, key: &EntityKey) -> Result<Option<R>, StorageError> {
        let path = self.record_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice::<R>(&bytes).map(Some).map_err(|e| {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "entity record is corrupt"
            );
            e.into()
        })
    }

    fn store(&self, key: &EntityKey, record: &R) -> Result<(), StorageError> {
        let path = self.record_path(key)?;
        let dir = path
            .parent()
            .expect("record_path always has a parent directory");
        fs::create_dir_all(dir)?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
