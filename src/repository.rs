//! Aggregate repository: a signal dispatcher owning one actor per entity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{ActorConfig, AggregateHandle, spawn_actor};
use crate::aggregate::{Aggregate, AggregateModel, AggregateRoot};
use crate::cache::{EntityCache, EntityKey};
use crate::error::{DispatchError, ErrorRecord};
use crate::message::SignalClass;
use crate::outcome::DispatchOutcome;
use crate::registry::{DispatchFuture, SignalDispatcher};
use crate::signal::{Signal, TenantId};
use crate::snapshot::Snapshot;
use crate::storage::EntityStorage;

/// Handle cache keyed by entity.
type HandleCache<A> = HashMap<EntityKey, AggregateHandle<A>>;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Build the entity cache for aggregate roots persisted as snapshots.
///
/// Missing records load as fresh instances at version 0.
pub(crate) fn root_cache<A: Aggregate>(
    storage: Arc<dyn EntityStorage<Snapshot<A>>>,
    model: Arc<AggregateModel<A>>,
    multitenant: bool,
) -> EntityCache<AggregateRoot<A>> {
    let loader = Arc::clone(&storage);
    EntityCache::new(
        multitenant,
        move |key: &EntityKey| {
            let root = match loader.load(key)? {
                Some(snapshot) => AggregateRoot::from_snapshot(key.clone(), snapshot, Arc::clone(&model)),
                None => AggregateRoot::with_model(key.clone(), Arc::clone(&model)),
            };
            Ok(root)
        },
        move |root: &AggregateRoot<A>| storage.store(root.key(), &root.to_snapshot()),
    )
}

/// Routes commands to per-entity aggregate actors.
///
/// Each entity gets its own actor, so commands for one entity are handled
/// one at a time in arrival order while different entities proceed in
/// parallel. Idle actors shut down after the idle timeout and are
/// respawned on the next command. Register the repository with a
/// [`SignalBus`](crate::SignalBus) to receive every command its
/// aggregate's model handles.
pub struct AggregateRepository<A> {
    consumer_id: String,
    model: Arc<AggregateModel<A>>,
    cache: Arc<EntityCache<AggregateRoot<A>>>,
    handles: RwLock<HandleCache<A>>,
    multitenant: bool,
    idle_timeout: Duration,
}

impl<A: Aggregate> AggregateRepository<A> {
    /// Start building a repository over `storage`.
    pub fn builder<S>(storage: Arc<S>) -> AggregateRepositoryBuilder<A>
    where
        S: EntityStorage<Snapshot<A>> + 'static,
    {
        AggregateRepositoryBuilder::new(storage)
    }

    /// The aggregate's routing table.
    pub fn model(&self) -> &AggregateModel<A> {
        &self.model
    }

    /// Whether entities are distinguished by tenant.
    pub fn is_multitenant(&self) -> bool {
        self.multitenant
    }

    /// The key of entity `id`, honouring the tenancy mode.
    pub fn key_for(&self, tenant: Option<&TenantId>, id: &str) -> EntityKey {
        let key = EntityKey::new(A::AGGREGATE_TYPE, id);
        match tenant {
            Some(tenant) if self.multitenant => key.with_tenant(tenant.clone()),
            _ => key,
        }
    }

    fn key_of(&self, signal: &Signal) -> Option<EntityKey> {
        signal
            .target
            .as_deref()
            .map(|id| self.key_for(signal.tenant(), id))
    }

    /// Get a handle to an entity's actor, spawning it if needed.
    ///
    /// If the actor is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise spawns a new actor.
    pub async fn handle(&self, key: &EntityKey) -> AggregateHandle<A> {
        // Fast path: check cache with read lock.
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(key)
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        // Slow path: re-check under the write lock so one key never has
        // two live actors.
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(key)
            && handle.is_alive()
        {
            return handle.clone();
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            entity = %key,
            "spawning actor"
        );
        let config = ActorConfig {
            idle_timeout: self.idle_timeout,
        };
        let handle = spawn_actor::<A>(key.clone(), Arc::clone(&self.cache), config);
        handles.insert(key.clone(), handle.clone());
        handle
    }

    /// Dispatch a command to its target entity.
    ///
    /// A signal without a target fails without reaching any actor. If the
    /// actor exited between lookup and delivery, it is respawned and the
    /// command delivered once more.
    ///
    /// # Errors
    ///
    /// See [`AggregateHandle::dispatch`].
    pub async fn dispatch_signal(&self, signal: Signal) -> Result<DispatchOutcome, DispatchError> {
        let Some(key) = self.key_of(&signal) else {
            return Ok(missing_target(&signal));
        };
        match self.handle(&key).await.dispatch(signal.clone()).await {
            Err(DispatchError::ActorGone) => self.handle(&key).await.dispatch(signal).await,
            other => other,
        }
    }

    /// Dispatch several commands, batching those for the same entity.
    ///
    /// Each entity's commands run back to back on its actor with the
    /// entity cached, so it is loaded and stored once per batch.
    ///
    /// # Returns
    ///
    /// One outcome per signal, in input order.
    ///
    /// # Errors
    ///
    /// See [`AggregateHandle::dispatch_batch`]. Entities after the
    /// failing one are not dispatched.
    pub async fn dispatch_batch(&self, signals: Vec<Signal>) -> Result<Vec<DispatchOutcome>, DispatchError> {
        let mut outcomes: Vec<Option<DispatchOutcome>> = vec![None; signals.len()];
        let mut groups: Vec<(EntityKey, Vec<usize>, Vec<Signal>)> = Vec::new();

        for (index, signal) in signals.into_iter().enumerate() {
            let Some(key) = self.key_of(&signal) else {
                outcomes[index] = Some(missing_target(&signal));
                continue;
            };
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, indices, batch)) => {
                    indices.push(index);
                    batch.push(signal);
                }
                None => groups.push((key, vec![index], vec![signal])),
            }
        }

        for (key, indices, batch) in groups {
            let results = self.handle(&key).await.dispatch_batch(batch).await?;
            for (index, outcome) in indices.into_iter().zip(results) {
                outcomes[index] = Some(outcome);
            }
        }
        Ok(outcomes.into_iter().flatten().collect())
    }

    /// Capture the current state of entity `id`.
    ///
    /// # Errors
    ///
    /// See [`AggregateHandle::snapshot`].
    pub async fn snapshot(&self, tenant: Option<&TenantId>, id: &str) -> Result<Snapshot<A>, DispatchError> {
        let key = self.key_for(tenant, id);
        self.handle(&key).await.snapshot().await
    }
}

fn missing_target(signal: &Signal) -> DispatchOutcome {
    DispatchOutcome::Failure(ErrorRecord::new(
        "MissingTarget",
        format!("signal `{}` of type `{}` has no target entity", signal.id, signal.signal_type),
    ))
}

impl<A: Aggregate> SignalDispatcher for AggregateRepository<A> {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn signal_classes(&self) -> Vec<SignalClass> {
        self.model.command_classes()
    }

    fn dispatch<'a>(&'a self, signal: Signal) -> DispatchFuture<'a> {
        Box::pin(self.dispatch_signal(signal))
    }
}

// Manual `Debug`: handles and cache internals are not useful to print.
impl<A: Aggregate> fmt::Debug for AggregateRepository<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("consumer_id", &self.consumer_id)
            .field("multitenant", &self.multitenant)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and constructing an [`AggregateRepository`].
pub struct AggregateRepositoryBuilder<A> {
    storage: Arc<dyn EntityStorage<Snapshot<A>>>,
    consumer_id: Option<String>,
    multitenant: bool,
    idle_timeout: Duration,
}

impl<A: Aggregate> AggregateRepositoryBuilder<A> {
    fn new<S>(storage: Arc<S>) -> Self
    where
        S: EntityStorage<Snapshot<A>> + 'static,
    {
        Self {
            storage,
            consumer_id: None,
            multitenant: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Override the consumer identifier.
    ///
    /// Defaults to `aggregate:<AGGREGATE_TYPE>`.
    pub fn consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = Some(id.into());
        self
    }

    /// Distinguish entities by tenant.
    ///
    /// Defaults to `false`: the tenant of incoming signals is ignored when
    /// locating entities.
    pub fn multitenant(mut self, multitenant: bool) -> Self {
        self.multitenant = multitenant;
        self
    }

    /// Set the idle timeout for actors.
    ///
    /// Actors that receive no messages for this duration shut down; the
    /// next command respawns them and reloads the entity from storage.
    ///
    /// Default: 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Build the repository.
    pub fn build(self) -> AggregateRepository<A> {
        let model = Arc::new(A::model());
        let cache = root_cache(self.storage, Arc::clone(&model), self.multitenant);
        AggregateRepository {
            consumer_id: self
                .consumer_id
                .unwrap_or_else(|| format!("aggregate:{}", A::AGGREGATE_TYPE)),
            model,
            cache: Arc::new(cache),
            handles: RwLock::new(HashMap::new()),
            multitenant: self.multitenant,
            idle_timeout: self.idle_timeout,
        }
    }
}
