//! Actor loop that owns one aggregate instance and processes its signals.
//!
//! The actor runs on a dedicated thread and sequentially processes messages
//! from an `mpsc` channel, which makes it the single writer for its entity.
//! Each message loads the entity through the [`EntityCache`], dispatches,
//! and stores the result back on success.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle). Actors are
//! spawned by [`AggregateRepository`](crate::AggregateRepository).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::cache::{EntityCache, EntityKey};
use crate::caught::CaughtError;
use crate::error::{AggregateError, CacheError, DispatchError, ErrorRecord, StorageError};
use crate::outcome::DispatchOutcome;
use crate::signal::Signal;
use crate::snapshot::Snapshot;

/// Configuration for the actor loop.
///
/// Internal to the crate -- callers configure idle timeout through
/// [`AggregateRepositoryBuilder::idle_timeout`](crate::AggregateRepositoryBuilder::idle_timeout).
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
}

type DispatchReply = Result<DispatchOutcome, DispatchError>;
type BatchReply = Result<Vec<DispatchOutcome>, DispatchError>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A> {
    /// Dispatch one command to the aggregate.
    Dispatch {
        signal: Signal,
        reply: oneshot::Sender<DispatchReply>,
    },

    /// Dispatch several commands with the entity cached for the whole
    /// batch and stored once at the end.
    Batch {
        signals: Vec<Signal>,
        reply: oneshot::Sender<BatchReply>,
    },

    /// Capture the current state.
    GetSnapshot {
        reply: oneshot::Sender<Result<Snapshot<A>, StorageError>>,
    },

    /// Gracefully shut down the actor loop.
    #[allow(dead_code)] // Constructed only in tests.
    Shutdown,
}

/// Runs the aggregate actor loop on a dedicated thread.
///
/// The loop exits when the channel closes (all senders dropped), a
/// `Shutdown` message is received, or the idle timeout elapses.
///
/// # Arguments
///
/// * `key` - The entity this actor owns.
/// * `cache` - Load/store path for the entity.
/// * `rx` - Receiving end of the mpsc channel carrying `ActorMessage`s.
/// * `config` - Actor configuration (idle timeout).
pub(crate) fn run_actor<A: Aggregate>(
    key: EntityKey,
    cache: Arc<EntityCache<AggregateRoot<A>>>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    config: ActorConfig,
) {
    // The parent runtime may be current-thread, which does not drive
    // timers for other threads. A minimal local runtime keeps the idle
    // timeout self-contained.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to create actor timeout runtime");

    loop {
        let idle_timeout = config.idle_timeout;
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(msg)) => match msg {
                ActorMessage::Dispatch { signal, reply } => {
                    let _span = tracing::info_span!(
                        "dispatch",
                        aggregate_type = A::AGGREGATE_TYPE,
                        entity = %key,
                        signal_id = %signal.id,
                        signal_type = %signal.signal_type,
                    )
                    .entered();
                    let _ = reply.send(dispatch_one(&cache, &key, &signal));
                }

                ActorMessage::Batch { signals, reply } => {
                    let _span = tracing::info_span!(
                        "dispatch",
                        aggregate_type = A::AGGREGATE_TYPE,
                        entity = %key,
                        batch = signals.len(),
                    )
                    .entered();
                    let _ = reply.send(dispatch_batch(&cache, &key, &signals));
                }

                ActorMessage::GetSnapshot { reply } => {
                    let result = cache.load(&key).map(|root| root.to_snapshot());
                    let _ = reply.send(result);
                }

                ActorMessage::Shutdown => break,
            },
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    entity = %key,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }
}

/// Load, dispatch, and store back on success.
///
/// Rejections and runtime failures are classified into the outcome and
/// leave the stored entity untouched.
fn dispatch_one<A: Aggregate>(
    cache: &EntityCache<AggregateRoot<A>>,
    key: &EntityKey,
    signal: &Signal,
) -> DispatchReply {
    let mut root = cache.load(key)?;
    match root.dispatch(signal) {
        Ok(events) => {
            root.commit_events();
            let version = root.version();
            cache.store(root)?;
            tracing::debug!(count = events.len(), version, "command handled");
            Ok(DispatchOutcome::Success(events))
        }
        Err(AggregateError::Configuration(e)) => Err(e.into()),
        Err(AggregateError::Handler(e)) => Ok(CaughtError::classify(e, signal)
            .into_outcome()
            .unwrap_or_else(|| DispatchOutcome::Success(Vec::new()))),
        Err(e @ AggregateError::Decode { .. }) => {
            Ok(DispatchOutcome::Failure(ErrorRecord::from_error("DecodeError", &e)))
        }
    }
}

fn dispatch_batch<A: Aggregate>(
    cache: &EntityCache<AggregateRoot<A>>,
    key: &EntityKey,
    signals: &[Signal],
) -> BatchReply {
    cache.start_caching(key);
    let mut outcomes = Vec::with_capacity(signals.len());
    let mut result = Ok(());
    for signal in signals {
        match dispatch_one(cache, key, signal) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    match cache.stop_caching(key) {
        // Nothing was loaded: empty batch, or the first load failed.
        Ok(()) | Err(CacheError::NotCached(_)) => {}
        Err(CacheError::Storage(e)) => {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
    }
    result.map(|()| outcomes)
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor thread over a bounded channel.
#[derive(Debug)]
pub struct AggregateHandle<A> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

// Manual `Clone`: only the sender is cloned, whatever `A` is.
impl<A> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the outcome.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Configuration`] -- the aggregate model is
    ///   missing a handler or applier.
    /// * [`DispatchError::Storage`] -- loading or storing the entity failed.
    /// * [`DispatchError::ActorGone`] -- the actor thread has exited.
    pub async fn dispatch(&self, signal: Signal) -> DispatchReply {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Dispatch { signal, reply: tx })
            .await
            .map_err(|_| DispatchError::ActorGone)?;
        rx.await.map_err(|_| DispatchError::ActorGone)?
    }

    /// Send several commands to be handled back to back.
    ///
    /// The entity is loaded once and stored once. Processing stops at the
    /// first error; outcomes of the commands before it are discarded
    /// along with the error, but their effects are still stored.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub async fn dispatch_batch(&self, signals: Vec<Signal>) -> BatchReply {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Batch { signals, reply: tx })
            .await
            .map_err(|_| DispatchError::ActorGone)?;
        rx.await.map_err(|_| DispatchError::ActorGone)?
    }

    /// Capture the current state of the aggregate.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Storage`] -- loading the entity failed.
    /// * [`DispatchError::ActorGone`] -- the actor thread has exited.
    pub async fn snapshot(&self) -> Result<Snapshot<A>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetSnapshot { reply: tx })
            .await
            .map_err(|_| DispatchError::ActorGone)?;
        Ok(rx.await.map_err(|_| DispatchError::ActorGone)??)
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` if the actor thread has exited (e.g. due to idle
    /// timeout). The repository uses this to evict stale handles and
    /// respawn the actor on the next dispatch.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    #[cfg(test)]
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }
}

/// Spawn an actor owning `key`.
pub(crate) fn spawn_actor<A: Aggregate>(
    key: EntityKey,
    cache: Arc<EntityCache<AggregateRoot<A>>>,
    config: ActorConfig,
) -> AggregateHandle<A> {
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(32);
    std::thread::spawn(move || {
        run_actor::<A>(key, cache, rx, config);
    });
    AggregateHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{
        BreakProject, Project, ProjectAlreadyExists, StartProject, add_tasks, command, create,
    };
    use crate::repository::root_cache;
    use crate::storage::{EntityStorage, InMemoryStorage};

    const FOREVER: Duration = Duration::from_secs(3600);

    fn spawn(
        storage: &Arc<InMemoryStorage<Snapshot<Project>>>,
        idle_timeout: Duration,
    ) -> AggregateHandle<Project> {
        let storage: Arc<dyn EntityStorage<Snapshot<Project>>> = storage.clone();
        let cache = Arc::new(root_cache::<Project>(
            storage,
            Arc::new(<Project as Aggregate>::model()),
            false,
        ));
        spawn_actor(
            EntityKey::new("project", "p-1"),
            cache,
            ActorConfig { idle_timeout },
        )
    }

    #[tokio::test]
    async fn dispatch_stores_state() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, FOREVER);

        let outcome = handle
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect("dispatch should succeed");
        assert_eq!(outcome.events().len(), 1);

        let snapshot = handle.snapshot().await.expect("snapshot should succeed");
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.state.name, "Apollo");
        assert_eq!(storage.store_count(), 1);
    }

    #[tokio::test]
    async fn state_persists_across_respawn() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, FOREVER);
        handle
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect("dispatch should succeed");
        handle.shutdown().await;

        let respawned = spawn(&storage, FOREVER);
        let outcome = respawned
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect("dispatch should succeed");
        match outcome {
            DispatchOutcome::Rejection(event) => assert!(event.is::<ProjectAlreadyExists>()),
            other => panic!("expected rejection, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_do_not_store() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, FOREVER);
        handle
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect("dispatch should succeed");

        let outcome = handle
            .dispatch(command(BreakProject { id: "p-1".into() }))
            .await
            .expect("dispatch should succeed");
        assert_eq!(
            outcome.error().map(|e| e.message.as_str()),
            Some("project storage offline")
        );
        assert_eq!(storage.store_count(), 1);
    }

    #[tokio::test]
    async fn batch_loads_and_stores_once() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, FOREVER);

        let outcomes = handle
            .dispatch_batch(vec![
                create("p-1", "Apollo"),
                add_tasks("p-1", &["design", "build"]),
                command(StartProject { id: "p-1".into() }),
                command(StartProject { id: "p-1".into() }),
            ])
            .await
            .expect("batch should succeed");

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[..3].iter().all(DispatchOutcome::is_success));
        assert!(outcomes[3].is_rejection());
        assert_eq!(storage.load_count(), 1);
        assert_eq!(storage.store_count(), 1);

        let snapshot = handle.snapshot().await.expect("snapshot should succeed");
        assert_eq!(snapshot.version, 4);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, FOREVER);
        let outcomes = handle
            .dispatch_batch(Vec::new())
            .await
            .expect("batch should succeed");
        assert!(outcomes.is_empty());
        assert_eq!(storage.store_count(), 0);
    }

    #[tokio::test]
    async fn idle_actor_exits() {
        let storage = Arc::new(InMemoryStorage::new());
        let handle = spawn(&storage, Duration::from_millis(50));
        handle
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect("dispatch should succeed");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive());

        let err = handle
            .dispatch(create("p-1", "Apollo"))
            .await
            .expect_err("dispatch to exited actor should fail");
        assert!(matches!(err, DispatchError::ActorGone));
    }
}
