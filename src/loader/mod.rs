//! Request-scoped batch loading.
//!
//! A [`Loader`] coalesces many "fetch related rows for parent X" requests
//! into one batch query per relationship. `acquire(key, batch_fn)` returns a
//! handle; every `load(parent)` issued while that key's batch is open joins
//! it, and the batch function runs exactly once for the whole window with the
//! accumulated parents.
//!
//! The batching window is explicit: a batch dispatches after
//! [`BatchConfig::delay`], when [`BatchConfig::max_batch`] parents have
//! registered, or when [`Loader::flush`] is called. Loads issued after a
//! batch dispatched open a fresh one under the same key.
//!
//! Loaders are created per request and never shared across requests; results
//! from one requester must not leak into another.

pub mod relation;

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

pub use relation::{BelongsTo, HasMany, HasOne};

/// Stable string identity for one parent-child relationship.
pub type BatchKey = String;

/// Identity used to deduplicate parents within one batch.
pub trait BatchItem: Clone + Send {
    fn batch_id(&self) -> String;
}

impl BatchItem for i64 {
    fn batch_id(&self) -> String {
        self.to_string()
    }
}

impl BatchItem for String {
    fn batch_id(&self) -> String {
        self.clone()
    }
}

/// Error surfaced to a single `load` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The batch function failed; every waiter of the batch sees this.
    #[error("batch fetch failed: {0}")]
    Batch(Arc<anyhow::Error>),

    /// The batch function broke the one-result-per-parent contract.
    #[error("batch produced {got} results for {expected} parents")]
    ShapeMismatch { expected: usize, got: usize },

    /// The batch was dropped before it resolved.
    #[error("load canceled before the batch resolved")]
    Canceled,

    /// A key was acquired again with different parent or result types.
    #[error("batch key {0:?} reused with a different parent or result type")]
    KeyTypeMismatch(BatchKey),
}

/// Batching window settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long a batch stays open to admit more parents.
    pub delay: Duration,
    /// Dispatch early once this many parents have registered.
    pub max_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1),
            max_batch: 1000,
        }
    }
}

type BatchFn<P, V> = dyn Fn(Vec<P>) -> BoxFuture<'static, anyhow::Result<Vec<V>>> + Send + Sync;

struct PendingBatch<P, V> {
    parents: Vec<P>,
    parent_keys: Vec<String>,
    waiters: Vec<(usize, oneshot::Sender<Result<V, LoadError>>)>,
}

impl<P, V> PendingBatch<P, V> {
    fn new() -> Self {
        Self {
            parents: Vec::new(),
            parent_keys: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

/// One open batch. The typed [`PendingBatch`] lives behind `Any` so batches
/// of different parent/value types can share the key map.
struct Pending {
    epoch: u64,
    notify: Arc<Notify>,
    batch: Box<dyn Any + Send>,
}

#[derive(Default)]
struct LoaderState {
    batches: HashMap<BatchKey, Pending>,
    /// Batches taken out of the map by `flush`, parked for their dispatcher.
    flushed: HashMap<u64, Box<dyn Any + Send>>,
    next_epoch: u64,
}

struct LoaderShared {
    config: BatchConfig,
    state: Mutex<LoaderState>,
}

/// A per-request batch coalescer.
#[derive(Clone)]
pub struct Loader {
    shared: Arc<LoaderShared>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::with_config(BatchConfig::default())
    }

    pub fn with_config(config: BatchConfig) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                config,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    /// Get a handle for one relationship key.
    ///
    /// The batch function receives the accumulated parents and must return
    /// exactly one value per parent, in parents order.
    pub fn acquire<P, V, F, Fut>(&self, key: impl Into<BatchKey>, batch_fn: F) -> BatchHandle<P, V>
    where
        P: BatchItem + 'static,
        V: Clone + Send + 'static,
        F: Fn(Vec<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        BatchHandle {
            loader: self.clone(),
            key: key.into(),
            batch_fn: Arc::new(move |parents| batch_fn(parents).boxed()),
        }
    }

    /// Close every open batch now.
    ///
    /// Admission ends synchronously: a `load` issued after `flush` returns
    /// always opens a fresh batch. The batch functions themselves still run
    /// on their dispatcher tasks.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        let drained: Vec<(BatchKey, Pending)> = state.batches.drain().collect();
        for (key, pending) in drained {
            tracing::debug!(key = %key, "Flushing open batch");
            state.flushed.insert(pending.epoch, pending.batch);
            pending.notify.notify_one();
        }
    }

    fn config(&self) -> &BatchConfig {
        &self.shared.config
    }
}

/// Handle for loading through one relationship key.
pub struct BatchHandle<P, V> {
    loader: Loader,
    key: BatchKey,
    batch_fn: Arc<BatchFn<P, V>>,
}

impl<P, V> Clone for BatchHandle<P, V> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            key: self.key.clone(),
            batch_fn: self.batch_fn.clone(),
        }
    }
}

impl<P, V> BatchHandle<P, V>
where
    P: BatchItem + 'static,
    V: Clone + Send + 'static,
{
    /// Request this parent's slice of the eventual batch result.
    pub async fn load(&self, parent: P) -> Result<V, LoadError> {
        let rx = self.register(parent)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Canceled),
        }
    }

    /// Join the open batch for this key, opening one if needed.
    fn register(
        &self,
        parent: P,
    ) -> Result<oneshot::Receiver<Result<V, LoadError>>, LoadError> {
        let (tx, rx) = oneshot::channel();
        let max_batch = self.loader.config().max_batch;

        let mut spawn: Option<(u64, Arc<Notify>)> = None;
        let mut dispatch_now: Option<Arc<Notify>> = None;

        {
            let mut guard = self.loader.shared.state.lock();
            let state = &mut *guard;

            match state.batches.entry(self.key.clone()) {
                Entry::Vacant(entry) => {
                    let epoch = state.next_epoch;
                    state.next_epoch += 1;

                    let mut batch = PendingBatch::<P, V>::new();
                    batch.parent_keys.push(parent.batch_id());
                    batch.parents.push(parent);
                    batch.waiters.push((0, tx));
                    let size = batch.parents.len();

                    let notify = Arc::new(Notify::new());
                    entry.insert(Pending {
                        epoch,
                        notify: notify.clone(),
                        batch: Box::new(batch),
                    });

                    spawn = Some((epoch, notify.clone()));
                    if size >= max_batch {
                        dispatch_now = Some(notify);
                    }
                }
                Entry::Occupied(entry) => {
                    let pending = entry.into_mut();
                    let Some(batch) = pending.batch.downcast_mut::<PendingBatch<P, V>>() else {
                        return Err(LoadError::KeyTypeMismatch(self.key.clone()));
                    };

                    let parent_key = parent.batch_id();
                    let idx = match batch.parent_keys.iter().position(|k| *k == parent_key) {
                        Some(idx) => idx,
                        None => {
                            batch.parent_keys.push(parent_key);
                            batch.parents.push(parent);
                            batch.parents.len() - 1
                        }
                    };
                    batch.waiters.push((idx, tx));

                    if batch.parents.len() >= max_batch {
                        dispatch_now = Some(pending.notify.clone());
                    }
                }
            }
        }

        if let Some((epoch, notify)) = spawn {
            self.spawn_dispatcher(epoch, notify);
        }
        if let Some(notify) = dispatch_now {
            notify.notify_one();
        }

        Ok(rx)
    }

    fn spawn_dispatcher(&self, epoch: u64, notify: Arc<Notify>) {
        let handle = self.clone();
        tokio::spawn(async move {
            let delay = handle.loader.config().delay;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = notify.notified() => {}
            }
            handle.dispatch(epoch).await;
        });
    }

    /// Take this dispatcher's batch and resolve every waiter from one call
    /// to the batch function.
    async fn dispatch(&self, epoch: u64) {
        let taken: Option<Box<dyn Any + Send>> = {
            let mut state = self.loader.shared.state.lock();
            let in_map = matches!(
                state.batches.get(&self.key),
                Some(pending) if pending.epoch == epoch
            );
            if in_map {
                // Admission closes the moment the batch leaves the map
                state.batches.remove(&self.key).map(|pending| pending.batch)
            } else {
                state.flushed.remove(&epoch)
            }
        };

        let Some(taken) = taken else {
            return;
        };
        let Ok(batch) = taken.downcast::<PendingBatch<P, V>>() else {
            return;
        };
        let batch = *batch;

        tracing::debug!(
            key = %self.key,
            parent_count = batch.parents.len(),
            "Dispatching batch"
        );

        match (self.batch_fn)(batch.parents.clone()).await {
            Ok(values) => {
                if values.len() != batch.parents.len() {
                    let err = LoadError::ShapeMismatch {
                        expected: batch.parents.len(),
                        got: values.len(),
                    };
                    for (_, tx) in batch.waiters {
                        let _ = tx.send(Err(err.clone()));
                    }
                    return;
                }

                for (idx, tx) in batch.waiters {
                    let _ = tx.send(Ok(values[idx].clone()));
                }
            }
            Err(err) => {
                tracing::debug!(key = %self.key, error = %err, "Batch fetch failed");
                let err = LoadError::Batch(Arc::new(err));
                for (_, tx) in batch.waiters {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
    }
}
