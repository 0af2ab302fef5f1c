//! Coalesces concurrent loads into batched fetches.
//!
//! Loads issued within one scheduler tick accumulate into an open batch and
//! dispatch together once the task yields. A `validate` hook bounds the batch
//! (typically by prospective URL length); overflowing it dispatches the open
//! batch early instead of failing the new key.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use tether_core::ClientError;

/// Resolves one item of a dispatched batch.
pub type ItemFuture<V> = BoxFuture<'static, Result<V, ClientError>>;

/// A started batch fetch: the per-item result futures (available once the
/// response starts) and the handle that aborts the network call.
pub struct FetchHandle<V> {
    pub items: BoxFuture<'static, Result<Vec<ItemFuture<V>>, ClientError>>,
    pub cancel: CancellationToken,
}

impl<V> std::fmt::Debug for FetchHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FetchHandle")
    }
}

/// Performs one batched request. Implementations must return item futures in
/// key order; a shorter vec rejects the unmatched tail.
pub trait BatchFetcher<K>: Send + Sync {
    type Value: Send + 'static;

    /// Whether this prospective key set still fits a single request.
    fn validate(&self, keys: &[&K]) -> bool;

    fn fetch(&self, keys: Vec<K>) -> FetchHandle<Self::Value>;
}

struct BatchShared {
    total: usize,
    cancelled: Mutex<usize>,
    cancel: CancellationToken,
}

struct ItemInner<V> {
    tx: Option<oneshot::Sender<Result<V, ClientError>>>,
    cancelled: bool,
    /// Set at dispatch; pre-dispatch cancellations never reach the network.
    batch: Option<Arc<BatchShared>>,
}

type ItemRef<V> = Arc<Mutex<ItemInner<V>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn deliver<V>(item: &ItemRef<V>, result: Result<V, ClientError>) {
    let tx = lock(item).tx.take();
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

fn record_batch_cancel(batch: &Arc<BatchShared>) {
    let fire = {
        let mut count = lock(&batch.cancelled);
        *count += 1;
        *count == batch.total
    };
    // The network call is torn down only when every item in the batch is
    // gone; a partial cancellation keeps it running for the others.
    if fire {
        batch.cancel.cancel();
    }
}

fn cancel_item<V>(item: &ItemRef<V>) {
    let (tx, batch) = {
        let mut inner = lock(item);
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        (inner.tx.take(), inner.batch.clone())
    };
    if let Some(tx) = tx {
        let _ = tx.send(Err(ClientError::Cancelled));
    }
    if let Some(batch) = batch {
        record_batch_cancel(&batch);
    }
}

/// One in-flight load.
#[derive(Debug)]
pub struct LoadHandle<V> {
    rx: oneshot::Receiver<Result<V, ClientError>>,
    item: ItemRef<V>,
}

impl<V> std::fmt::Debug for ItemInner<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ItemInner")
    }
}

impl<V> LoadHandle<V> {
    pub async fn wait(self) -> Result<V, ClientError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::protocol(
                "batch dropped before delivering a result",
            )),
        }
    }

    pub fn cancel(&self) {
        cancel_item(&self.item);
    }

    /// Detached cancel handle, usable after `wait` consumed the load.
    pub fn canceller(&self) -> LoadCanceller<V> {
        LoadCanceller {
            item: self.item.clone(),
        }
    }
}

#[derive(Debug)]
pub struct LoadCanceller<V> {
    item: ItemRef<V>,
}

impl<V> Clone for LoadCanceller<V> {
    fn clone(&self) -> Self {
        LoadCanceller {
            item: self.item.clone(),
        }
    }
}

impl<V> LoadCanceller<V> {
    pub fn cancel(&self) {
        cancel_item(&self.item);
    }
}

struct LoaderState<K, V> {
    open: Vec<(K, ItemRef<V>)>,
    flush_scheduled: bool,
}

/// The batcher itself. Cheap to clone; clones share one open batch.
pub struct DataLoader<K, V> {
    fetcher: Arc<dyn BatchFetcher<K, Value = V>>,
    state: Arc<Mutex<LoaderState<K, V>>>,
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        DataLoader {
            fetcher: self.fetcher.clone(),
            state: self.state.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for DataLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataLoader")
    }
}

impl<K, V> DataLoader<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new(fetcher: Arc<dyn BatchFetcher<K, Value = V>>) -> Self {
        DataLoader {
            fetcher,
            state: Arc::new(Mutex::new(LoaderState {
                open: Vec::new(),
                flush_scheduled: false,
            })),
        }
    }

    pub fn load(&self, key: K) -> LoadHandle<V> {
        let (tx, rx) = oneshot::channel();
        let item: ItemRef<V> = Arc::new(Mutex::new(ItemInner {
            tx: Some(tx),
            cancelled: false,
            batch: None,
        }));

        let mut ready: Vec<Vec<(K, ItemRef<V>)>> = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.open.is_empty() {
                // The first key is always accepted so a single oversized key
                // still makes progress; it just ships alone, right away.
                let fits_alone = self.fetcher.validate(&[&key]);
                state.open.push((key, item.clone()));
                if fits_alone {
                    self.schedule_flush(&mut state);
                } else {
                    ready.push(std::mem::take(&mut state.open));
                }
            } else {
                let fits = {
                    let mut keys: Vec<&K> = state.open.iter().map(|(k, _)| k).collect();
                    keys.push(&key);
                    self.fetcher.validate(&keys)
                };
                if fits {
                    state.open.push((key, item.clone()));
                    self.schedule_flush(&mut state);
                } else {
                    // Ship the open batch unmodified and start over with the
                    // new key.
                    ready.push(std::mem::take(&mut state.open));
                    let fits_alone = self.fetcher.validate(&[&key]);
                    state.open.push((key, item.clone()));
                    if fits_alone {
                        self.schedule_flush(&mut state);
                    } else {
                        ready.push(std::mem::take(&mut state.open));
                    }
                }
            }
        }

        for batch in ready {
            self.dispatch(batch);
        }
        LoadHandle { rx, item }
    }

    fn schedule_flush(&self, state: &mut LoaderState<K, V>) {
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
        let loader = self.clone();
        tokio::spawn(async move {
            // One cooperative yield: everything loaded before the current
            // task suspends joins this batch.
            tokio::task::yield_now().await;
            let batch = {
                let mut state = lock(&loader.state);
                state.flush_scheduled = false;
                std::mem::take(&mut state.open)
            };
            loader.dispatch(batch);
        });
    }

    fn dispatch(&self, batch: Vec<(K, ItemRef<V>)>) {
        let mut keys = Vec::new();
        let mut items = Vec::new();
        for (key, item) in batch {
            if lock(&item).cancelled {
                continue;
            }
            keys.push(key);
            items.push(item);
        }
        if items.is_empty() {
            return;
        }
        trace!(batch_size = items.len(), "dispatching batch");

        let handle = self.fetcher.fetch(keys);
        let shared = Arc::new(BatchShared {
            total: items.len(),
            cancelled: Mutex::new(0),
            cancel: handle.cancel.clone(),
        });
        for item in &items {
            let cancelled_meanwhile = {
                let mut inner = lock(item);
                inner.batch = Some(shared.clone());
                inner.cancelled
            };
            if cancelled_meanwhile {
                record_batch_cancel(&shared);
            }
        }

        let items_fut = handle.items;
        tokio::spawn(async move {
            match items_fut.await {
                Ok(item_futures) => {
                    let mut item_futures = item_futures.into_iter();
                    for item in items {
                        match item_futures.next() {
                            Some(fut) => {
                                tokio::spawn(async move {
                                    deliver(&item, fut.await);
                                });
                            }
                            None => deliver(
                                &item,
                                Err(ClientError::protocol(
                                    "batch response missing an item result",
                                )),
                            ),
                        }
                    }
                }
                Err(e) => {
                    for item in &items {
                        deliver(item, Err(e.clone()));
                    }
                }
            }
        });
    }
}
