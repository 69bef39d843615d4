//! Request-coalescing asynchronous cache.
//!
//! A [`Cache`] guarantees that, for any key, at most one loader invocation
//! is in flight at any time. Concurrent requesters attach as waiters and
//! all observe the identical outcome. A single server task owns the store
//! and the waiter lists; a bounded pool of loader workers performs the
//! actual loads and reports back on a write channel, so the shared maps
//! are never touched outside the server task.

use std::collections::{HashMap, VecDeque, hash_map::Entry};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, trace};

use crate::provider::ProviderError;

pub mod file;

/// Errors surfaced by cache lookups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CacheError {
    /// The loader could not locate the resource. Subject to the cache's
    /// negative-caching policy.
    #[error("not found: {message}")]
    NotFound {
        /// Loader description of the missing resource.
        message: String,
    },
    /// The loader failed transiently and exhausted its retries.
    #[error("load failed: {message}")]
    Transient {
        /// Loader description of the failure.
        message: String,
    },
    /// The cache has been closed; no further loads are performed.
    #[error("cache session is closed")]
    Closed,
}

impl From<ProviderError> for CacheError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::NotFound { .. } => Self::NotFound {
                message: value.to_string(),
            },
            ProviderError::Transport { message } => Self::Transient { message },
        }
    }
}

/// Final outcome stored per key and delivered to every waiter.
pub type Outcome<T> = Result<T, CacheError>;

/// Future produced by a loader invocation.
pub type LoaderFuture<T> = Pin<Box<dyn Future<Output = Outcome<T>> + Send>>;

/// Loader callback invoked at most once per key at any moment.
pub type Loader<T> = Arc<dyn Fn(String) -> LoaderFuture<T> + Send + Sync>;

enum Request<T> {
    Read {
        key: String,
        receiver: Option<oneshot::Sender<Outcome<T>>>,
    },
    Peek {
        key: String,
        receiver: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a coalescing cache session. Cloning shares the session.
pub struct Cache<T> {
    requests: mpsc::Sender<Request<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<T> Cache<T>
where
    T: Clone + Send + 'static,
{
    /// Starts a cache session.
    ///
    /// `loader` resolves a key to a value; it is retried up to `retries`
    /// additional times on failure. When `cache_on_error` is set, a final
    /// failure is stored and replayed to later requesters; otherwise the
    /// failure is delivered to the waiters attached at the time and then
    /// forgotten. `workers` bounds loader parallelism across all keys.
    #[must_use]
    pub fn new(loader: Loader<T>, retries: usize, cache_on_error: bool, workers: usize) -> Self {
        let workers = workers.max(1);
        let (request_tx, request_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (job_tx, job_rx) = mpsc::channel::<String>(1);

        debug!(retries, cache_on_error, workers, "starting cache session");

        let job_rx = Arc::new(Mutex::new(job_rx));
        for worker in 0..workers {
            tokio::spawn(run_loader_worker(
                worker,
                Arc::clone(&loader),
                retries,
                Arc::clone(&job_rx),
                write_tx.clone(),
            ));
        }

        tokio::spawn(run_server(
            cache_on_error,
            request_rx,
            write_rx,
            write_tx,
            job_tx,
        ));

        Self {
            requests: request_tx,
        }
    }

    /// Blocks until a final outcome exists for `key` and returns it.
    ///
    /// # Errors
    ///
    /// Returns the loader's final error for the key, or
    /// [`CacheError::Closed`] after [`Cache::close`].
    pub async fn get(&self, key: &str) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Read {
                key: key.to_owned(),
                receiver: Some(tx),
            })
            .await
            .map_err(|_| CacheError::Closed)?;
        rx.await.map_err(|_| CacheError::Closed)?
    }

    /// Warms the cache for `key` without blocking. A no-op when the key is
    /// already stored or a load is in flight.
    pub async fn prepare(&self, key: &str) {
        let _ = self
            .requests
            .send(Request::Read {
                key: key.to_owned(),
                receiver: None,
            })
            .await;
    }

    /// Reports whether an outcome for `key` is stored. Never triggers a
    /// load; returns `false` after [`Cache::close`].
    pub async fn peek(&self, key: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::Peek {
                key: key.to_owned(),
                receiver: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stops accepting new requests, waits for in-flight loads to deliver,
    /// and releases all waiters. Subsequent [`Cache::get`] and
    /// [`Cache::prepare`] calls fail with [`CacheError::Closed`].
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .requests
            .send(Request::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

async fn run_loader_worker<T>(
    worker: usize,
    loader: Loader<T>,
    retries: usize,
    jobs: Arc<Mutex<mpsc::Receiver<String>>>,
    writes: mpsc::Sender<(String, Outcome<T>)>,
) where
    T: Send + 'static,
{
    trace!(worker, "loader worker started");
    loop {
        let key = { jobs.lock().await.recv().await };
        let Some(key) = key else { break };

        trace!(worker, key = %key, "loader worker picked up job");
        let mut outcome = (loader)(key.clone()).await;
        let mut attempt = 0;
        while let Err(ref error) = outcome {
            if attempt >= retries {
                debug!(worker, key = %key, error = %error, "loader exhausted retries");
                break;
            }
            attempt += 1;
            debug!(worker, key = %key, attempt, error = %error, "loader retrying");
            outcome = (loader)(key.clone()).await;
        }

        if writes.send((key, outcome)).await.is_err() {
            break;
        }
    }
    trace!(worker, "loader worker finished");
}

async fn run_server<T>(
    cache_on_error: bool,
    mut request_rx: mpsc::Receiver<Request<T>>,
    mut write_rx: mpsc::Receiver<(String, Outcome<T>)>,
    write_tx: mpsc::Sender<(String, Outcome<T>)>,
    job_tx: mpsc::Sender<String>,
) where
    T: Clone + Send + 'static,
{
    let mut store: HashMap<String, Outcome<T>> = HashMap::new();
    let mut waiters: HashMap<String, Vec<oneshot::Sender<Outcome<T>>>> = HashMap::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut done: Option<oneshot::Sender<()>> = None;

    trace!("cache server started");
    loop {
        tokio::select! {
            biased;
            // The server keeps a write sender alive, so recv never yields
            // None before the shutdown path drops it.
            write = write_rx.recv() => {
                if let Some((key, outcome)) = write {
                    apply_write(cache_on_error, &mut store, &mut waiters, key, outcome);
                }
            }
            permit = job_tx.reserve(), if !pending.is_empty() => {
                if let (Ok(permit), Some(key)) = (permit, pending.pop_front()) {
                    trace!(key = %key, "dispatching loader job");
                    permit.send(key);
                }
            }
            request = request_rx.recv() => {
                match request {
                    Some(Request::Read { key, receiver }) => {
                        handle_read(&mut store, &mut waiters, &mut pending, key, receiver);
                    }
                    Some(Request::Peek { key, receiver }) => {
                        let _ = receiver.send(store.contains_key(&key));
                    }
                    Some(Request::Shutdown { done: ack }) => {
                        debug!("cache server shutting down");
                        done = Some(ack);
                        request_rx.close();
                    }
                    None => break,
                }
            }
        }
    }

    trace!("cache server finalizing");

    // Jobs never handed to a worker will not produce a write; release
    // their waiters before draining the in-flight ones.
    for key in pending.drain(..) {
        if let Some(list) = waiters.remove(&key) {
            for waiter in list {
                let _ = waiter.send(Err(CacheError::Closed));
            }
        }
    }

    drop(job_tx);
    drop(write_tx);
    while let Some((key, outcome)) = write_rx.recv().await {
        apply_write(cache_on_error, &mut store, &mut waiters, key, outcome);
    }

    for (_, list) in waiters.drain() {
        for waiter in list {
            let _ = waiter.send(Err(CacheError::Closed));
        }
    }

    if let Some(ack) = done {
        let _ = ack.send(());
    }
    trace!("cache server finished");
}

fn handle_read<T: Clone>(
    store: &mut HashMap<String, Outcome<T>>,
    waiters: &mut HashMap<String, Vec<oneshot::Sender<Outcome<T>>>>,
    pending: &mut VecDeque<String>,
    key: String,
    receiver: Option<oneshot::Sender<Outcome<T>>>,
) {
    if let Some(outcome) = store.get(&key) {
        trace!(key = %key, "read served from store");
        if let Some(receiver) = receiver {
            let _ = receiver.send(outcome.clone());
        }
        return;
    }

    match waiters.entry(key.clone()) {
        Entry::Occupied(mut entry) => {
            trace!(key = %key, waiters = entry.get().len(), "read attached to in-flight load");
            if let Some(receiver) = receiver {
                entry.get_mut().push(receiver);
            }
        }
        Entry::Vacant(entry) => {
            trace!(key = %key, "read enqueued a loader job");
            let mut list = Vec::new();
            if let Some(receiver) = receiver {
                list.push(receiver);
            }
            entry.insert(list);
            pending.push_back(key);
        }
    }
}

fn apply_write<T: Clone>(
    cache_on_error: bool,
    store: &mut HashMap<String, Outcome<T>>,
    waiters: &mut HashMap<String, Vec<oneshot::Sender<Outcome<T>>>>,
    key: String,
    outcome: Outcome<T>,
) {
    // A stored key is never overwritten for the rest of the session.
    if outcome.is_ok() || cache_on_error {
        store
            .entry(key.clone())
            .or_insert_with(|| outcome.clone());
    }
    if let Some(list) = waiters.remove(&key) {
        trace!(key = %key, waiters = list.len(), "broadcasting outcome to waiters");
        for waiter in list {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests;
