use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;

use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::util::runtime;

/// Serializes every operation on `S`.
///
/// Operations run one at a time in the order they were enqueued. Once an
/// operation fails with a fatal error the queue is permanently failed: the
/// error is recorded and every later operation is rejected with it.
pub struct AsyncQueue<S> {
    state: Arc<AsyncMutex<S>>,
    failure: Arc<StdMutex<Option<FirestoreError>>>,
    shutting_down: Arc<AtomicBool>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failure: Arc::clone(&self.failure),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl<S: Send + 'static> Debug for AsyncQueue<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("failure", &self.failure())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(state)),
            failure: Arc::new(StdMutex::new(None)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The fatal error that stopped the queue, if any.
    pub fn failure(&self) -> Option<FirestoreError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs `operation` once every previously enqueued operation finished.
    pub async fn enqueue<T, F>(&self, operation: F) -> FirestoreResult<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FirestoreResult<T>>,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.run(operation).await
    }

    /// Like [`enqueue`](Self::enqueue), but for work that must run even
    /// while the queue is shutting down.
    pub async fn enqueue_even_while_restricted<T, F>(&self, operation: F) -> FirestoreResult<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FirestoreResult<T>>,
    {
        self.run(operation).await
    }

    /// Runs `operation` as the last regular operation. Later calls to
    /// [`enqueue`](Self::enqueue) are rejected.
    pub async fn enqueue_and_initiate_shutdown<T, F>(&self, operation: F) -> FirestoreResult<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FirestoreResult<T>>,
    {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.run(operation).await
    }

    /// Enqueues `operation` without waiting for it. Failures are only
    /// logged, apart from fatal ones which still fail the queue.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FirestoreResult<()>> + Send + 'static,
    {
        let queue = self.clone();
        runtime::spawn(async move {
            if let Err(err) = queue.enqueue(operation).await {
                log::debug!("Background operation failed: {err}");
            }
        });
    }

    async fn run<T, F>(&self, operation: F) -> FirestoreResult<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FirestoreResult<T>>,
    {
        let mut state = self.state.lock().await;
        // A fatal error may have been recorded while this operation waited
        // for its turn.
        if let Some(failure) = self.failure() {
            return Err(failure);
        }

        let result = operation(&mut *state).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                self.fail(err.clone());
            }
        }
        result
    }

    fn fail(&self, err: FirestoreError) {
        log::error!("INTERNAL UNHANDLED ERROR: {err}");
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}
