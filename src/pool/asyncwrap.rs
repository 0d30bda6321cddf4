//! Handles for calls running in the background
//!
//! Every `*_async` call gets its own spawned task that drives the call to
//! completion, stores the outcome and then fires at most one callback. The
//! handle only reads that stored outcome, so `get` can be called repeatedly
//! and keeps returning the same value or error.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::error;
use uuid::Uuid;

use crate::core::errors::{PoolError, Result};
use crate::pool::lifecycle::Lifecycle;

const TERMINATED_MESSAGE: &str = "Pool that returned this AsyncResult was terminated before the \
    computation completed. Call Pool::terminate after being done with this AsyncResult. \
    Beware of dropping the Pool while handles are still in use.";

type SuccessCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(PoolError) + Send + 'static>;

/// Optional completion callbacks; exactly one of them fires
pub struct Callbacks<T> {
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }

    /// Called with the call's value when it succeeds
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Called with the call's error when it fails
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(PoolError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot<T> {
    outcome: Mutex<Option<Result<T>>>,
    done: watch::Sender<bool>,
    settled: watch::Sender<bool>,
}

/// Handle to a call running in the background
pub struct AsyncResult<T> {
    id: Uuid,
    lifecycle: Arc<Lifecycle>,
    slot: Arc<Slot<T>>,
}

impl<T> AsyncResult<T>
where
    T: Clone + Send + 'static,
{
    /// Drive `call` on its own task
    pub(crate) fn spawn<F>(lifecycle: Arc<Lifecycle>, call: F, callbacks: Callbacks<T>) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (done, _) = watch::channel(false);
        let (settled, _) = watch::channel(false);
        let slot = Arc::new(Slot {
            outcome: Mutex::new(None),
            done,
            settled,
        });
        let id = Uuid::new_v4();

        let task_slot = slot.clone();
        tokio::spawn(async move {
            let outcome = call.await;
            let delivered = outcome.clone();
            *task_slot.outcome.lock() = Some(outcome);
            task_slot.done.send_replace(true);

            let fired = catch_unwind(AssertUnwindSafe(move || match delivered {
                Ok(value) => {
                    if let Some(callback) = callbacks.on_success {
                        callback(value);
                    }
                }
                Err(e) => {
                    if let Some(callback) = callbacks.on_error {
                        callback(e);
                    }
                }
            }));
            if fired.is_err() {
                error!(handle = %id, "async result callback panicked");
            }
            task_slot.settled.send_replace(true);
        });

        Self {
            id,
            lifecycle,
            slot,
        }
    }

    /// Wait for completion and return the value or the call's error.
    ///
    /// With a timeout, an expired wait returns a timeout error and the
    /// handle stays usable.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T> {
        self.wait(timeout).await?;
        self.check_terminated()?;
        self.slot
            .outcome
            .lock()
            .clone()
            .unwrap_or_else(|| Err(PoolError::internal("async result settled without an outcome")))
    }

    /// Block until the call finishes or `timeout` expires
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.check_terminated()?;
        let mut done = self.slot.done.subscribe();
        let finished = async move {
            // the sender lives in the slot we hold, so this only ends on completion
            let _ = done.wait_for(|done| *done).await;
        };
        match timeout {
            None => finished.await,
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| PoolError::timeout("AsyncResult::wait", limit))?,
        }
        Ok(())
    }

    /// Whether the call has finished
    pub fn ready(&self) -> Result<bool> {
        self.check_terminated()?;
        Ok(*self.slot.done.borrow())
    }

    /// Whether the call finished without error; fails if not finished yet
    pub fn successful(&self) -> Result<bool> {
        if !self.ready()? {
            return Err(PoolError::state(
                "async result",
                format!("result {} is not ready", self.id),
            ));
        }
        Ok(matches!(*self.slot.outcome.lock(), Some(Ok(_))))
    }
}

impl<T> AsyncResult<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receiver that flips to true once the outcome is stored and the
    /// callback has run
    pub(crate) fn settled(&self) -> watch::Receiver<bool> {
        self.slot.settled.subscribe()
    }

    fn check_terminated(&self) -> Result<()> {
        if self.lifecycle.is_terminated() {
            return Err(PoolError::usage(TERMINATED_MESSAGE));
        }
        Ok(())
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("ready", &*self.slot.done.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lifecycle() -> Arc<Lifecycle> {
        Arc::new(Lifecycle::new())
    }

    #[tokio::test]
    async fn get_returns_value_repeatedly() {
        let handle = AsyncResult::spawn(lifecycle(), async { Ok(7) }, Callbacks::new());
        assert_eq!(handle.get(None).await.unwrap(), 7);
        assert_eq!(handle.get(None).await.unwrap(), 7);
        assert!(handle.ready().unwrap());
        assert!(handle.successful().unwrap());
    }

    #[tokio::test]
    async fn timeout_leaves_handle_usable() {
        let handle = AsyncResult::spawn(
            lifecycle(),
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("late")
            },
            Callbacks::new(),
        );
        let err = handle.get(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!handle.ready().unwrap());
        assert!(matches!(handle.successful(), Err(PoolError::State { .. })));
        assert_eq!(handle.get(None).await.unwrap(), "late");
    }

    #[tokio::test]
    async fn exactly_one_callback_fires() {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let (s, f) = (successes.clone(), failures.clone());
        let handle = AsyncResult::spawn(
            lifecycle(),
            async { Err::<i32, _>(PoolError::type_error("bad")) },
            Callbacks::new()
                .on_success(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |e| {
                    assert!(matches!(e, PoolError::Type { .. }));
                    f.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let mut settled = handle.settled();
        settled.wait_for(|s| *s).await.unwrap();

        assert!(handle.get(None).await.is_err());
        assert!(!handle.successful().unwrap());
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminated_pool_poisons_handle() {
        let lifecycle = lifecycle();
        let handle = AsyncResult::spawn(lifecycle.clone(), async { Ok(1) }, Callbacks::new());
        handle.wait(None).await.unwrap();
        lifecycle.terminate();
        assert!(matches!(handle.ready(), Err(PoolError::Usage { .. })));
        assert!(matches!(handle.get(None).await, Err(PoolError::Usage { .. })));
    }
}
