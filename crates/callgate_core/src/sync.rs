//! Small single-assignment primitives shared by calls, batches and the matcher.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A value that is set at most once and can be awaited by any number of
/// waiters. The first `set` wins; later ones are ignored.
pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> Latch<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set the value. Returns false if the latch was already set.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The value, if already set.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the latch is set.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T> Default for Latch<T>
where
    T: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Latch").field(&*self.tx.borrow()).finish()
    }
}

/// An out-parameter filled in by the runtime and read by the application
/// once the associated tag has been notified.
pub struct OutParam<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> OutParam<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    /// Take the value out, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> OutParam<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Clone for OutParam<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for OutParam<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for OutParam<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutParam")
            .field("set", &self.is_set())
            .finish()
    }
}
