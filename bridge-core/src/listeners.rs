use futures_util::FutureExt;
use log::{error, warn};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// A subscription list for one category of notification.
///
/// Dispatch runs over a snapshot of the list, so listeners may register
/// further listeners while being notified. Each listener is isolated: an
/// error or a panic is logged and delivery moves on to the next one.
pub struct Listeners<L: ?Sized> {
    entries: Arc<RwLock<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> Clone for Listeners<L> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) {
        self.entries
            .write()
            .expect("RwLock should not be poisoned")
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("RwLock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    /// Calls `notify` for every listener in registration order.
    pub async fn dispatch<F, Fut>(&self, label: &str, mut notify: F)
    where
        F: FnMut(Arc<L>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        for listener in self.snapshot() {
            match AssertUnwindSafe(notify(listener)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "Bridge/Listeners", "{label} listener failed: {e:?}");
                }
                Err(_) => {
                    error!(target: "Bridge/Listeners", "{label} listener panicked");
                }
            }
        }
    }
}
