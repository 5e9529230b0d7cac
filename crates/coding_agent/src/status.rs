//! Free-text progress status updated by the `set_status` tool.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

type StatusObserver = dyn Fn(&str) + Send + Sync;

/// Shared slot holding the latest status line.
///
/// Cloning shares the slot. The presentation layer reads it with
/// [`StatusSink::current`] or subscribes with [`StatusSink::with_observer`].
#[derive(Clone, Default)]
pub struct StatusSink {
    current: Arc<Mutex<Option<String>>>,
    observer: Option<Arc<StatusObserver>>,
}

impl fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSink")
            .field("current", &self.current())
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl StatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `observer` with every status set after this point.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn set(&self, status: impl Into<String>) {
        let status = status.into();
        if let Some(observer) = &self.observer {
            observer(&status);
        }
        *lock_unpoisoned(&self.current) = Some(status);
    }

    pub fn clear(&self) {
        *lock_unpoisoned(&self.current) = None;
    }

    /// Latest status, if one is set.
    pub fn current(&self) -> Option<String> {
        lock_unpoisoned(&self.current).clone()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
