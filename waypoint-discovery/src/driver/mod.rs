//! Backend drivers
//!
//! A driver owns one discovery table, the background tasks that keep it in
//! sync with a backend, and the records this process published.

pub mod kv;
pub mod registry;

pub use kv::KvDriver;
pub use registry::RegistryDriver;

use crate::config::RdConfig;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Timing knobs shared by every task of a driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Pause after a backend error
    pub retry_backoff: Duration,
    /// Longest a blocking query may be held by the backend
    pub query_wait: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(1),
            query_wait: Duration::from_secs(5),
        }
    }
}

impl DriverOptions {
    pub fn from_config(config: &RdConfig) -> Self {
        Self {
            retry_backoff: config.retry_backoff(),
            query_wait: config.timeout,
        }
    }
}

/// Stop signal observed by a background task.
#[derive(Clone)]
pub(crate) struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once the owning task set is stopped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `period`. Returns false if cancelled first.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// A group of background tasks stopped together.
pub(crate) struct TaskSet {
    cancel: Mutex<watch::Sender<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            cancel: Mutex::new(watch::channel(false).0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Signal for a task about to be spawned into this set.
    pub fn signal(&self) -> Shutdown {
        Shutdown {
            rx: self.cancel.lock().subscribe(),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(task));
    }

    /// Tasks not yet finished
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Signal every task without waiting for it.
    pub fn cancel(&self) {
        self.cancel.lock().send_replace(true);
    }

    /// Signal every task, wait for all of them, then accept new tasks again.
    pub async fn stop(&self) {
        self.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());

        for handle in handles {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                warn!("Background task panicked: {}", e);
            }
        }

        *self.cancel.lock() = watch::channel(false).0;
    }
}
