//! Single-slot trailing-edge debounce
//!
//! At most one flush is pending at a time. Scheduling aborts the previous
//! one. Flushes make synchronous channel calls (SQLite may wait on a busy
//! lock), so they run on the blocking pool; an abort either lands during the
//! wait, before anything was written, or leaves the flush to finish.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct PendingFlush {
    runtime: Handle,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl PendingFlush {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            slot: Mutex::new(None),
        }
    }

    /// Run `flush` once `delay` passes without another call to `schedule`
    pub fn schedule<F>(&self, delay: Duration, flush: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = tokio::task::spawn_blocking(flush).await {
                warn!(error = %err, "flush task failed");
            }
        }));
    }

    /// Drop the pending flush, if any; returns whether one was still waiting
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for PendingFlush {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().take() {
            handle.abort();
        }
    }
}
