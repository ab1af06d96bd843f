//! Per-peer periodic maintenance job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::ConnectionError;
use crate::timer::{Timer, TimerHandle};

/// A periodic job owned by one logical peer, running on the shared timer.
#[derive(Debug)]
pub struct MaintenanceTask {
    name: String,
    handle: TimerHandle,
    stopped: AtomicBool,
}

impl MaintenanceTask {
    pub fn start<F, Fut>(
        timer: &Timer,
        name: impl Into<String>,
        interval: Duration,
        job: F,
    ) -> Result<Self, ConnectionError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = timer.schedule_at_fixed_rate(interval, job)?;
        Ok(Self {
            name: name.into(),
            handle,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    /// Stop the job. Returns false if it was already stopped.
    pub fn shutdown(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handle.cancel();
        debug!(task = %self.name, "Maintenance task stopped");
        true
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
