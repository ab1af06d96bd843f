//! Shared periodic timer of a transport.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::ConnectionError;

/// Runs periodic tasks until cancelled or until the timer shuts down.
#[derive(Default)]
pub struct Timer {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Cancels one scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, first after one period. Refused once the
    /// timer is shut down. Must be called inside a tokio runtime.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        period: Duration,
        mut task: F,
    ) -> Result<TimerHandle, ConnectionError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::Shutdown);
        }
        tasks.retain(|handle| !handle.is_finished());

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                task().await;
            }
        });
        let abort = handle.abort_handle();
        tasks.push(handle);
        Ok(TimerHandle { abort })
    }

    /// Cancel every task. Idempotent.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(tasks = tasks.len(), "Stopping timer");
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(timer: &Timer, period: Duration) -> (Arc<AtomicUsize>, TimerHandle) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = timer
            .schedule_at_fixed_rate(period, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        (count, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_at_fixed_rate() {
        let timer = Timer::new();
        let (count, _handle) = counting(&timer, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_task() {
        let timer = Timer::new();
        let (count, handle) = counting(&timer, Duration::from_secs(1));
        let (other, _other_handle) = counting(&timer, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_and_refuses() {
        let timer = Timer::new();
        let (count, _handle) = counting(&timer, Duration::from_secs(1));

        timer.shutdown();
        timer.shutdown();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_shut_down());
        assert_eq!(timer.active_tasks(), 0);
        assert!(matches!(
            timer.schedule_at_fixed_rate(Duration::from_secs(1), || async {}),
            Err(ConnectionError::Shutdown)
        ));
    }
}
