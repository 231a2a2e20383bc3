//! Fixed-rate periodic tasks on dedicated OS threads.
//!
//! Every task gets its own named thread and is controlled through the
//! [`TaskHandle`] returned by [`spawn_periodic`]. Dropping the handle cancels
//! the task and joins its thread, so a task never outlives its owner.

use anyhow::{Context as _, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Cancellation {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Cancellation {
    fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Blocks until `deadline` passes or the task is cancelled.
    /// Returns `true` when cancelled.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Handle to a running periodic task.
pub struct TaskHandle {
    name: String,
    cancellation: Arc<Cancellation>,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ticks that have completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Requests the task to stop. The tick in progress, if any, finishes first.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancels the task and waits for its thread to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancellation.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("periodic task {} terminated abnormally", self.name);
            } else {
                log::info!("periodic task {} stopped", self.name);
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("ticks", &self.ticks())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Runs `tick` immediately and then once every `period` on a new thread named
/// `name`, until the returned handle is cancelled or dropped.
///
/// Scheduling is fixed-rate: a tick that overruns its period causes the missed
/// ticks to be skipped rather than run back to back. A panic inside `tick` is
/// caught and logged; the task keeps running.
pub fn spawn_periodic<F>(name: impl Into<String>, period: Duration, tick: F) -> Result<TaskHandle>
where
    F: FnMut() + Send + 'static,
{
    let name = name.into();
    anyhow::ensure!(
        !period.is_zero(),
        "period of task {name} must be greater than zero"
    );

    let cancellation = Arc::new(Cancellation::new());
    let ticks = Arc::new(AtomicU64::new(0));
    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn({
            let name = name.clone();
            let cancellation = cancellation.clone();
            let ticks = ticks.clone();
            move || run(&name, period, tick, &cancellation, &ticks)
        })
        .with_context(|| format!("failed to spawn periodic task {name}"))?;

    log::info!("periodic task {name} started with period {period:?}");
    Ok(TaskHandle {
        name,
        cancellation,
        ticks,
        thread: Some(thread),
    })
}

fn run<F>(name: &str, period: Duration, mut tick: F, cancellation: &Cancellation, ticks: &AtomicU64)
where
    F: FnMut(),
{
    let mut deadline = Instant::now();
    loop {
        if cancellation.wait_until(deadline) {
            return;
        }

        if panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
            log::error!("periodic task {name} panicked during a tick");
        }
        ticks.fetch_add(1, Ordering::AcqRel);

        deadline += period;
        let now = Instant::now();
        if deadline < now {
            let behind = now - deadline;
            let skipped = behind.as_nanos() / period.as_nanos() + 1;
            log::debug!("periodic task {name} overran, skipping {skipped} tick(s)");
            deadline += period * skipped as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let give_up = Instant::now() + Duration::from_secs(5);
        while Instant::now() < give_up {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_runs_repeatedly_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic("test-repeat", Duration::from_millis(2), {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 3));
        handle.join();

        let stopped_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn test_first_tick_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic("test-immediate", Duration::from_secs(3600), {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        assert!(wait_for(|| handle.ticks() == 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Cancellation must interrupt the long sleep rather than wait it out.
        let started = Instant::now();
        drop(handle);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_panicking_tick_does_not_stop_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic("test-panic", Duration::from_millis(2), {
            let count = count.clone();
            move || {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            }
        })
        .unwrap();

        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 3));
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let error = spawn_periodic("test-zero", Duration::ZERO, || {}).unwrap_err();
        assert!(error.to_string().contains("test-zero"));
    }
}
