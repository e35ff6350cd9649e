//! Cooperative periodic scheduling.
//!
//! A [`Scheduler`] owns one timer loop that fires a [`PeriodicTask`] on a fixed
//! interval. Each tick runs on its own tokio task, so a slow tick never delays
//! the timer and a panicking tick never kills the loop. Stopping the scheduler
//! only prevents future ticks; a tick already in flight runs to completion,
//! and [`Scheduler::shutdown`] waits for it.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Work invoked once per scheduler tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// What one invocation reports back.
    type Output: Debug + Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one tick. Implementations handle their own errors.
    async fn run_once(&self) -> Self::Output;
}

/// Timing of a scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub interval: Duration,
    /// Fire the first tick at start instead of after one interval
    pub run_immediately: bool,
}

impl ScheduleOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            run_immediately: false,
        }
    }

    pub fn with_immediate(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

/// Handle to a started loop. Cloning shares the same loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Whether both handles point at the same loop.
    pub fn same_loop(&self, other: &SchedulerHandle) -> bool {
        self.shutdown.same_channel(&other.shutdown)
    }
}

/// Periodic driver for one task.
pub struct Scheduler<T: PeriodicTask> {
    task: Arc<T>,
    options: ScheduleOptions,
    running: AtomicBool,
    handle: parking_lot::Mutex<Option<SchedulerHandle>>,
    /// Loops started so far that may still be draining ticks
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: PeriodicTask> Scheduler<T> {
    pub fn new(task: Arc<T>, options: ScheduleOptions) -> Self {
        Self {
            task,
            options,
            running: AtomicBool::new(false),
            handle: parking_lot::Mutex::new(None),
            loops: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the loop. Calling this while running returns the existing handle.
    pub fn start(&self) -> SchedulerHandle {
        let mut slot = self.handle.lock();
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = SchedulerHandle {
            shutdown: shutdown_tx,
        };
        let run = tokio::spawn(run_loop(self.task.clone(), self.options, shutdown_rx));
        {
            let mut loops = self.loops.lock();
            loops.retain(|l| !l.is_finished());
            loops.push(run);
        }
        self.running.store(true, Ordering::SeqCst);
        *slot = Some(handle.clone());

        info!(
            task = self.task.name(),
            interval_ms = self.options.interval.as_millis() as u64,
            "Scheduler started"
        );
        handle
    }

    /// Stop scheduling new ticks.
    pub fn stop(&self) {
        let mut slot = self.handle.lock();
        if let Some(handle) = slot.take() {
            let _ = handle.shutdown.send(true);
            self.running.store(false, Ordering::SeqCst);
            info!(task = self.task.name(), "Scheduler stopped");
        }
    }

    /// Stop the loop and wait until every tick already in flight has finished.
    pub async fn shutdown(&self) {
        self.stop();
        let loops = std::mem::take(&mut *self.loops.lock());
        for run in loops {
            if let Err(e) = run.await {
                error!(task = self.task.name(), error = %e, "Scheduler loop ended abnormally");
            }
        }
        debug!(task = self.task.name(), "Scheduler drained");
    }
}

impl<T: PeriodicTask> Drop for Scheduler<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            let _ = handle.shutdown.send(true);
        }
    }
}

async fn run_loop<T: PeriodicTask>(
    task: Arc<T>,
    options: ScheduleOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = if options.run_immediately {
        tokio::time::Instant::now()
    } else {
        tokio::time::Instant::now() + options.interval
    };
    let mut ticker = tokio::time::interval_at(start, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let task = task.clone();
                ticks.spawn(async move { task.run_once().await });
            }
            Some(finished) = ticks.join_next(), if !ticks.is_empty() => {
                log_tick(task.name(), finished);
            }
        }
    }

    if !ticks.is_empty() {
        debug!(task = task.name(), in_flight = ticks.len(), "Waiting for in-flight ticks");
    }
    while let Some(finished) = ticks.join_next().await {
        log_tick(task.name(), finished);
    }
    debug!(task = task.name(), "Scheduler loop exited");
}

fn log_tick<O: Debug>(name: &'static str, finished: Result<O, JoinError>) {
    match finished {
        Ok(output) => debug!(task = name, output = ?output, "Scheduler tick finished"),
        Err(e) if e.is_panic() => error!(task = name, error = %e, "Scheduler tick panicked"),
        Err(e) => error!(task = name, error = %e, "Scheduler tick was cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for Counter {
        type Output = usize;

        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run_once(&self) -> usize {
            self.ticks.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    struct Panicky {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for Panicky {
        type Output = ();

        fn name(&self) -> &'static str {
            "panicky"
        }

        async fn run_once(&self) {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first tick fails");
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let task = Arc::new(Counter::default());
        let scheduler = Scheduler::new(task.clone(), ScheduleOptions::every(Duration::from_secs(5)));
        scheduler.start();
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 3);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_immediately() {
        let task = Arc::new(Counter::default());
        let scheduler = Scheduler::new(
            task.clone(),
            ScheduleOptions::every(Duration::from_secs(60)).with_immediate(),
        );
        scheduler.start();
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let task = Arc::new(Counter::default());
        let scheduler = Scheduler::new(task.clone(), ScheduleOptions::every(Duration::from_secs(5)));
        let first = scheduler.start();
        let second = scheduler.start();
        assert!(first.same_loop(&second));

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_future_ticks() {
        let task = Arc::new(Counter::default());
        let scheduler = Scheduler::new(task.clone(), ScheduleOptions::every(Duration::from_secs(5)));
        scheduler.start();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;
        scheduler.stop();
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let task = Arc::new(Counter::default());
        let scheduler = Scheduler::new(task.clone(), ScheduleOptions::every(Duration::from_secs(5)));
        let first = scheduler.start();
        scheduler.stop();
        let second = scheduler.start();
        assert!(!first.same_loop(&second));
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_kill_loop() {
        let task = Arc::new(Panicky {
            ticks: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(task.clone(), ScheduleOptions::every(Duration::from_secs(1)));
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        settle().await;
        assert!(task.ticks.load(Ordering::SeqCst) >= 3);
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    struct Slow {
        done: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for Slow {
        type Output = ();

        fn name(&self) -> &'static str {
            "slow"
        }

        async fn run_once(&self) {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_tick() {
        let task = Arc::new(Slow {
            done: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            task.clone(),
            ScheduleOptions::every(Duration::from_secs(60)).with_immediate(),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.done.load(Ordering::SeqCst), 0);

        scheduler.shutdown().await;
        assert_eq!(task.done.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_without_start_returns() {
        let scheduler = Scheduler::new(
            Arc::new(Counter::default()),
            ScheduleOptions::every(Duration::from_secs(1)),
        );
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }
}
