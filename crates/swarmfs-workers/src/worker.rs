//! Dedicated-thread periodic workers.
//!
//! Each worker owns one OS thread that runs a cycle on every [`Ticker`] tick
//! until its [`StopSignal`] is raised. Shutdown latency is bounded by the
//! cycle in progress, never by the interval.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use swarmfs_core::{StopSignal, Ticker};
use tracing::{info, warn};

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to stop. Does not wait.
    pub fn shutdown(&self) {
        self.stop.stop();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal the worker and wait for its thread to exit.
    pub fn join(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(worker = %self.name, "worker thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn `cycle` on a named thread, once per `interval`, until `stop` is raised.
pub fn spawn_periodic<F>(
    name: &str,
    interval: Duration,
    stop: StopSignal,
    mut cycle: F,
) -> io::Result<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let worker_stop = stop.clone();
    let worker_name = name.to_string();
    let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
        info!(
            worker = %worker_name,
            interval_secs = interval.as_secs_f64(),
            "worker started"
        );
        let mut ticker = Ticker::new(interval, worker_stop);
        while ticker.tick() {
            cycle();
        }
        info!(worker = %worker_name, "worker shutting down");
    })?;
    Ok(WorkerHandle {
        name: name.to_string(),
        stop,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_runs_cycles_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = spawn_periodic(
            "test-worker",
            Duration::from_millis(5),
            StopSignal::new(),
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.join();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_shutdown_is_prompt_with_long_interval() {
        let handle = spawn_periodic(
            "slow-worker",
            Duration::from_secs(3600),
            StopSignal::new(),
            || {},
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        handle.shutdown();
        handle.join();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
