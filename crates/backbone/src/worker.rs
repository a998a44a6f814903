//! Offloads blocking work from the reactor thread.
//!
//! Tasks run on tokio's blocking pool; results come back over an unbounded
//! channel and are only applied when the reactor drains them at a tick
//! boundary, so nothing a task returns ever touches reactor state from a
//! worker thread.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::config::NetworkConfig;
use crate::error::{NetError, Result};

/// Cooperative cancellation for a submitted task. Cancelling is idempotent;
/// a task already running finishes, but its result is discarded.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Passed to the task body so long jobs can stop early.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Completion<T> {
    id: u64,
    cancelled: Arc<AtomicBool>,
    output: Option<T>,
}

#[derive(Debug)]
pub struct Completed<T> {
    pub id: u64,
    pub output: T,
}

pub struct WorkerPool<T: Send + 'static> {
    runtime: Option<Runtime>,
    tx: UnboundedSender<Completion<T>>,
    rx: UnboundedReceiver<Completion<T>>,
    in_flight: usize,
    max_in_flight: usize,
    next_id: u64,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(threads: usize, max_in_flight: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("backbone-worker")
            .build()?;
        let (tx, rx) = unbounded_channel();
        Ok(Self {
            runtime: Some(runtime),
            tx,
            rx,
            in_flight: 0,
            max_in_flight,
            next_id: 1,
        })
    }

    /// Sized by `worker_threads` and `worker_max_in_flight`.
    pub fn from_config(config: &NetworkConfig) -> io::Result<Self> {
        Self::new(config.worker_threads, config.worker_max_in_flight)
    }

    pub fn submit<F>(&mut self, task: F) -> Result<TaskHandle>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        if self.in_flight >= self.max_in_flight {
            return Err(NetError::WorkerBusy(self.in_flight));
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(NetError::Unsupported("worker pool is shut down"));
        };

        let id = self.next_id;
        self.next_id += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            id,
            cancelled: Arc::clone(&cancelled),
        };

        let tx = self.tx.clone();
        runtime.spawn_blocking(move || {
            let output = if cancelled.load(Ordering::SeqCst) {
                None
            } else {
                let token = CancelToken(Arc::clone(&cancelled));
                match catch_unwind(AssertUnwindSafe(|| task(token))) {
                    Ok(output) => Some(output),
                    Err(_) => {
                        log::error!("worker task {} panicked", id);
                        None
                    }
                }
            };
            // The receiver only goes away with the pool.
            let _ = tx.send(Completion {
                id,
                cancelled,
                output,
            });
        });

        self.in_flight += 1;
        Ok(handle)
    }

    /// Collects finished tasks. Call from the reactor thread only.
    pub fn drain(&mut self) -> Vec<Completed<T>> {
        let mut done = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if completion.cancelled.load(Ordering::SeqCst) {
                log::debug!("dropping result of cancelled task {}", completion.id);
                continue;
            }
            if let Some(output) = completion.output {
                done.push(Completed {
                    id: completion.id,
                    output,
                });
            }
        }
        done
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn shutdown(&mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn drain_until<T: Send + 'static>(pool: &mut WorkerPool<T>, count: usize) -> Vec<Completed<T>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < count && Instant::now() < deadline {
            done.extend(pool.drain());
            std::thread::sleep(Duration::from_millis(5));
        }
        done
    }

    #[test]
    fn test_results_come_back_on_drain() {
        let mut pool = WorkerPool::new(2, 8).unwrap();
        for i in 0..3u32 {
            pool.submit(move |_| i * 10).unwrap();
        }

        let mut outputs: Vec<u32> = drain_until(&mut pool, 3).into_iter().map(|c| c.output).collect();
        outputs.sort();
        assert_eq!(outputs, vec![0, 10, 20]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_cap() {
        let mut pool = WorkerPool::new(1, 1).unwrap();
        pool.submit(|_| std::thread::sleep(Duration::from_millis(50)))
            .unwrap();
        assert!(matches!(pool.submit(|_| ()), Err(NetError::WorkerBusy(1))));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.in_flight() > 0 && Instant::now() < deadline {
            pool.drain();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.submit(|_| ()).is_ok());
    }

    #[test]
    fn test_sized_from_config() {
        let config = NetworkConfig {
            worker_threads: 2,
            worker_max_in_flight: 1,
            ..NetworkConfig::default()
        };
        let mut pool = WorkerPool::from_config(&config).unwrap();
        assert_eq!(pool.max_in_flight(), 1);
        pool.submit(|_| std::thread::sleep(Duration::from_millis(50)))
            .unwrap();
        assert!(matches!(pool.submit(|_| ()), Err(NetError::WorkerBusy(1))));
    }

    #[test]
    fn test_cancelled_result_is_discarded() {
        let mut pool = WorkerPool::new(1, 4).unwrap();
        let handle = pool
            .submit(|_| {
                std::thread::sleep(Duration::from_millis(30));
                7u8
            })
            .unwrap();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        let marker = pool.submit(|_| 1u8).unwrap();
        let done = drain_until(&mut pool, 1);
        std::thread::sleep(Duration::from_millis(60));
        let mut all: Vec<Completed<u8>> = done;
        all.extend(pool.drain());
        assert!(all.iter().all(|c| c.id == marker.id()));
    }
}
