//! Decode worker pool - bounds how many sessions are created/initialized at once.
//!
//! Work-stealing deques as in a classic crossbeam pool:
//! - Preload jobs are pushed to the global injector
//! - Idle workers pull from the injector, then steal from siblings
//!
//! The pool size is the concurrency limit for decode-session setup; queued
//! jobs wait (their records stay `Requested`) until a worker frees up.

use crossbeam::deque::{Injector, Stealer, Worker};
use log::trace;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool running preload jobs.
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    /// Jobs submitted but not yet finished
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawn `num_threads` decode workers (at least one).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(worker_id, local)| {
                let injector = Arc::clone(&injector);
                let shutdown = Arc::clone(&shutdown);
                let pending = Arc::clone(&pending);
                let stealers = stealers.clone();

                thread::Builder::new()
                    .name(format!("feedreel-decode-{}", worker_id))
                    .spawn(move || {
                        trace!("Decode worker {} started", worker_id);
                        loop {
                            let job = local.pop().or_else(|| {
                                // Refill own deque from the injector, else steal from a sibling
                                injector
                                    .steal_batch_and_pop(&local)
                                    .success()
                                    .or_else(|| stealers.iter().find_map(|s| s.steal().success()))
                            });

                            if let Some(job) = job {
                                job();
                                pending.fetch_sub(1, Ordering::AcqRel);
                                continue;
                            }

                            if shutdown.load(Ordering::Relaxed) {
                                break;
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                        trace!("Decode worker {} stopped", worker_id);
                    })
                    .expect("Failed to spawn decode worker thread")
            })
            .collect();

        trace!("Decode workers initialized: {} threads", num_threads);

        Self {
            injector,
            handles,
            pending,
            shutdown,
        }
    }

    /// Queue a job. Runs on some worker thread, fire-and-forget.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.injector.push(Box::new(f));
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Decode workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Workers drain the queue before exiting; bound the wait so a hung
        // decode primitive cannot block teardown forever.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Decode worker shutdown timeout, detaching remaining threads");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} decode workers stopped", num_threads);
    }
}
