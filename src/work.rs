//! Fixed-size worker pool for blocking work.
//!
//! `N` native threads pull jobs off one shared queue guarded by a
//! `Mutex`/`Condvar` pair — the textbook thread-pool shape, and the one the
//! teacher's `WorkOncePool` builds on top of (there it's the Windows Thread
//! Pool API doing the scheduling; here this crate owns the threads itself,
//! see `SPEC_FULL.md` §9.2). Completions flow back to the loop thread
//! through a lock-free MPSC queue plus an [`crate::wakeup::Wakeup`] signal
//! rather than being invoked directly from the worker thread, so a job's
//! `after_work` callback always runs on the loop thread the way every other
//! callback in this crate does.
//!
//! Cancellation follows the teacher's `OwnedWorkHandle` contract: a queued
//! job that hasn't started yet can be cancelled for free (the worker thread
//! checks a flag right before running it and skips straight to the
//! completion queue with [`Code::Ecancelled`]); one already running must run
//! to completion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::queue::SegQueue;

use crate::error::{Code, Error, Result};
use crate::request::RequestId;
use crate::wakeup::WakeupSender;

type WorkFn = Box<dyn FnOnce() -> Result<Box<dyn std::any::Any + Send>> + Send + 'static>;
type AfterFn = Box<dyn FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send + 'static>;

struct Job {
    id: RequestId,
    cancelled: Arc<AtomicBool>,
    work: WorkFn,
    after: AfterFn,
}

struct Completion {
    id: RequestId,
    result: Result<Box<dyn std::any::Any + Send>>,
    after: AfterFn,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    completions: SegQueue<Completion>,
    wakeup: WakeupSender,
    inflight: AtomicUsize,
}

/// Handle to a cancellable queued job.
#[derive(Clone)]
pub struct WorkToken {
    id: RequestId,
    cancelled: Arc<AtomicBool>,
}

impl WorkToken {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns `true` if the job was still queued and is now cancelled.
    /// Returns `false` if it had already started (or finished) running.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize, wakeup: WakeupSender) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            completions: SegQueue::new(),
            wakeup,
            inflight: AtomicUsize::new(0),
        });
        let threads = (0..num_threads.max(1))
            .map(|idx| spawn_worker(idx, shared.clone()))
            .collect();
        WorkerPool { shared, threads }
    }

    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::SeqCst)
    }

    /// Submit one job. `work` runs on a worker thread and must not touch the
    /// loop; `after` runs on the loop thread once the completion is drained.
    pub fn submit(
        &self,
        id: RequestId,
        work: impl FnOnce() -> Result<Box<dyn std::any::Any + Send>> + Send + 'static,
        after: impl FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send + 'static,
    ) -> WorkToken {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = WorkToken {
            id,
            cancelled: cancelled.clone(),
        };
        self.shared.inflight.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            id,
            cancelled,
            work: Box::new(work),
            after: Box::new(after),
        };
        self.shared.queue.lock().unwrap().push_back(job);
        self.shared.condvar.notify_one();
        token
    }

    /// Drain completed jobs and run their `after` callbacks. Called from the
    /// loop thread after the wakeup signal fires.
    pub fn run_completions(&self) {
        while let Some(completion) = self.shared.completions.pop() {
            tracing::debug!(id = ?completion.id.0, "work item completed");
            (completion.after)(completion.result);
            self.shared.inflight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn spawn_worker(idx: usize, shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("reactor-worker-{idx}"))
        .spawn(move || worker_loop(shared))
        .expect("failed to spawn worker thread")
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        };
        let Some(job) = job else {
            return;
        };

        let result = if job.cancelled.swap(true, Ordering::SeqCst) {
            Err(Error::new(Code::Ecancelled))
        } else {
            (job.work)()
        };

        shared.completions.push(Completion {
            id: job.id,
            result,
            after: job.after,
        });
        shared.wakeup.send();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_wakeup() -> (WakeupSender, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        (WakeupSender::channel(tx), rx)
    }

    #[test]
    fn job_runs_and_signals_completion() {
        let (wakeup, rx) = test_wakeup();
        let pool = WorkerPool::new(2, wakeup);
        let (done_tx, done_rx) = mpsc::channel();
        pool.submit(
            RequestId(1),
            || Ok(Box::new(42i32) as Box<dyn std::any::Any + Send>),
            move |res| {
                let value = *res.unwrap().downcast::<i32>().unwrap();
                done_tx.send(value).unwrap();
            },
        );
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        pool.run_completions();
        assert_eq!(done_rx.recv().unwrap(), 42);
    }

    #[test]
    fn cancelling_before_start_skips_work() {
        let (wakeup, rx) = test_wakeup();
        let pool = WorkerPool::new(1, wakeup);
        // Block the single worker so our real job stays queued.
        let (block_tx, block_rx) = mpsc::channel::<()>();
        pool.submit(
            RequestId(1),
            move || {
                block_rx.recv().ok();
                Ok(Box::new(()) as Box<dyn std::any::Any + Send>)
            },
            |_| {},
        );

        let (done_tx, done_rx) = mpsc::channel();
        let token = pool.submit(
            RequestId(2),
            || Ok(Box::new(()) as Box<dyn std::any::Any + Send>),
            move |res| done_tx.send(res.is_err()).unwrap(),
        );
        assert!(token.cancel());

        block_tx.send(()).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        pool.run_completions();
        assert!(done_rx.recv().unwrap());
    }
}
