//! # Asynchronous-Completion Machinery
//!
//! Implements the `EWOULDBLOCK` / `notify_io_complete` contract (spec
//! §4.5/§5/§9): when the façade refuses to wait on a contended class lock,
//! it hands the retry to this background worker instead of blocking the
//! caller's thread, and the worker calls the front-end's notification
//! callback exactly once when the retry finally completes. Modeled the way
//! spec §9 suggests — "a task enqueued on a completion channel" — using a
//! dedicated thread and an `mpsc` channel, in the same spirit as the
//! teacher's `start_expirer` background-thread-with-stop-handle idiom.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use hkv_common::Status;

use crate::facade::Cookie;

/// Front-end callback invoked exactly once per deferred operation, on the
/// completion thread rather than the caller's thread.
pub type NotifyIoComplete = Arc<dyn Fn(Cookie, Status) + Send + Sync>;

/// One deferred retry. `retry` re-executes the *same* operation (not a
/// replay of cached client state), so re-driving a cookie is naturally
/// idempotent: the closure captures everything the retry needs and returns
/// the status to report.
pub struct PendingJob {
    pub cookie: Cookie,
    pub retry: Box<dyn FnOnce() -> Status + Send>,
}

/// Background worker draining deferred operations and notifying the
/// front-end of their outcome.
pub struct CompletionWorker {
    sender: Option<mpsc::Sender<PendingJob>>,
    join: Option<JoinHandle<()>>,
}

impl CompletionWorker {
    /// Spawns the worker thread. `notify` is called with the final status
    /// of every submitted job, exactly once.
    pub fn start(notify: NotifyIoComplete) -> Self {
        let (sender, receiver) = mpsc::channel::<PendingJob>();

        let join = std::thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                let status = (job.retry)();
                notify(job.cookie, status);
            }
        });

        CompletionWorker {
            sender: Some(sender),
            join: Some(join),
        }
    }

    /// Queues a deferred retry. Silently dropped if the worker has already
    /// been stopped (matches a cancelled cookie: no notification is owed).
    pub fn submit(&self, job: PendingJob) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }

    /// Closes the queue and waits for any in-flight job to finish, then
    /// joins the thread. Dropping the sender first unblocks the worker's
    /// `recv()` so the join below cannot deadlock.
    pub fn stop(mut self) {
        self.sender.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn worker_notifies_after_retry() {
        let observed = Arc::new(AtomicU64::new(0));
        let observed_clone = Arc::clone(&observed);
        let notify: NotifyIoComplete = Arc::new(move |_cookie, status| {
            if status == Status::Success {
                observed_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        let worker = CompletionWorker::start(notify);
        worker.submit(PendingJob {
            cookie: Cookie(1),
            retry: Box::new(|| Status::Success),
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(observed.load(Ordering::Relaxed), 1);
        worker.stop();
    }

    #[test]
    fn stop_joins_without_deadlock() {
        let notify: NotifyIoComplete = Arc::new(|_, _| {});
        let worker = CompletionWorker::start(notify);
        worker.stop();
    }
}
