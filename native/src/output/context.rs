// Execution contexts used to deliver completion callbacks on the right thread.

use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks run.
pub trait ExecutionContext: Send + Sync {
    /// Queue `job` and return immediately.
    fn post(&self, job: Job);
    /// Run `job` on the context and wait until it finished.
    fn send(&self, job: Job);
}

/// Runs jobs on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl ExecutionContext for Immediate {
    fn post(&self, job: Job) {
        job();
    }

    fn send(&self, job: Job) {
        job();
    }
}

/// Which [`ExecutionContext`] method the session uses to raise completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionDispatch {
    /// Block the pipe thread until the callback ran.
    #[default]
    Send,
    /// Fire and forget.
    Post,
}

struct QueuedJob {
    job: Job,
    done: Option<mpsc::Sender<()>>,
}

/// A queue bound to the thread that created it, pumped by that thread.
///
/// `send` from another thread blocks until the owner runs the job; `send`
/// from the owner thread runs inline. After [`close`](Self::close), new jobs are dropped.
pub struct DispatchQueue {
    owner: ThreadId,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    receiver: Mutex<mpsc::Receiver<QueuedJob>>,
    closed: AtomicBool,
}

impl DispatchQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            owner: thread::current().id(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn enqueue(&self, job: Job, done: Option<mpsc::Sender<()>>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(QueuedJob { job, done }).is_ok(),
            None => false,
        }
    }

    fn run(queued: QueuedJob) {
        (queued.job)();
        if let Some(done) = queued.done {
            let _ = done.send(());
        }
    }

    /// Run every queued job. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let next = {
                let rx = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
                rx.try_recv().ok()
            };
            match next {
                Some(queued) => {
                    Self::run(queued);
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Wait up to `timeout` for a job, then run everything queued.
    pub fn run_for(&self, timeout: Duration) -> usize {
        let first = {
            let rx = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv_timeout(timeout).ok()
        };
        match first {
            Some(queued) => {
                Self::run(queued);
                1 + self.run_pending()
            }
            None => 0,
        }
    }

    /// Stop accepting jobs and drop the ones still queued, releasing blocked senders.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let rx = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        while rx.try_recv().is_ok() {}
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for DispatchQueue {
    fn post(&self, job: Job) {
        if !self.enqueue(job, None) {
            warn!("[DISPATCH] Queue closed, completion dropped");
        }
    }

    fn send(&self, job: Job) {
        if self.is_owner_thread() {
            job();
            return;
        }

        let (done_tx, done_rx) = mpsc::channel();
        if !self.enqueue(job, Some(done_tx)) {
            warn!("[DISPATCH] Queue closed, completion dropped");
            return;
        }
        // Err means the job was dropped by close().
        let _ = done_rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn immediate_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        Immediate.post(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_waits_for_the_owner_to_pump() {
        let queue = DispatchQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        queue.post(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_from_other_thread_blocks_until_run() {
        let queue = Arc::new(DispatchQueue::new());
        let ran_on = Arc::new(Mutex::new(None));

        let sender = {
            let queue = Arc::clone(&queue);
            let ran_on = Arc::clone(&ran_on);
            thread::spawn(move || {
                let job_ran_on = Arc::clone(&ran_on);
                queue.send(Box::new(move || {
                    *job_ran_on.lock().unwrap() = Some(thread::current().id());
                }));
                // send returned, so the job already ran.
                assert!(ran_on.lock().unwrap().is_some());
            })
        };

        let mut ran = 0;
        while ran == 0 {
            ran = queue.run_for(Duration::from_millis(50));
        }
        sender.join().unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    }

    #[test]
    fn send_on_owner_thread_runs_inline() {
        let queue = DispatchQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        queue.send(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_releases_blocked_senders() {
        let queue = Arc::new(DispatchQueue::new());
        let sender = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.send(Box::new(|| {})))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        sender.join().unwrap();
        assert_eq!(queue.run_pending(), 0);
    }
}
