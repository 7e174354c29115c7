//! The node-wide callback dispatcher.
//!
//! Subscribers and action clients never run user code on their own tasks;
//! they package the work as a job and submit it here. A single consumer
//! drains the queue, which is what guarantees that two callbacks belonging
//! to the same node never run concurrently.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{
    mpsc::{self, error::SendTimeoutError, error::TryRecvError},
    Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Budget for getting a job into the queue before it is dropped.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on jobs processed by one `spin_once` call.
const SPIN_ONCE_BATCH: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    #[error("timed out submitting job to the callback queue")]
    Timeout,
    #[error("callback queue is closed")]
    Closed,
}

/// Producer half, cloned into every subscription and action client.
#[derive(Clone)]
pub struct JobQueue {
    job_tx: mpsc::Sender<Job>,
    pending: Arc<AtomicUsize>,
}

impl JobQueue {
    /// Enqueue a job, waiting at most [`SUBMIT_TIMEOUT`] for queue space.
    pub async fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        match self.job_tx.send_timeout(job, SUBMIT_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(match e {
                    SendTimeoutError::Timeout(_) => SubmitError::Timeout,
                    SendTimeoutError::Closed(_) => SubmitError::Closed,
                })
            }
        }
    }
}

/// Consumer half, owned by the node. The receiver sits behind a mutex so
/// `spin` and `spin_once` are mutually exclusive however the host program
/// mixes them.
pub struct JobRunner {
    job_rx: Mutex<mpsc::Receiver<Job>>,
    pending: Arc<AtomicUsize>,
}

impl JobRunner {
    /// Run the job loop until the token fires.
    pub async fn run_until(&self, cancel: &CancellationToken) {
        let mut job_rx = self.job_rx.lock().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("Job dispatcher stopped by cancel token");
                    break;
                }

                job = job_rx.recv() => {
                    match job {
                        Some(job) => self.execute(job),
                        None => {
                            trace!("Job queue closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Process a bounded batch of queued jobs without blocking for new ones.
    ///
    /// Returns whether work remains after the batch.
    pub async fn run_once(&self) -> bool {
        let mut job_rx = self.job_rx.lock().await;

        for _ in 0..SPIN_ONCE_BATCH {
            match job_rx.try_recv() {
                Ok(job) => self.execute(job),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        self.pending.load(Ordering::Acquire) > 0
    }

    fn execute(&self, job: Job) {
        self.pending.fetch_sub(1, Ordering::AcqRel);

        // A fault inside user code must not take the node down with it.
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("A subscriber or action callback panicked; continuing");
        }
    }
}

pub fn job_channel(capacity: usize) -> (JobQueue, JobRunner) {
    let (job_tx, job_rx) = mpsc::channel(capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    (
        JobQueue {
            job_tx,
            pending: pending.clone(),
        },
        JobRunner {
            job_rx: Mutex::new(job_rx),
            pending,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (queue, runner) = job_channel(16);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for id in 0..5 {
            let seen = seen.clone();
            queue
                .submit(Box::new(move || {
                    seen.lock().unwrap().push(id);
                }))
                .await
                .unwrap();
        }

        assert!(!runner.run_once().await);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn run_once_reports_remaining_work() {
        let (queue, runner) = job_channel(256);

        for _ in 0..150 {
            queue.submit(Box::new(|| {})).await.unwrap();
        }

        assert!(runner.run_once().await, "batch limit leaves jobs queued");
        assert!(!runner.run_once().await, "second batch drains the rest");
    }

    #[tokio::test]
    async fn panicking_job_does_not_poison_the_loop() {
        let (queue, runner) = job_channel(16);
        let ran_after = Arc::new(AtomicBool::new(false));

        queue
            .submit(Box::new(|| panic!("callback exploded")))
            .await
            .unwrap();

        {
            let ran_after = ran_after.clone();
            queue
                .submit(Box::new(move || {
                    ran_after.store(true, Ordering::Release);
                }))
                .await
                .unwrap();
        }

        runner.run_once().await;
        assert!(ran_after.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_times_out_when_queue_is_full() {
        let (queue, _runner) = job_channel(1);

        queue.submit(Box::new(|| {})).await.unwrap();

        let result = queue.submit(Box::new(|| {})).await;
        assert!(matches!(result, Err(SubmitError::Timeout)));
    }

    #[tokio::test]
    async fn run_until_stops_on_cancel() {
        let (_queue, runner) = job_channel(4);
        let cancel = CancellationToken::new();

        cancel.cancel();
        runner.run_until(&cancel).await;
    }
}
