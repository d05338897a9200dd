/// Serialization channel
///
/// An ordered queue of work items drained by exactly one worker task.
/// Work submitted here never interleaves: header-chain mutation and
/// chain/checkpoint writes go through this, everything else runs on the
/// regular runtime pool.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct SerialScheduler {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl SerialScheduler {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx, worker }
    }

    /// Queue a job and return without waiting for it.
    pub fn submit<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Send only fails when the worker is gone, i.e. during shutdown.
        let _ = self.tx.send(Box::pin(fut));
    }

    /// Queue a job and wait for its result, preserving submission order
    /// relative to every other job on this scheduler.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(async move {
            let _ = done_tx.send(fut.await);
        });
        done_rx.await.expect("serial scheduler worker dropped job")
    }

    /// Stop accepting work and wait for queued jobs to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let sched = SerialScheduler::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..50u32 {
            let log = Arc::clone(&log);
            sched.submit(async move {
                // Yield so out-of-order execution would show up if jobs overlapped.
                tokio::task::yield_now().await;
                log.lock().unwrap().push(i);
            });
        }
        sched.run(async {}).await;

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn run_returns_value_and_serializes() {
        let sched = SerialScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let n = sched
            .run(async move { c.fetch_add(1, Ordering::SeqCst) + 1 })
            .await;
        assert_eq!(n, 1);
        sched.shutdown().await;
    }
}
