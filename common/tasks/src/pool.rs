use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::looper::CancelWatch;

pub type Job = Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>;

/// Fan-out channel of work items served by N workers.
///
/// Dropping the sender side (via `close`) lets workers drain the queue and
/// exit; `cancel` makes them finish only their current item.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, cancel_rx) = watch::channel(false);

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let mut cancel = CancelWatch::from_receiver(cancel_rx.clone());
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            shutdown,
            workers: handles,
        }
    }

    /// Non-blocking submit; hands the job back when the queue is full or the
    /// pool is closed.
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        match &self.tx {
            Some(tx) => tx.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(job) => job,
                mpsc::error::TrySendError::Closed(job) => job,
            }),
            None => Err(job),
        }
    }

    pub async fn submit(&self, job: Job) -> bool {
        match &self.tx {
            Some(tx) => tx.send(job).await.is_ok(),
            None => false,
        }
    }

    /// Signals workers to stop after their current item.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Closes the channel, drains queued work, and joins every worker.
    pub async fn close(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
