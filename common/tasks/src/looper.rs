use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backoff::ExponentialBackoff;

/// Cloneable view of a cancellation signal, observable inside work functions.
#[derive(Clone)]
pub struct CancelWatch {
    rx: watch::Receiver<bool>,
}

impl CancelWatch {
    pub(crate) fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled (or the owner is gone).
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

/// A cooperative daemon running a work function on a period.
///
/// On success the work sleeps the configured period and the backoff resets;
/// on error the error handler decides: returning `Err` terminates the loop,
/// returning `Ok` sleeps the next backoff delay instead of the period.
pub struct Looper {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Looper {
    pub fn spawn<W, Fut, E, H>(
        name: &'static str,
        period: Duration,
        mut backoff: ExponentialBackoff,
        mut work: W,
        mut on_error: H,
    ) -> Self
    where
        W: FnMut(CancelWatch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
        H: FnMut(&E) -> Result<(), E> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let mut cancel = CancelWatch { rx };
        let task = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let sleep_for = match work(cancel.clone()).await {
                    Ok(()) => {
                        backoff.reset();
                        period
                    }
                    Err(err) => match on_error(&err) {
                        Ok(()) => backoff.next_delay(),
                        Err(fatal) => {
                            warn!(task = name, error = %fatal, "background loop terminated");
                            break;
                        }
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        });
        Self {
            name,
            shutdown,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals cancellation without waiting for the task to finish.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Cancels and waits for the task to acknowledge and exit.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
