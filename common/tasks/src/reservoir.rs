use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::warn;

/// Endpoints of a [`reservoir`] buffer.
pub struct ReservoirHandles<T> {
    pub input: mpsc::Sender<T>,
    pub output: mpsc::Receiver<T>,
    pub overflow: mpsc::Receiver<T>,
}

/// Bounded non-blocking buffer between a hot ingress path and a slow consumer.
///
/// Items flow input → output in order. Once the internal queue holds `limit`
/// items, new arrivals are diverted to the overflow channel (depth 1) or
/// dropped with a warning, so the ingress side never blocks on the consumer.
/// Closing the input drains the queue to the output before both close.
pub fn reservoir<T: Send + 'static>(limit: usize) -> ReservoirHandles<T> {
    let (input, mut in_rx) = mpsc::channel::<T>(1);
    let (out_tx, output) = mpsc::channel::<T>(1);
    let (ovf_tx, overflow) = mpsc::channel::<T>(1);

    tokio::spawn(async move {
        let mut queue: VecDeque<T> = VecDeque::new();
        loop {
            if queue.is_empty() {
                match in_rx.recv().await {
                    Some(item) => queue.push_back(item),
                    None => break,
                }
                continue;
            }
            tokio::select! {
                permit = out_tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(item) = queue.pop_front() {
                                permit.send(item);
                            }
                        }
                        // Output receiver gone; nothing left to forward to.
                        Err(_) => return,
                    }
                }
                item = in_rx.recv() => {
                    match item {
                        Some(item) if queue.len() < limit => queue.push_back(item),
                        Some(item) => {
                            if ovf_tx.try_send(item).is_err() {
                                warn!(limit, "reservoir full, dropping item");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        // Input closed: drain what is queued, preserving order.
        for item in queue {
            if out_tx.send(item).await.is_err() {
                return;
            }
        }
    });

    ReservoirHandles {
        input,
        output,
        overflow,
    }
}
