//! Fan-out of membership change notifications

use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

/// Broadcasts values to any number of subscribers.
///
/// Subscribers that fall behind lose the oldest notifications rather than
/// stalling the sender.
#[derive(Debug, Clone)]
pub struct Listener<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Listener<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send `value` to current subscribers, returning how many received it
    pub fn notify(&self, value: T) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `callback` for every notification until the returned poll is dropped
    pub fn on_notify<F, Fut>(&self, mut callback: F) -> CallbackPoll
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(value).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Listener callback lagged, skipped {} notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Listener closed, stopping callback");
                        break;
                    }
                }
            }
        });
        CallbackPoll { handle }
    }
}

impl<T> Default for Listener<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a callback registered with [`Listener::on_notify`]; aborts it on drop
#[derive(Debug)]
pub struct CallbackPoll {
    handle: JoinHandle<()>,
}

impl CallbackPoll {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the callback and wait for it to unwind
    pub async fn cancel(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for CallbackPoll {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_subscribers_receive_notifications() {
        let listener: Listener<u32> = Listener::new();
        assert_eq!(listener.notify(1), 0);

        let mut a = listener.subscribe();
        let mut b = listener.subscribe();
        assert_eq!(listener.subscriber_count(), 2);
        assert_eq!(listener.notify(7), 2);

        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_on_notify_runs_callback() {
        let listener: Listener<&'static str> = Listener::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(4);

        let poll = {
            let seen = seen.clone();
            listener.on_notify(move |value| {
                let seen = seen.clone();
                let done_tx = done_tx.clone();
                async move {
                    seen.lock().await.push(value);
                    let _ = done_tx.send(()).await;
                }
            })
        };

        listener.notify("online");
        listener.notify("suspect");
        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        assert_eq!(*seen.lock().await, vec!["online", "suspect"]);

        drop(poll);
        for _ in 0..10 {
            if listener.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_stops_when_listener_dropped() {
        let listener: Listener<u32> = Listener::new();
        let poll = listener.on_notify(|_| async {});
        drop(listener);

        for _ in 0..10 {
            if poll.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(poll.is_finished());
    }
}
