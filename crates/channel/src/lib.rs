//! Fan-out broadcast channel.
//!
//! A [`Broadcaster`] pumps a single producer channel into any number of
//! subscriber channels. Every subscriber channel has a buffer of exactly
//! one: a slow subscriber briefly blocks the pump, bounding how far any
//! consumer can fall behind the producer's poll period.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

struct Registry<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<T>>,
    closed: bool,
}

struct Shared<T> {
    // Held across subscriber sends: publishing and subscribe/unsubscribe
    // are mutually exclusive.
    registry: Mutex<Registry<T>>,
}

/// Fans one producer channel out to all current subscribers.
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
    input_tx: mpsc::Sender<T>,
    input_rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        let (input_tx, input_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    senders: HashMap::new(),
                    closed: false,
                }),
            }),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
        }
    }

    /// Producer handle. Sends block while the pump is delivering to a slow
    /// subscriber.
    pub fn sender(&self) -> mpsc::Sender<T> {
        self.input_tx.clone()
    }

    /// Run the fan-out pump until shutdown is signalled or every producer
    /// handle is dropped. All subscriber channels are closed on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut input = match self.input_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped shutdown sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        self.close().await;
                        return;
                    }
                }
                item = input.recv() => {
                    let Some(item) = item else {
                        self.close().await;
                        return;
                    };
                    let mut registry = self.shared.registry.lock().await;
                    let mut dropped = Vec::new();
                    for (id, sender) in registry.senders.iter() {
                        if sender.send(item.clone()).await.is_err() {
                            dropped.push(*id);
                        }
                    }
                    for id in dropped {
                        registry.senders.remove(&id);
                    }
                }
            }
        }
    }

    /// Register a new subscriber. If the broadcaster already shut down the
    /// returned subscription is immediately closed.
    pub async fn subscribe(&self) -> Subscription<T> {
        let mut registry = self.shared.registry.lock().await;
        let (tx, rx) = mpsc::channel(1);
        if registry.closed {
            // Dropping the sender leaves the receiver closed.
            return Subscription {
                handle: SubscriptionHandle {
                    id: u64::MAX,
                    shared: Arc::clone(&self.shared),
                },
                receiver: rx,
            };
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, tx);
        Subscription {
            handle: SubscriptionHandle {
                id,
                shared: Arc::clone(&self.shared),
            },
            receiver: rx,
        }
    }

    /// Close every subscriber channel and refuse new subscriptions.
    pub async fn close(&self) {
        let mut registry = self.shared.registry.lock().await;
        if registry.closed {
            return;
        }
        debug!("broadcaster closing {} subscribers", registry.senders.len());
        registry.closed = true;
        registry.senders.clear();
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered subscriber: a receiving channel plus a handle that detaches
/// it from the broadcaster.
pub struct Subscription<T> {
    handle: SubscriptionHandle<T>,
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Split into the detach handle and the raw receiver, for pipelines
    /// that consume the receiver elsewhere.
    pub fn split(self) -> (SubscriptionHandle<T>, mpsc::Receiver<T>) {
        (self.handle, self.receiver)
    }

    pub async fn close(self) {
        self.handle.close().await;
    }
}

pub struct SubscriptionHandle<T> {
    id: u64,
    shared: Arc<Shared<T>>,
}

impl<T> SubscriptionHandle<T> {
    /// Detach from the broadcaster; the subscription's channel closes once
    /// its sender is dropped here.
    pub async fn close(self) {
        let mut registry = self.shared.registry.lock().await;
        registry.senders.remove(&self.id);
    }
}

/// Concatenate two channels: everything from `first` is forwarded, in
/// order, before anything from `second`. Used to splice a catch-up read in
/// front of a live feed.
pub fn concat<T: Send + 'static>(
    mut first: mpsc::Receiver<T>,
    mut second: mpsc::Receiver<T>,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(item) = first.recv().await {
            if tx.send(item).await.is_err() {
                return;
            }
        }
        while let Some(item) = second.recv().await {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let b = Broadcaster::new();
        let (_tx, shutdown) = watch::channel(false);
        let mut sub1 = b.subscribe().await;
        let mut sub2 = b.subscribe().await;

        let sender = b.sender();
        let b = Arc::new(b);
        let pump = Arc::clone(&b);
        tokio::spawn(async move { pump.run(shutdown).await });

        sender.send(1u32).await.unwrap();
        assert_eq!(sub1.recv().await, Some(1));
        assert_eq!(sub2.recv().await, Some(1));

        sender.send(2).await.unwrap();
        assert_eq!(sub1.recv().await, Some(2));
        assert_eq!(sub2.recv().await, Some(2));
    }

    #[tokio::test]
    async fn shutdown_closes_subscribers() {
        let b = Arc::new(Broadcaster::<u32>::new());
        let (tx, shutdown) = watch::channel(false);
        let mut sub = b.subscribe().await;
        let pump = Arc::clone(&b);
        let handle = tokio::spawn(async move { pump.run(shutdown).await });

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(sub.recv().await, None);

        // late subscribers observe a closed channel right away
        let mut late = b.subscribe().await;
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn detached_subscriber_no_longer_blocks_the_pump() {
        let b = Arc::new(Broadcaster::new());
        let (_tx, shutdown) = watch::channel(false);
        let slow = b.subscribe().await;
        let mut live = b.subscribe().await;
        let sender = b.sender();
        let pump = Arc::clone(&b);
        tokio::spawn(async move { pump.run(shutdown).await });

        slow.close().await;
        sender.send(7u32).await.unwrap();
        let got = timeout(Duration::from_secs(1), live.recv()).await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn concat_orders_catch_up_before_live() {
        let (first_tx, first_rx) = mpsc::channel(4);
        let (second_tx, second_rx) = mpsc::channel(4);
        let mut merged = concat(first_rx, second_rx);

        second_tx.send(10u32).await.unwrap();
        first_tx.send(1).await.unwrap();
        first_tx.send(2).await.unwrap();
        drop(first_tx);
        drop(second_tx);

        assert_eq!(merged.recv().await, Some(1));
        assert_eq!(merged.recv().await, Some(2));
        assert_eq!(merged.recv().await, Some(10));
        assert_eq!(merged.recv().await, None);
    }
}
