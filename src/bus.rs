//! Asynchronous fan-out from the gateway adapter to subscribed devices.
//!
//! `publish` dispatches to every subscriber as an independently spawned
//! task: a slow or stuck subscriber never blocks delivery to the others,
//! and there is no ordering guarantee between them.

use crate::envelope::RadioEnvelope;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Subscriber = Arc<dyn Fn(RadioEnvelope) -> futures_fanout::BoxFuture + Send + Sync>;

/// A tiny local shim so subscriber callbacks can return an arbitrary future
/// without pulling in the `futures` crate just for `BoxFuture`.
pub mod futures_fanout {
    use std::future::Future;
    use std::pin::Pin;
    pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[derive(Clone, Default)]
pub struct MessageBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, callback: Subscriber) {
        self.subscribers.write().await.push(callback);
    }

    /// Fan out `envelope` to every subscriber, each as its own task.
    pub async fn publish(&self, envelope: RadioEnvelope) {
        let subscribers = self.subscribers.read().await.clone();
        for subscriber in subscribers {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                subscriber(envelope).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_envelope() -> RadioEnvelope {
        RadioEnvelope {
            payload: vec![1],
            dev_addr: 1,
            frequency_hz: 868_100_000,
            channel_index: 0,
            spreading_factor: 7,
            bandwidth_khz: 125,
            coding_rate: "4/5",
            tx_power_dbm: 14,
            rssi: None,
            snr: None,
            size: 1,
            concentrator_tmst: None,
            utc_iso: None,
            distance_m: 100.0,
            environment: "suburban".into(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = MessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            bus.subscribe(Arc::new(move |_env| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;
        }

        bus.publish(test_envelope()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
