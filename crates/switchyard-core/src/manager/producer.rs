//! Named producers that hand routed messages to the backend.

use crate::backend::MessageBackend;
use crate::message::Message;
use crate::routing::RoutingResult;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a published message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPlan {
    /// Publish with the message's own exchange and routing key
    Direct,
    /// Publish one copy per resolved queue and exchange
    Targets(RoutingResult),
}

/// Snapshot of a producer's activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub name: String,
    pub connected: bool,
    pub published: u64,
    pub failed: u64,
    /// Individual backend deliveries, one per target
    pub deliveries: u64,
}

/// A named publishing handle over the shared backend
pub struct Producer {
    name: String,
    backend: Arc<dyn MessageBackend>,
    connected: AtomicBool,
    published: AtomicU64,
    failed: AtomicU64,
    deliveries: AtomicU64,
}

impl Producer {
    /// Create a connected producer
    pub fn new(name: impl Into<String>, backend: Arc<dyn MessageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            connected: AtomicBool::new(true),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(producer = %self.name, "Producer disconnected");
        }
    }

    /// Deliver a message according to `plan`. True only if every delivery succeeded.
    pub async fn send(&self, message: Message, plan: &DeliveryPlan) -> bool {
        if !self.is_connected() {
            warn!(
                producer = %self.name,
                message_id = %message.id(),
                "Publish on disconnected producer"
            );
            self.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let ok = match plan {
            DeliveryPlan::Direct => self.deliver(self.backend.publish(message).await),
            DeliveryPlan::Targets(targets) => {
                let mut ok = true;
                for queue in &targets.queues {
                    let delivered = self
                        .backend
                        .publish_to_queue(queue, message.clone())
                        .await;
                    ok &= self.deliver(delivered);
                }
                for exchange in &targets.exchanges {
                    let mut copy = message.clone();
                    copy.headers.exchange = Some(exchange.clone());
                    ok &= self.deliver(self.backend.publish(copy).await);
                }
                ok
            }
        };

        if ok {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            name: self.name.clone(),
            connected: self.is_connected(),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, delivered: bool) -> bool {
        if delivered {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }
}
