use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Acknowledge, BusError, Delivery, Envelope, MessageBus, Subscription};

struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    /// `None` while a consumer holds the queue.
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct Inner {
    available: bool,
    /// topic -> bound queue names
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, Queue>,
    /// Only kept by [`InMemoryBus::recording`].
    published: Option<Vec<(String, Envelope)>>,
}

impl Inner {
    fn bind(&mut self, queue: &str, topics: &[&str]) -> &mut Queue {
        for topic in topics {
            let bound = self.bindings.entry(topic.to_string()).or_default();
            if !bound.iter().any(|name| name == queue) {
                bound.push(queue.to_string());
            }
        }
        self.queues.entry(queue.to_string()).or_insert_with(Queue::new)
    }
}

/// In-process broker with durable queues.
///
/// Messages published to a topic are copied to every queue bound to it at
/// that moment; topics without bindings drop them, as a broker exchange does.
/// Queues outlive their consumers, and an unacknowledged delivery is put back
/// on its queue.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_log(None)
    }

    /// A bus that also keeps every accepted message for [`InMemoryBus::published`].
    pub fn recording() -> Self {
        Self::with_log(Some(Vec::new()))
    }

    fn with_log(published: Option<Vec<(String, Envelope)>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                bindings: HashMap::new(),
                queues: HashMap::new(),
                published,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BusError> {
        self.inner
            .lock()
            .map_err(|_| BusError::Unavailable("bus state poisoned".to_string()))
    }

    /// Simulates a broker outage: publishes fail while `false`.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.available = available;
        }
    }

    /// Every accepted `(topic, envelope)` in publish order. Empty unless the
    /// bus was created with [`InMemoryBus::recording`].
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.published.clone())
            .unwrap_or_default()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope)
            .collect()
    }
}

struct QueueAcker {
    tx: mpsc::UnboundedSender<Delivery>,
    envelope: Envelope,
}

impl QueueAcker {
    fn delivery(tx: &mpsc::UnboundedSender<Delivery>, envelope: Envelope, redelivered: bool) -> Delivery {
        let acker = QueueAcker {
            tx: tx.clone(),
            envelope: envelope.clone(),
        };
        Delivery::new(envelope, redelivered, Box::new(acker))
    }
}

impl Acknowledge for QueueAcker {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>) {
        let QueueAcker { tx, envelope } = *self;
        if let Err(mpsc::error::SendError(lost)) = tx.send(QueueAcker::delivery(&tx, envelope, true)) {
            // The queue itself is gone.
            lost.forget();
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        if !inner.available {
            return Err(BusError::Unavailable("broker is down".to_string()));
        }

        let bound = inner.bindings.get(topic).cloned().unwrap_or_default();
        for name in bound {
            if let Some(queue) = inner.queues.get(&name) {
                if let Err(mpsc::error::SendError(lost)) =
                    queue.tx.send(QueueAcker::delivery(&queue.tx, envelope.clone(), false))
                {
                    lost.forget();
                }
            }
        }
        if let Some(log) = inner.published.as_mut() {
            log.push((topic.to_string(), envelope.clone()));
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, topics: &[&str]) -> Result<Subscription, BusError> {
        let rx = self
            .lock()?
            .bind(queue, topics)
            .rx
            .take()
            .ok_or_else(|| BusError::QueueInUse(queue.to_string()))?;

        let shared = Arc::clone(&self.inner);
        let name = queue.to_string();
        Ok(Subscription::new(queue, rx).on_close(Box::new(move |rx| {
            if let Ok(mut inner) = shared.lock() {
                if let Some(queue) = inner.queues.get_mut(&name) {
                    queue.rx = Some(rx);
                }
            }
        })))
    }

    async fn declare(&self, queue: &str, topics: &[&str]) -> Result<(), BusError> {
        self.lock()?.bind(queue, topics);
        Ok(())
    }
}
