//! Kafka transport.
//!
//! Topics map one to one onto Kafka topics and a queue is a consumer group,
//! so every queue sees every message of its topics. Deliveries settle out of
//! order, so a partition's offset is committed only up to the first message
//! not yet acknowledged. A nacked delivery is offered again in process and
//! its offset stays uncommitted until then.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;

use super::offsets::OffsetTracker;
use super::{Acknowledge, BusError, Delivery, Envelope, MessageBus, Subscription};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaBus {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
        })
    }
}

struct OffsetAcker {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    requeue: mpsc::UnboundedSender<Delivery>,
    envelope: Envelope,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledge for OffsetAcker {
    fn ack(self: Box<Self>) {
        let next = match self.offsets.lock() {
            Ok(mut offsets) => offsets.ack(&self.topic, self.partition, self.offset),
            Err(_) => None,
        };
        let Some(next) = next else {
            return;
        };

        let mut tpl = TopicPartitionList::new();
        let committed = tpl
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(next))
            .and_then(|_| self.consumer.commit(&tpl, CommitMode::Async));
        if let Err(e) = committed {
            log::warn!(
                "Failed to commit {}[{}]@{}; it may be redelivered: {}",
                self.topic,
                self.partition,
                next,
                e
            );
        }
    }

    fn nack(self: Box<Self>) {
        let requeue = self.requeue.clone();
        let envelope = self.envelope.clone();
        if let Err(mpsc::error::SendError(lost)) = requeue.send(Delivery::new(envelope, true, self)) {
            // Subscription closed; the uncommitted offset is read again on restart.
            lost.forget();
        }
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let body = serde_json::to_vec(envelope)?;
        // Keying by aggregate keeps one auction's events on one partition.
        let record = FutureRecord::to(topic)
            .key(&envelope.aggregate_id)
            .payload(&body);
        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, queue: &str, topics: &[&str]) -> Result<Subscription, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", queue)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        consumer
            .subscribe(topics)
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let consumer = Arc::new(consumer);
        let offsets = Arc::new(Mutex::new(OffsetTracker::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            loop {
                let message = match consumer.recv().await {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Kafka receive error on {}: {}", queue_name, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let (topic, partition, offset) =
                    (message.topic().to_string(), message.partition(), message.offset());

                let raw = message.payload().unwrap_or_default();
                let envelope = match serde_json::from_slice::<Envelope>(raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::error!(
                            "Undecodable message {}[{}]@{} on {}: {}",
                            topic,
                            partition,
                            offset,
                            queue_name,
                            e
                        );
                        let key = message.key().map(String::from_utf8_lossy);
                        Envelope::unreadable(key.as_deref(), raw)
                    }
                };

                if let Ok(mut offsets) = offsets.lock() {
                    offsets.track(&topic, partition, offset);
                }
                let acker = OffsetAcker {
                    consumer: Arc::clone(&consumer),
                    offsets: Arc::clone(&offsets),
                    requeue: tx.clone(),
                    envelope: envelope.clone(),
                    topic,
                    partition,
                    offset,
                };
                if tx.send(Delivery::new(envelope, false, Box::new(acker))).is_err() {
                    log::debug!("Subscription {} closed, stopping Kafka reader", queue_name);
                    break;
                }
            }
        });

        Ok(Subscription::new(queue, rx))
    }

    // Topics keep their messages, and a new group starts from the earliest
    // offset, so a queue only exists once something consumes it.
    async fn declare(&self, _queue: &str, _topics: &[&str]) -> Result<(), BusError> {
        Ok(())
    }
}
