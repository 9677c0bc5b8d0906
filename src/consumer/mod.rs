//! Receive endpoints: one named queue per event type, a bounded pool of
//! concurrent handler invocations per queue, and the redelivery policy
//! wrapped around every invocation.

pub mod auction;
pub mod redelivery;
pub mod search;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{dead_letter_topic, BusError, Delivery, Fault, MessageBus, Subscription};
use crate::domain::errors::DomainError;
use crate::domain::events::{DomainEvent, EventDecodeError, EventType};

pub use redelivery::{DeliveryOutcome, RedeliveryPolicy};

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("malformed message: {0}")]
    Malformed(#[from] EventDecodeError),
    #[error("unexpected {0} on this endpoint")]
    Unexpected(&'static str),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: DomainEvent) -> Result<(), ConsumeError>;
}

pub struct ReceiveEndpoint {
    pub queue: String,
    pub event_type: EventType,
    pub policy: RedeliveryPolicy,
    /// Upper bound on concurrently running handler invocations.
    pub concurrency: usize,
    pub handler: Arc<dyn EventHandler>,
}

/// Collects endpoints and binds them to their queues.
pub struct ConsumerHost {
    bus: Arc<dyn MessageBus>,
    endpoints: Vec<ReceiveEndpoint>,
}

impl ConsumerHost {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoint(mut self, endpoint: ReceiveEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn endpoints(mut self, endpoints: impl IntoIterator<Item = ReceiveEndpoint>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    /// Declares every queue and its binding, plus a `<queue>_error` queue for
    /// its dead letters. Messages published from here on are retained by the
    /// bus even before [`BoundConsumers::run`] starts.
    pub async fn bind(self) -> Result<BoundConsumers, BusError> {
        let mut bound = Vec::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints {
            let error_queue = dead_letter_topic(&endpoint.queue);
            self.bus.declare(&error_queue, &[&error_queue]).await?;
            let subscription = self
                .bus
                .subscribe(&endpoint.queue, &[endpoint.event_type.topic()])
                .await?;
            log::info!(
                "Bound queue {} to {} (dead letters to {})",
                endpoint.queue,
                endpoint.event_type.topic(),
                error_queue
            );
            bound.push((endpoint, subscription));
        }
        Ok(BoundConsumers {
            bus: self.bus,
            bound,
        })
    }
}

pub struct BoundConsumers {
    bus: Arc<dyn MessageBus>,
    bound: Vec<(ReceiveEndpoint, Subscription)>,
}

impl BoundConsumers {
    /// Consumes until `shutdown` fires, then waits for in-flight invocations.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut endpoints = JoinSet::new();
        for (endpoint, subscription) in self.bound {
            endpoints.spawn(consume(
                Arc::clone(&self.bus),
                Arc::new(endpoint),
                subscription,
                shutdown.clone(),
            ));
        }
        while let Some(joined) = endpoints.join_next().await {
            if let Err(e) = joined {
                log::error!("Consumer task failed: {}", e);
            }
        }
    }
}

async fn consume(
    bus: Arc<dyn MessageBus>,
    endpoint: Arc<ReceiveEndpoint>,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(endpoint.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(process(
            Arc::clone(&bus),
            Arc::clone(&endpoint),
            delivery,
            shutdown.clone(),
            permit,
        ));
    }

    while in_flight.join_next().await.is_some() {}
    log::info!("Consumer {} stopped", subscription.queue());
}

async fn process(
    bus: Arc<dyn MessageBus>,
    endpoint: Arc<ReceiveEndpoint>,
    delivery: Delivery,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> DeliveryOutcome {
    let envelope = delivery.envelope.clone();
    let queue = endpoint.queue.as_str();

    let outcome = endpoint
        .policy
        .execute(&shutdown, |attempt| {
            let (endpoint, envelope) = (&endpoint, &envelope);
            async move {
                let result = match envelope.decode() {
                    Ok(event) => endpoint.handler.handle(event).await,
                    Err(e) => Err(ConsumeError::from(e)),
                };
                if let Err(e) = &result {
                    log::warn!(
                        "{} attempt {}/{} for {} {} failed: {}",
                        queue,
                        attempt,
                        endpoint.policy.max_attempts(),
                        envelope.message_type,
                        envelope.aggregate_id,
                        e
                    );
                }
                result
            }
        })
        .await;

    match &outcome {
        DeliveryOutcome::Handled { attempts } => {
            log::debug!(
                "{} handled {} {} in {} attempt(s)",
                queue,
                envelope.message_type,
                envelope.aggregate_id,
                attempts
            );
            delivery.ack();
        }
        DeliveryOutcome::DeadLettered { attempts, error } => {
            log::error!(
                "{} dead-lettering {} {} after {} attempts: {}",
                queue,
                envelope.message_type,
                envelope.aggregate_id,
                attempts,
                error
            );
            let fault = Fault {
                queue: queue.to_string(),
                attempts: *attempts,
                error: error.clone(),
                message: envelope,
            };
            match dead_letter(bus.as_ref(), fault).await {
                Ok(()) => delivery.ack(),
                // Unacknowledged: the bus offers it again.
                Err(e) => log::error!("{} could not dead-letter message: {}", queue, e),
            }
        }
        DeliveryOutcome::Abandoned { attempts } => {
            log::info!(
                "{} leaving {} {} for redelivery after {} attempt(s)",
                queue,
                envelope.message_type,
                envelope.aggregate_id,
                attempts
            );
        }
    }
    outcome
}

async fn dead_letter(bus: &dyn MessageBus, fault: Fault) -> Result<(), BusError> {
    let topic = dead_letter_topic(&fault.queue);
    let envelope = fault.into_envelope()?;
    bus.publish(&topic, &envelope).await
}
