//! Kafka-backed [`Queue`].
//!
//! Offsets are committed manually: ack commits the delivered offset, nack
//! republishes the event with a bumped `attempt` header before committing,
//! and dead-lettering moves the event to `{topic}.dlq`. Redelivery of
//! uncommitted events happens on restart or group rebalance.

use crate::model::{Backoff, MentionEvent};
use crate::queue::{Delivery, Queue, Receipt, Subscription};
use crate::Error;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const ATTEMPT_HEADER: &str = "attempt";
const NOT_BEFORE_HEADER: &str = "not-before";
const REASON_HEADER: &str = "dead-letter-reason";

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub send_timeout: Duration,
    pub redelivery: Backoff,
}

#[derive(Clone)]
pub struct KafkaQueue {
    producer: FutureProducer,
    config: KafkaConfig,
}

fn kafka_err(e: impl std::fmt::Display) -> Error {
    Error::Queue(e.to_string())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl KafkaQueue {
    /// Create the producer and check the brokers answer a metadata request.
    pub async fn connect(config: KafkaConfig) -> Result<Self, Error> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .create()
            .map_err(kafka_err)?;

        let client = producer.clone();
        let timeout = config.send_timeout;
        tokio::task::spawn_blocking(move || client.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(|e| Error::Queue(format!("cannot reach brokers: {e}")))?;

        info!(brokers = %config.brokers, "Connected to Kafka");
        Ok(Self { producer, config })
    }

    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: OwnedHeaders,
    ) -> Result<(), Error> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(self.config.send_timeout))
            .await
            .map_err(|(e, _)| kafka_err(e))?;
        Ok(())
    }
}

#[async_trait]
impl Queue for KafkaQueue {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        event: &MentionEvent,
    ) -> Result<(), Error> {
        let payload = event.to_payload()?;
        let headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("1"),
        });
        self.send(topic, partition_key.as_bytes(), &payload, headers)
            .await?;
        debug!(topic, partition_key, mention_id = %event.id, "Published event");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, Error> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(kafka_err)?;
        consumer.subscribe(&[topic]).map_err(kafka_err)?;

        Ok(Box::new(KafkaSubscription {
            queue: self.clone(),
            consumer,
            topic: topic.to_string(),
            keys: HashMap::new(),
        }))
    }
}

struct KafkaSubscription {
    queue: KafkaQueue,
    consumer: StreamConsumer,
    topic: String,
    /// Partition keys of deliveries not yet settled, for republishing
    keys: HashMap<(String, u64), Vec<u8>>,
}

fn header_value<'a>(message: &'a impl Message, name: &str) -> Option<&'a str> {
    let headers = message.headers()?;
    headers
        .iter()
        .find(|h| h.key == name)
        .and_then(|h| h.value)
        .and_then(|v| std::str::from_utf8(v).ok())
}

impl KafkaSubscription {
    fn commit(&self, receipt: &Receipt) -> Result<(), Error> {
        let partition: i32 = receipt
            .partition
            .parse()
            .map_err(|e| Error::Queue(format!("invalid partition in receipt: {e}")))?;
        let offset = i64::try_from(receipt.offset + 1).map_err(kafka_err)?;

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, partition, Offset::Offset(offset))
            .map_err(kafka_err)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(kafka_err)
    }

    fn take_key(&mut self, receipt: &Receipt) -> Vec<u8> {
        self.keys
            .remove(&(receipt.partition.clone(), receipt.offset))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, Error> {
        let (attempt, not_before, receipt, key, payload) = {
            let message = match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => return Ok(None),
                Ok(received) => received.map_err(kafka_err)?,
            };

            let attempt: u32 = header_value(&message, ATTEMPT_HEADER)
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            let not_before =
                header_value(&message, NOT_BEFORE_HEADER).and_then(|v| v.parse::<u64>().ok());
            let receipt = Receipt {
                partition: message.partition().to_string(),
                offset: u64::try_from(message.offset()).map_err(kafka_err)?,
                delivery: 0,
            };
            let key = message.key().map(<[u8]>::to_vec).unwrap_or_default();
            let payload = message.payload().unwrap_or_default().to_vec();
            (attempt, not_before, receipt, key, payload)
        };

        let event = match MentionEvent::from_payload(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = receipt.offset, error = %e, "Undecodable payload - dead-lettering");
                let reason = e.to_string();
                let headers = OwnedHeaders::new().insert(Header {
                    key: REASON_HEADER,
                    value: Some(reason.as_str()),
                });
                let dlq = format!("{}.dlq", self.topic);
                self.queue.send(&dlq, &key, &payload, headers).await?;
                self.commit(&receipt)?;
                return Ok(None);
            }
        };

        if let Some(not_before) = not_before {
            let now = now_millis();
            if not_before > now {
                tokio::time::sleep(Duration::from_millis(not_before - now)).await;
            }
        }

        self.keys
            .insert((receipt.partition.clone(), receipt.offset), key);
        Ok(Some(Delivery {
            event,
            attempt,
            receipt,
        }))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), Error> {
        self.take_key(&delivery.receipt);
        self.commit(&delivery.receipt)
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), Error> {
        let key = self.take_key(&delivery.receipt);
        let delay = self
            .queue
            .config
            .redelivery
            .delay_for(delivery.attempt.saturating_sub(1));
        let attempt = (delivery.attempt + 1).to_string();
        let not_before = (now_millis() + delay.as_millis() as u64).to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: ATTEMPT_HEADER,
                value: Some(attempt.as_str()),
            })
            .insert(Header {
                key: NOT_BEFORE_HEADER,
                value: Some(not_before.as_str()),
            });

        let payload = delivery.event.to_payload()?;
        self.queue.send(&self.topic, &key, &payload, headers).await?;
        self.commit(&delivery.receipt)
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Error> {
        let key = self.take_key(&delivery.receipt);
        let attempt = delivery.attempt.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: ATTEMPT_HEADER,
                value: Some(attempt.as_str()),
            })
            .insert(Header {
                key: REASON_HEADER,
                value: Some(reason),
            });

        let payload = delivery.event.to_payload()?;
        let dlq = format!("{}.dlq", self.topic);
        self.queue.send(&dlq, &key, &payload, headers).await?;
        warn!(topic = %dlq, mention_id = %delivery.event.id, "Event moved to dead-letter topic");
        self.commit(&delivery.receipt)
    }
}
