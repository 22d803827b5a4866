use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::{ConsumerConfig, KafkaConfig};

/// Client config shared by every consumer in the pipeline. Offsets are never
/// stored automatically: the application stores (or commits) them once the
/// message has been fully handled.
pub fn consumer_client_config(
    common_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &common_config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set(
            "enable.auto.commit",
            consumer_config.kafka_consumer_auto_commit.to_string(),
        )
        .set(
            "auto.commit.interval.ms",
            consumer_config
                .kafka_consumer_auto_commit_interval_ms
                .to_string(),
        )
        .set("enable.auto.offset.store", "false");

    if common_config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

/// A consumer of JSON messages on a single topic, handing out an `Offset` per
/// message that must be stored once the message is handled.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer =
            consumer_client_config(&common_config, &consumer_config).create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Receives and decodes the next message. Undecodable messages have their
    /// offset stored before the error is returned, so they are never redelivered.
    pub async fn json_recv<T>(&self) -> Result<(T, Offset), RecvErr>
    where
        T: DeserializeOwned,
    {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            store_poison_pill(offset);
            return Err(RecvErr::Empty);
        };

        match serde_json::from_slice(payload) {
            Ok(decoded) => Ok((decoded, offset)),
            Err(e) => {
                store_poison_pill(offset);
                Err(RecvErr::Serde(e))
            }
        }
    }
}

fn store_poison_pill(offset: Offset) {
    let (partition, position) = (offset.partition, offset.offset);
    if let Err(e) = offset.store() {
        warn!(partition, offset = position, error = %e, "failed to store offset of undecodable message");
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}
