//! Kafka drivers, compiled under the `kafka` feature.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use tracing::warn;

use vigil_common::Event;

use crate::config::{KafkaInput, KafkaOutput};
use crate::error::AdapterError;
use crate::adapters::{Sink, Source};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaSource {
    id: String,
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub async fn connect(id: &str, config: &KafkaInput) -> Result<Self, AdapterError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| connectivity("input", id, e.to_string()))?;

        // Metadata fetch doubles as the start-time connectivity check.
        consumer
            .fetch_metadata(Some(&config.topic), METADATA_TIMEOUT)
            .map_err(|e| connectivity("input", id, e.to_string()))?;
        consumer
            .subscribe(&[&config.topic])
            .map_err(|e| connectivity("input", id, e.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            consumer,
        })
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn next(&mut self) -> Result<Option<Event>, AdapterError> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        continue;
                    };
                    match std::str::from_utf8(payload)
                        .map_err(|e| e.to_string())
                        .and_then(|text| Event::from_json_line(text).map_err(|e| e.to_string()))
                    {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => {
                            warn!(input = %self.id, error = %e, "Skipping undecodable message");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    return Err(AdapterError::WriteFailed(format!(
                        "kafka consume: {e}"
                    )))
                }
            }
        }
    }
}

pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
}

impl KafkaSink {
    pub async fn connect(
        id: &str,
        config: &KafkaOutput,
        check_connectivity: bool,
    ) -> Result<Self, AdapterError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| connectivity("output", id, e.to_string()))?;

        if check_connectivity {
            producer
                .client()
                .fetch_metadata(Some(&config.topic), METADATA_TIMEOUT)
                .map_err(|e| connectivity("output", id, e.to_string()))?;
        }

        Ok(Self {
            topic: config.topic.clone(),
            producer,
        })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError> {
        for event in batch {
            let payload = event.to_json_line();
            let record: FutureRecord<'_, (), String> =
                FutureRecord::to(&self.topic).payload(&payload);
            self.producer
                .send(record, SEND_TIMEOUT)
                .await
                .map_err(|(e, _)| AdapterError::WriteFailed(format!("kafka produce: {e}")))?;
        }
        Ok(())
    }
}

fn connectivity(kind: &'static str, id: &str, detail: String) -> AdapterError {
    AdapterError::Connectivity {
        kind,
        id: id.to_string(),
        detail,
    }
}
