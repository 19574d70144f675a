//! Source and sink drivers behind the input/output adapters.
//!
//! Concrete wire protocols stay behind these two traits; the runtime only
//! sees "events in" and "batches out". Kafka drivers are compiled in under
//! the `kafka` feature; without it, kafka-typed components still verify
//! but fail at start with a connectivity error.

pub mod elastic;
pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod print;

use async_trait::async_trait;

use vigil_common::Event;

use crate::config::{InputConfig, OutputConfig};
use crate::error::AdapterError;

/// A stream of decoded events from an external system.
#[async_trait]
pub trait Source: Send {
    /// Next event. `Ok(None)` means the source is exhausted and will never
    /// produce again; transient decode failures are returned as errors and
    /// the caller decides whether to continue.
    async fn next(&mut self) -> Result<Option<Event>, AdapterError>;

    async fn close(&mut self) {}
}

/// A batch-oriented event sink.
#[async_trait]
pub trait Sink: Send {
    /// Deliver one batch. Implementations do not retry; the output
    /// instance owns retry and backoff policy.
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError>;

    async fn close(&mut self) {}
}

/// Construct a source for a validated input config, verifying connectivity
/// where the driver has an external system to reach.
pub async fn build_source(id: &str, config: &InputConfig) -> Result<Box<dyn Source>, AdapterError> {
    match config.kind.as_str() {
        "file" => {
            let file = config.file.as_ref().expect("validated config");
            Ok(Box::new(file::FileSource::open(id, &file.path).await?))
        }
        "memory" => {
            let memory = config.memory.as_ref().expect("validated config");
            Ok(Box::new(memory::MemorySource::attach(&memory.queue)))
        }
        #[cfg(feature = "kafka")]
        "kafka" => {
            let kafka = config.kafka.as_ref().expect("validated config");
            Ok(Box::new(kafka::KafkaSource::connect(id, kafka).await?))
        }
        #[cfg(not(feature = "kafka"))]
        "kafka" => Err(AdapterError::Unsupported { kind: "kafka" }),
        other => Err(AdapterError::Connectivity {
            kind: "input",
            id: id.to_string(),
            detail: format!("unknown input type: {other}"),
        }),
    }
}

/// Construct a sink for a validated output config. `check_connectivity`
/// is skipped for introspection sinks and under the degrade policy.
pub async fn build_sink(
    id: &str,
    config: &OutputConfig,
    check_connectivity: bool,
) -> Result<Box<dyn Sink>, AdapterError> {
    match config.kind.as_str() {
        "print" => {
            let label = config
                .print
                .clone()
                .unwrap_or_default()
                .label
                .unwrap_or_else(|| id.to_string());
            Ok(Box::new(print::PrintSink::new(label)))
        }
        "file" => {
            let file = config.file.as_ref().expect("validated config");
            Ok(Box::new(file::FileSink::open(id, &file.path).await?))
        }
        "memory" => {
            let memory = config.memory.as_ref().expect("validated config");
            Ok(Box::new(memory::MemorySink::attach(&memory.queue)))
        }
        "elasticsearch" => {
            let es = config.elasticsearch.as_ref().expect("validated config");
            let sink = elastic::ElasticsearchSink::new(id, es)?;
            if check_connectivity {
                sink.verify_connectivity().await?;
            }
            Ok(Box::new(sink))
        }
        #[cfg(feature = "kafka")]
        "kafka" => {
            let kafka = config.kafka.as_ref().expect("validated config");
            Ok(Box::new(
                kafka::KafkaSink::connect(id, kafka, check_connectivity).await?,
            ))
        }
        #[cfg(not(feature = "kafka"))]
        "kafka" => Err(AdapterError::Unsupported { kind: "kafka" }),
        other => Err(AdapterError::Connectivity {
            kind: "output",
            id: id.to_string(),
            detail: format!("unknown output type: {other}"),
        }),
    }
}
