//! The introspection sink: events land in the structured log. Bypasses
//! connectivity checks, since there is nothing external to reach.

use async_trait::async_trait;
use tracing::info;

use vigil_common::Event;

use crate::error::AdapterError;
use crate::adapters::Sink;

pub struct PrintSink {
    label: String,
}

impl PrintSink {
    pub fn new(label: String) -> Self {
        Self { label }
    }
}

#[async_trait]
impl Sink for PrintSink {
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError> {
        for event in batch {
            info!(output = %self.label, event = %event.to_json_line(), "event");
        }
        Ok(())
    }
}
