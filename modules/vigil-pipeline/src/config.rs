//! Input/Output component configs: YAML documents with a `type`
//! discriminator and one nested block per type.
//!
//! ```yaml
//! type: kafka
//! kafka:
//!   brokers: ["broker-1:9092"]
//!   topic: raw_events
//!   group: vigil
//! ```
//!
//! Only structure is validated here; reaching the external system is the
//! adapter's start-time concern.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub kafka: Option<KafkaInput>,
    pub file: Option<FileInput>,
    pub memory: Option<MemoryQueue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaInput {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileInput {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryQueue {
    pub queue: String,
}

impl InputConfig {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let config: InputConfig =
            serde_yaml::from_str(raw).map_err(|e| format!("invalid input config: {e}"))?;
        match config.kind.as_str() {
            "kafka" => {
                let kafka = config
                    .kafka
                    .as_ref()
                    .ok_or("kafka input missing kafka block")?;
                if kafka.brokers.is_empty() {
                    return Err("kafka input needs at least one broker".to_string());
                }
                require(&kafka.topic, "kafka.topic")?;
                require(&kafka.group, "kafka.group")?;
            }
            "file" => {
                let file = config.file.as_ref().ok_or("file input missing file block")?;
                require(&file.path, "file.path")?;
            }
            "memory" => {
                let memory = config
                    .memory
                    .as_ref()
                    .ok_or("memory input missing memory block")?;
                require(&memory.queue, "memory.queue")?;
            }
            other => return Err(format!("unknown input type: {other}")),
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub print: Option<PrintOutput>,
    pub file: Option<FileOutput>,
    pub elasticsearch: Option<ElasticsearchOutput>,
    pub kafka: Option<KafkaOutput>,
    pub memory: Option<MemoryQueue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrintOutput {
    /// Log target label; defaults to the output id.
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOutput {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchOutput {
    pub hosts: Vec<String>,
    pub index: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaOutput {
    pub brokers: Vec<String>,
    pub topic: String,
}

impl OutputConfig {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let config: OutputConfig =
            serde_yaml::from_str(raw).map_err(|e| format!("invalid output config: {e}"))?;
        match config.kind.as_str() {
            // print works with an absent block
            "print" => {}
            "file" => {
                let file = config.file.as_ref().ok_or("file output missing file block")?;
                require(&file.path, "file.path")?;
            }
            "elasticsearch" => {
                let es = config
                    .elasticsearch
                    .as_ref()
                    .ok_or("elasticsearch output missing elasticsearch block")?;
                if es.hosts.is_empty() {
                    return Err("elasticsearch output needs at least one host".to_string());
                }
                require(&es.index, "elasticsearch.index")?;
            }
            "kafka" => {
                let kafka = config
                    .kafka
                    .as_ref()
                    .ok_or("kafka output missing kafka block")?;
                if kafka.brokers.is_empty() {
                    return Err("kafka output needs at least one broker".to_string());
                }
                require(&kafka.topic, "kafka.topic")?;
            }
            "memory" => {
                let memory = config
                    .memory
                    .as_ref()
                    .ok_or("memory output missing memory block")?;
                require(&memory.queue, "memory.queue")?;
            }
            other => return Err(format!("unknown output type: {other}")),
        }
        Ok(config)
    }

    /// Introspection sinks skip start-time connectivity checks.
    pub fn bypasses_connectivity(&self) -> bool {
        matches!(self.kind.as_str(), "print" | "memory")
    }
}

fn require(value: &str, name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{name} must not be empty"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_input_requires_its_block() {
        let ok = "type: kafka\nkafka:\n  brokers: [\"b:9092\"]\n  topic: t\n  group: g\n";
        assert!(InputConfig::parse(ok).is_ok());

        assert!(InputConfig::parse("type: kafka\n").is_err());
        let empty_brokers = "type: kafka\nkafka:\n  brokers: []\n  topic: t\n  group: g\n";
        assert!(InputConfig::parse(empty_brokers).is_err());
    }

    #[test]
    fn unknown_types_and_fields_are_rejected() {
        assert!(InputConfig::parse("type: carrier_pigeon\n").is_err());
        assert!(InputConfig::parse("type: file\nfile:\n  path: /x\nextra: 1\n").is_err());
    }

    #[test]
    fn print_output_needs_no_block() {
        let config = OutputConfig::parse("type: print\n").unwrap();
        assert!(config.bypasses_connectivity());
    }

    #[test]
    fn elasticsearch_requires_hosts_and_index() {
        let ok = "type: elasticsearch\nelasticsearch:\n  hosts: [\"http://es:9200\"]\n  index: alerts\n";
        let config = OutputConfig::parse(ok).unwrap();
        assert!(!config.bypasses_connectivity());

        let missing_index =
            "type: elasticsearch\nelasticsearch:\n  hosts: [\"http://es:9200\"]\n  index: \"\"\n";
        assert!(OutputConfig::parse(missing_index).is_err());
    }
}
