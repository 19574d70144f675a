//! Elasticsearch sink over the HTTP bulk endpoint.
//!
//! Speaks plain `_bulk` NDJSON through reqwest; no client library. Hosts
//! rotate on failure. Retry/backoff policy lives in the output instance,
//! not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use vigil_common::Event;

use crate::config::ElasticsearchOutput;
use crate::error::AdapterError;
use crate::adapters::Sink;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ElasticsearchSink {
    id: String,
    client: Client,
    hosts: Vec<String>,
    index: String,
    /// Rotates across hosts on write failures.
    active_host: usize,
}

impl ElasticsearchSink {
    pub fn new(id: &str, config: &ElasticsearchOutput) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Connectivity {
                kind: "output",
                id: id.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            id: id.to_string(),
            client,
            hosts: config
                .hosts
                .iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            index: config.index.clone(),
            active_host: 0,
        })
    }

    /// Start-time connectivity check: any host answering on `/` is enough.
    pub async fn verify_connectivity(&self) -> Result<(), AdapterError> {
        let mut last_error = String::new();
        for host in &self.hosts {
            match self.client.get(host).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_error = format!("{host} answered {}", resp.status()),
                Err(e) => last_error = format!("{host}: {e}"),
            }
        }
        Err(AdapterError::Connectivity {
            kind: "output",
            id: self.id.clone(),
            detail: last_error,
        })
    }

    fn bulk_body(&self, batch: &[Event]) -> String {
        let mut body = String::new();
        for event in batch {
            body.push_str(&format!(r#"{{"index":{{"_index":"{}"}}}}"#, self.index));
            body.push('\n');
            body.push_str(&event.to_json_line());
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError> {
        let host = &self.hosts[self.active_host % self.hosts.len()];
        let url = format!("{host}/_bulk");
        let result = self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(self.bulk_body(batch))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                self.active_host += 1;
                Err(AdapterError::WriteFailed(format!(
                    "{url} answered {}",
                    resp.status()
                )))
            }
            Err(e) => {
                self.active_host += 1;
                Err(AdapterError::WriteFailed(format!("{url}: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_interleaves_actions_and_documents() {
        let sink = ElasticsearchSink::new(
            "es1",
            &ElasticsearchOutput {
                hosts: vec!["http://es:9200/".to_string()],
                index: "alerts".to_string(),
            },
        )
        .unwrap();

        let mut ev = Event::new();
        ev.insert("k", "v");
        let body = sink.bulk_body(&[ev]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""_index":"alerts""#));
        assert!(lines[1].contains(r#""k":"v""#));
        // Host normalization strips the trailing slash.
        assert_eq!(sink.hosts[0], "http://es:9200");
    }
}
