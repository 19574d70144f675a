//! NDJSON file drivers: a tailing source and an appending sink.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use vigil_common::Event;

use crate::error::AdapterError;
use crate::adapters::{Sink, Source};

/// How long the tailing source sleeps at end-of-file before re-polling.
const TAIL_POLL: Duration = Duration::from_millis(200);

/// Reads one JSON object per line, then keeps tailing the file for
/// appended lines.
pub struct FileSource {
    id: String,
    path: PathBuf,
    reader: tokio::io::Lines<BufReader<File>>,
}

impl FileSource {
    pub async fn open(id: &str, path: &str) -> Result<Self, AdapterError> {
        let file = File::open(path).await.map_err(|e| AdapterError::Connectivity {
            kind: "input",
            id: id.to_string(),
            detail: format!("cannot open {path}: {e}"),
        })?;
        Ok(Self {
            id: id.to_string(),
            path: PathBuf::from(path),
            reader: BufReader::new(file).lines(),
        })
    }
}

#[async_trait]
impl Source for FileSource {
    async fn next(&mut self) -> Result<Option<Event>, AdapterError> {
        loop {
            match self.reader.next_line().await? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match Event::from_json_line(line) {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => {
                            warn!(
                                input = %self.id,
                                path = %self.path.display(),
                                error = %e,
                                "Skipping undecodable line"
                            );
                            continue;
                        }
                    }
                }
                // End of file: wait for appended data.
                None => tokio::time::sleep(TAIL_POLL).await,
            }
        }
    }
}

/// Appends one JSON object per line.
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub async fn open(id: &str, path: &str) -> Result<Self, AdapterError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AdapterError::Connectivity {
                kind: "output",
                id: id.to_string(),
                detail: format!("cannot open {path}: {e}"),
            })?;
        Ok(Self { file })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError> {
        let mut buf = String::new();
        for event in batch {
            buf.push_str(&event.to_json_line());
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes()).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.file.flush().await;
    }
}
