//! Output instances: one per node PNS.
//!
//! The writer consumes its inbound channel, annotates each event with the
//! endpoint PNS and an emission timestamp, samples it, and forwards to
//! the sink through a bounded batch buffer. Write retries with backoff
//! are owned here; exhausted retries degrade (drop the batch, count it)
//! rather than wedge the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vigil_common::{Counter, Event, EMITTED_AT_KEY, PNS_KEY};

use crate::adapters::{build_sink, Sink};
use crate::config::OutputConfig;
use crate::edge::AdapterErrorPolicy;
use crate::error::AdapterError;
use crate::pns::Pns;
use crate::sampler::Sampler;
use crate::{BATCH_FLUSH, BATCH_MAX, DRAIN_TIMEOUT};

const WRITE_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

pub struct OutputInstance {
    pub output_id: String,
    pub pns: Pns,
    pub counter: Arc<Counter>,
    pub sampler: Arc<Sampler>,
    dropped: Arc<AtomicU64>,
    health: Arc<Mutex<Option<String>>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutputInstance {
    /// Verify connectivity (unless the sink is introspection-only) and
    /// spawn the writer. Under the degrade policy a failed check starts
    /// the instance anyway; writes retry against the broken sink.
    pub async fn start(
        output_id: &str,
        pns: Pns,
        config: &OutputConfig,
        policy: AdapterErrorPolicy,
        upstream: mpsc::Receiver<Event>,
    ) -> Result<Arc<Self>, AdapterError> {
        let check = !config.bypasses_connectivity();
        let (sink, health) = match build_sink(output_id, config, check).await {
            Ok(sink) => (sink, None),
            Err(e) if policy == AdapterErrorPolicy::Degrade => {
                warn!(output = output_id, error = %e, "Starting degraded; sink unreachable");
                let sink = build_sink(output_id, config, false).await?;
                (sink, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let instance = Arc::new(Self {
            output_id: output_id.to_string(),
            pns,
            counter: Arc::new(Counter::new()),
            sampler: Arc::new(Sampler::new()),
            dropped: Arc::new(AtomicU64::new(0)),
            health: Arc::new(Mutex::new(health)),
            stop: stop_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(write_loop(instance.clone(), sink, upstream, stop_rx));
        *instance.task.lock().expect("output instance poisoned") = Some(task);
        Ok(instance)
    }

    pub fn health(&self) -> Option<String> {
        self.health.lock().expect("output instance poisoned").clone()
    }

    /// Events dropped after exhausted write retries.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the writer to drain and close the sink; on timeout, force
    /// the drain and report unclean.
    pub async fn stop(&self) -> bool {
        let task = self.task.lock().expect("output instance poisoned").take();
        let Some(task) = task else { return true };

        match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    output = %self.output_id,
                    pns = %self.pns,
                    "Output drain timed out; force-closing"
                );
                let _ = self.stop.send(true);
                false
            }
        }
    }
}

async fn write_loop(
    instance: Arc<OutputInstance>,
    mut sink: Box<dyn Sink>,
    mut upstream: mpsc::Receiver<Event>,
    mut stop: watch::Receiver<bool>,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(BATCH_MAX);
    let mut flush_tick = tokio::time::interval(BATCH_FLUSH);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = upstream.recv() => match maybe {
                Some(event) => {
                    batch.push(annotate(&instance, event));
                    if batch.len() >= BATCH_MAX {
                        flush(&instance, sink.as_mut(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = flush_tick.tick() => {
                if !batch.is_empty() {
                    flush(&instance, sink.as_mut(), &mut batch).await;
                }
            }
            _ = stop.changed() => {
                while let Ok(event) = upstream.try_recv() {
                    batch.push(annotate(&instance, event));
                }
                break;
            }
        }
    }

    if !batch.is_empty() {
        flush(&instance, sink.as_mut(), &mut batch).await;
    }
    sink.close().await;
    debug!(output = %instance.output_id, pns = %instance.pns, "Writer drained");
}

fn annotate(instance: &OutputInstance, mut event: Event) -> Event {
    event.insert(PNS_KEY, Value::String(instance.pns.as_str().to_string()));
    event.insert(
        EMITTED_AT_KEY,
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    instance.counter.record(1);
    instance.sampler.observe(&event);
    event
}

/// Bounded retries with exponential backoff; an exhausted batch is dropped
/// and counted so a dead sink degrades the adapter instead of blocking
/// everything upstream of it.
async fn flush(instance: &OutputInstance, sink: &mut dyn Sink, batch: &mut Vec<Event>) {
    let mut last_error = None;
    for attempt in 0..WRITE_RETRIES {
        match sink.write(batch).await {
            Ok(()) => {
                if last_error.is_some() {
                    *instance.health.lock().expect("output instance poisoned") = None;
                }
                batch.clear();
                return;
            }
            Err(e) => {
                last_error = Some(e.to_string());
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| "unknown write failure".to_string());
    warn!(
        output = %instance.output_id,
        dropped = batch.len(),
        error = %error,
        "Write retries exhausted; dropping batch"
    );
    instance
        .dropped
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    *instance.health.lock().expect("output instance poisoned") = Some(error);
    batch.clear();
}
