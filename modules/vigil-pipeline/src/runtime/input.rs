//! Input instances: one per input component id, shared by every project
//! that references the input.
//!
//! Two tasks per instance: a reader pulling decoded events from the source
//! driver, and a fan-out pushing each event to every downstream channel
//! (backpressured). The downstream set changes as projects join and leave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_common::{Counter, Event};

use crate::adapters::{build_source, Source};
use crate::config::InputConfig;
use crate::edge::AdapterErrorPolicy;
use crate::error::AdapterError;
use crate::pns::Pns;
use crate::{CHANNEL_CAPACITY, DRAIN_TIMEOUT};

/// Gap between reconnect attempts when running degraded.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

type DownstreamMap = Arc<Mutex<HashMap<Pns, mpsc::Sender<Event>>>>;

pub struct InputInstance {
    pub id: String,
    pub counter: Arc<Counter>,
    downstream: DownstreamMap,
    stop: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    fanout: Mutex<Option<JoinHandle<()>>>,
    health: Mutex<Option<String>>,
}

impl InputInstance {
    /// Build the source driver and spawn the reader + fan-out pair. With
    /// the degrade policy, a connectivity failure starts the instance
    /// anyway and the reader keeps retrying the connection.
    pub async fn start(
        id: &str,
        config: &InputConfig,
        downstream: HashMap<Pns, mpsc::Sender<Event>>,
        policy: AdapterErrorPolicy,
    ) -> Result<Arc<Self>, AdapterError> {
        let (source, health) = match build_source(id, config).await {
            Ok(source) => (Some(source), None),
            Err(e) if policy == AdapterErrorPolicy::Degrade => {
                warn!(input = id, error = %e, "Starting degraded; will keep reconnecting");
                (None, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (feed_tx, feed_rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
        let downstream: DownstreamMap = Arc::new(Mutex::new(downstream));
        let counter = Arc::new(Counter::new());

        let instance = Arc::new(Self {
            id: id.to_string(),
            counter: counter.clone(),
            downstream: downstream.clone(),
            stop: stop_tx,
            reader: Mutex::new(None),
            fanout: Mutex::new(None),
            health: Mutex::new(health),
        });

        let reader = tokio::spawn(reader_loop(
            instance.clone(),
            config.clone(),
            source,
            feed_tx,
            stop_rx.clone(),
        ));
        let fanout = tokio::spawn(fanout_loop(
            instance.id.clone(),
            counter,
            downstream,
            feed_rx,
        ));
        *instance.reader.lock().expect("input instance poisoned") = Some(reader);
        *instance.fanout.lock().expect("input instance poisoned") = Some(fanout);

        Ok(instance)
    }

    pub fn add_downstream(&self, pns: Pns, tx: mpsc::Sender<Event>) {
        self.downstream
            .lock()
            .expect("input downstream poisoned")
            .entry(pns)
            .or_insert(tx);
    }

    pub fn remove_downstream(&self, pns: &Pns) {
        self.downstream
            .lock()
            .expect("input downstream poisoned")
            .remove(pns);
    }

    pub fn health(&self) -> Option<String> {
        self.health.lock().expect("input instance poisoned").clone()
    }

    fn set_health(&self, error: Option<String>) {
        *self.health.lock().expect("input instance poisoned") = error;
    }

    /// Quiesce the source, then wait for the fan-out to drain buffered
    /// events. Returns false if the drain timed out and was force-closed.
    pub async fn stop(&self) -> bool {
        let _ = self.stop.send(true);
        let reader = self.reader.lock().expect("input instance poisoned").take();
        let fanout = self.fanout.lock().expect("input instance poisoned").take();

        let mut clean = true;
        if let Some(handle) = reader {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(input = %self.id, "Reader did not stop in time; aborting");
                clean = false;
            }
        }
        if let Some(handle) = fanout {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(input = %self.id, "Fan-out drain timed out; force-closing");
                    clean = false;
                }
            }
        }
        if clean {
            info!(input = %self.id, total = self.counter.total(), "Input stopped");
        }
        clean
    }
}

async fn reader_loop(
    instance: Arc<InputInstance>,
    config: InputConfig,
    mut source: Option<Box<dyn Source>>,
    feed: mpsc::Sender<Event>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        // (Re)connect if we have no live source.
        let mut live = match source.take() {
            Some(live) => live,
            None => {
                let reconnect = tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => {
                        build_source(&instance.id, &config).await
                    }
                    _ = stop.changed() => return,
                };
                match reconnect {
                    Ok(live) => {
                        info!(input = %instance.id, "Source connected");
                        instance.set_health(None);
                        live
                    }
                    Err(e) => {
                        debug!(input = %instance.id, error = %e, "Reconnect failed");
                        instance.set_health(Some(e.to_string()));
                        continue;
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    live.close().await;
                    return;
                }
                next = live.next() => match next {
                    Ok(Some(event)) => {
                        // Blocks when the fan-out is saturated: backpressure.
                        if feed.send(event).await.is_err() {
                            live.close().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(input = %instance.id, "Source exhausted");
                        live.close().await;
                        return;
                    }
                    Err(e) => {
                        warn!(input = %instance.id, error = %e, "Source error; reconnecting");
                        instance.set_health(Some(e.to_string()));
                        live.close().await;
                        break;
                    }
                },
            }
        }
    }
}

async fn fanout_loop(
    id: String,
    counter: Arc<Counter>,
    downstream: DownstreamMap,
    mut feed: mpsc::Receiver<Event>,
) {
    while let Some(event) = feed.recv().await {
        counter.record(1);
        let senders: Vec<mpsc::Sender<Event>> = downstream
            .lock()
            .expect("input downstream poisoned")
            .values()
            .cloned()
            .collect();
        for tx in senders {
            // A closed channel here means its consumer is already gone;
            // stop ordering makes this a no-op rather than a loss.
            let _ = tx.send(event.clone()).await;
        }
    }
    // Feed closed: reader is done. Drop our senders so downstream
    // channels see end-of-stream.
    downstream
        .lock()
        .expect("input downstream poisoned")
        .clear();
    debug!(input = %id, "Fan-out drained");
}
