//! Ruleset instances: one per node PNS, shared across projects whose
//! walks coincide there.
//!
//! The evaluator consumes its inbound channel and fans every emitted
//! event out to each downstream edge. Its natural exit is upstream
//! close: the stop signal exists only to force a bounded drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vigil_common::{Counter, Event};
use vigil_rules::{PluginSet, Ruleset};

use crate::pns::Pns;
use crate::DRAIN_TIMEOUT;

type DownstreamMap = Arc<Mutex<HashMap<Pns, mpsc::Sender<Event>>>>;

pub struct RulesetInstance {
    pub ruleset_id: String,
    pub pns: Pns,
    pub processed: Arc<Counter>,
    pub matched: Arc<Counter>,
    pub emitted: Arc<Counter>,
    error_count: Arc<AtomicU64>,
    downstream: DownstreamMap,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RulesetInstance {
    pub fn start(
        ruleset_id: &str,
        pns: Pns,
        ruleset: Ruleset,
        plugins: Arc<PluginSet>,
        upstream: mpsc::Receiver<Event>,
        downstream: HashMap<Pns, mpsc::Sender<Event>>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let downstream: DownstreamMap = Arc::new(Mutex::new(downstream));

        let instance = Arc::new(Self {
            ruleset_id: ruleset_id.to_string(),
            pns,
            processed: Arc::new(Counter::new()),
            matched: Arc::new(Counter::new()),
            emitted: Arc::new(Counter::new()),
            error_count: Arc::new(AtomicU64::new(0)),
            downstream: downstream.clone(),
            stop: stop_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(evaluate_loop(
            instance.clone(),
            ruleset,
            plugins,
            upstream,
            stop_rx,
        ));
        *instance.task.lock().expect("ruleset instance poisoned") = Some(task);
        instance
    }

    pub fn ensure_downstream(&self, pns: Pns, tx: mpsc::Sender<Event>) {
        self.downstream
            .lock()
            .expect("ruleset downstream poisoned")
            .entry(pns)
            .or_insert(tx);
    }

    pub fn remove_downstream(&self, pns: &Pns) {
        self.downstream
            .lock()
            .expect("ruleset downstream poisoned")
            .remove(pns);
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Wait for the evaluator to drain and exit. The normal trigger is
    /// upstream close; on timeout the stop signal forces the issue, and
    /// as a last resort the task is aborted.
    pub async fn stop(&self) -> bool {
        let task = self.task.lock().expect("ruleset instance poisoned").take();
        let Some(task) = task else { return true };

        match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    ruleset = %self.ruleset_id,
                    pns = %self.pns,
                    "Ruleset drain timed out; force-closing"
                );
                let _ = self.stop.send(true);
                false
            }
        }
    }
}

async fn evaluate_loop(
    instance: Arc<RulesetInstance>,
    ruleset: Ruleset,
    plugins: Arc<PluginSet>,
    mut upstream: mpsc::Receiver<Event>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = upstream.recv() => match maybe {
                Some(event) => process(&instance, &ruleset, &plugins, event).await,
                None => break,
            },
            _ = stop.changed() => {
                // Forced drain: consume whatever is already buffered, then go.
                while let Ok(event) = upstream.try_recv() {
                    process(&instance, &ruleset, &plugins, event).await;
                }
                break;
            }
        }
    }
    // Drop our senders so downstream channels see end-of-stream.
    instance
        .downstream
        .lock()
        .expect("ruleset downstream poisoned")
        .clear();
    debug!(ruleset = %instance.ruleset_id, pns = %instance.pns, "Evaluator drained");
}

async fn process(
    instance: &RulesetInstance,
    ruleset: &Ruleset,
    plugins: &PluginSet,
    event: Event,
) {
    instance.processed.record(1);
    let evaluation = ruleset.evaluate(&event, plugins);

    for error in &evaluation.errors {
        instance.error_count.fetch_add(1, Ordering::Relaxed);
        warn!(ruleset = %instance.ruleset_id, error = %error, "Rule evaluation error");
    }
    if evaluation.matched_rules > 0 {
        instance.matched.record(evaluation.matched_rules as u64);
    }
    if evaluation.emitted.is_empty() {
        return;
    }

    instance.emitted.record(evaluation.emitted.len() as u64);
    let senders: Vec<mpsc::Sender<Event>> = instance
        .downstream
        .lock()
        .expect("ruleset downstream poisoned")
        .values()
        .cloned()
        .collect();
    for emitted in evaluation.emitted {
        for tx in &senders {
            let _ = tx.send(emitted.clone()).await;
        }
    }
}
