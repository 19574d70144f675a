//! In-process message bus for tests, demos, and single-node smoke runs.
//!
//! Memory inputs attach to a named queue on the process-wide bus; tests
//! inject events through [`bus()`]. Memory outputs append delivered events
//! to a named store the test can drain. Like a real message bus, events
//! injected before any consumer attaches are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use vigil_common::Event;

use crate::error::AdapterError;
use crate::adapters::{Sink, Source};

pub struct MemoryBus {
    sources: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
    sinks: Mutex<HashMap<String, Arc<Mutex<Vec<Event>>>>>,
}

/// The process-wide bus.
pub fn bus() -> &'static MemoryBus {
    static BUS: OnceLock<MemoryBus> = OnceLock::new();
    BUS.get_or_init(|| MemoryBus {
        sources: Mutex::new(HashMap::new()),
        sinks: Mutex::new(HashMap::new()),
    })
}

impl MemoryBus {
    /// Inject an event into a queue. Returns false when no consumer is
    /// attached (the event is dropped, as on a real bus with no group).
    pub fn inject(&self, queue: &str, event: Event) -> bool {
        let sources = self.sources.lock().expect("memory bus poisoned");
        match sources.get(queue) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn attach_source(&self, queue: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sources
            .lock()
            .expect("memory bus poisoned")
            .insert(queue.to_string(), tx);
        rx
    }

    fn sink_store(&self, name: &str) -> Arc<Mutex<Vec<Event>>> {
        self.sinks
            .lock()
            .expect("memory bus poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Take everything a memory output has delivered so far.
    pub fn drain_sink(&self, name: &str) -> Vec<Event> {
        let store = self.sink_store(name);
        let mut events = store.lock().expect("memory bus poisoned");
        std::mem::take(&mut *events)
    }

    /// Number of events currently held by a memory output store.
    pub fn sink_len(&self, name: &str) -> usize {
        self.sink_store(name).lock().expect("memory bus poisoned").len()
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl MemorySource {
    pub fn attach(queue: &str) -> Self {
        Self {
            rx: bus().attach_source(queue),
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn next(&mut self) -> Result<Option<Event>, AdapterError> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemorySink {
    store: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn attach(name: &str) -> Self {
        Self {
            store: bus().sink_store(name),
        }
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, batch: &[Event]) -> Result<(), AdapterError> {
        self.store
            .lock()
            .expect("memory bus poisoned")
            .extend(batch.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_reaches_attached_source() {
        let mut source = MemorySource::attach("q_mem_test");
        let mut ev = Event::new();
        ev.insert("n", 1);
        assert!(bus().inject("q_mem_test", ev));
        assert!(source.next().await.unwrap().is_some());
    }

    #[test]
    fn inject_without_consumer_is_dropped() {
        assert!(!bus().inject("q_nobody_listens", Event::new()));
    }

    #[tokio::test]
    async fn sink_collects_and_drains() {
        let mut sink = MemorySink::attach("s_mem_test");
        sink.write(&[Event::new(), Event::new()]).await.unwrap();
        assert_eq!(bus().sink_len("s_mem_test"), 2);
        assert_eq!(bus().drain_sink("s_mem_test").len(), 2);
        assert_eq!(bus().sink_len("s_mem_test"), 0);
    }
}
