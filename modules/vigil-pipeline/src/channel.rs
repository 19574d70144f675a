//! The channel registry: one bounded channel per PNS, reference-counted.
//!
//! A channel is created on first acquire and torn down when the last
//! holder releases it. The registry keeps a sender clone per entry so
//! late joiners can bind; the single receiver is claimed by the consumer
//! instance at the edge's head. Entry teardown is deferred to the caller
//! so the actual close (dropping senders) happens outside the lock and
//! after stop ordering has quiesced the producers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use vigil_common::Event;

use crate::pns::Pns;
use crate::CHANNEL_CAPACITY;

pub struct ChannelEntry {
    pub tx: mpsc::Sender<Event>,
    rx: Option<mpsc::Receiver<Event>>,
    refs: usize,
}

#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<HashMap<Pns, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pns, ChannelEntry>> {
        self.inner.lock().expect("channel registry poisoned")
    }

    /// Join (or create) the channel for `pns`, bumping its refcount, and
    /// return a sender for the producer side.
    pub fn acquire(&self, pns: &Pns) -> mpsc::Sender<Event> {
        let mut map = self.lock();
        let entry = map.entry(pns.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            ChannelEntry {
                tx,
                rx: Some(rx),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.tx.clone()
    }

    /// Claim the consumer side. Each channel has exactly one consumer; the
    /// second claim returns None.
    pub fn take_receiver(&self, pns: &Pns) -> Option<mpsc::Receiver<Event>> {
        self.lock().get_mut(pns).and_then(|entry| entry.rx.take())
    }

    pub fn sender(&self, pns: &Pns) -> Option<mpsc::Sender<Event>> {
        self.lock().get(pns).map(|entry| entry.tx.clone())
    }

    /// Drop one reference. At zero the entry is removed and handed back to
    /// the caller, which drops it (and with it the registry's sender) once
    /// producers have been detached.
    pub fn release(&self, pns: &Pns) -> Option<ChannelEntry> {
        let mut map = self.lock();
        let entry = map.get_mut(pns)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            map.remove(pns)
        } else {
            None
        }
    }

    pub fn refcount(&self, pns: &Pns) -> usize {
        self.lock().get(pns).map(|e| e.refs).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{NodeKind, NodeRef};

    fn pns(s: &str) -> Pns {
        Pns::root(&NodeRef::new(NodeKind::Input, s))
    }

    #[tokio::test]
    async fn acquire_creates_once_and_counts_refs() {
        let reg = ChannelRegistry::new();
        let p = pns("a");
        let tx1 = reg.acquire(&p);
        let tx2 = reg.acquire(&p);
        assert_eq!(reg.refcount(&p), 2);
        assert_eq!(reg.len(), 1);
        assert!(tx1.same_channel(&tx2));
    }

    #[tokio::test]
    async fn single_consumer_per_channel() {
        let reg = ChannelRegistry::new();
        let p = pns("a");
        let _tx = reg.acquire(&p);
        assert!(reg.take_receiver(&p).is_some());
        assert!(reg.take_receiver(&p).is_none());
    }

    #[tokio::test]
    async fn release_removes_only_at_zero() {
        let reg = ChannelRegistry::new();
        let p = pns("a");
        let _tx = reg.acquire(&p);
        let _tx2 = reg.acquire(&p);

        assert!(reg.release(&p).is_none());
        assert_eq!(reg.refcount(&p), 1);

        let entry = reg.release(&p);
        assert!(entry.is_some());
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn channel_closes_when_entry_and_producers_drop() {
        let reg = ChannelRegistry::new();
        let p = pns("a");
        let tx = reg.acquire(&p);
        let mut rx = reg.take_receiver(&p).unwrap();

        tx.send(Event::new()).await.unwrap();
        let entry = reg.release(&p).unwrap();
        drop(entry);
        drop(tx);

        // Buffered event still delivered, then the channel reports closed.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
