//! Per-endpoint event samplers: a small ring of recently emitted events,
//! shared across projects exactly like the channel they observe.

use std::collections::VecDeque;
use std::sync::Mutex;

use vigil_common::Event;

use crate::SAMPLER_CAPACITY;

#[derive(Debug)]
pub struct Sampler {
    ring: Mutex<VecDeque<Event>>,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(SAMPLER_CAPACITY)),
        }
    }

    pub fn observe(&self, event: &Event) {
        let mut ring = self.ring.lock().expect("sampler poisoned");
        if ring.len() == SAMPLER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.ring
            .lock()
            .expect("sampler poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("sampler poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_capacity() {
        let sampler = Sampler::new();
        for i in 0..(SAMPLER_CAPACITY + 10) {
            let mut ev = Event::new();
            ev.insert("n", i as i64);
            sampler.observe(&ev);
        }
        let snap = sampler.snapshot();
        assert_eq!(snap.len(), SAMPLER_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(snap[0].get_i64("n").unwrap(), 10);
    }
}
