//! Shared vocabulary for the Vigil Hub platform: the event model, component
//! identities, runtime counters, and node-level configuration.
//!
//! Everything here is plain data: no I/O, no async. The heavier machinery
//! (registry, rules engine, pipeline runtime, cluster) builds on these types.

pub mod component;
pub mod config;
pub mod counters;
pub mod error;
pub mod event;

pub use component::{ComponentKey, ComponentType};
pub use config::NodeConfig;
pub use counters::Counter;
pub use error::{ConfigError, EventError};
pub use event::{Event, EMITTED_AT_KEY, PNS_KEY};
