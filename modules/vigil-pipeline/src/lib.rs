//! The pipeline layer: component tables, graph building, and the runtime
//! that executes projects.
//!
//! A project is a directed acyclic graph of Inputs, Rulesets, and Outputs
//! joined by bounded channels. Channels and the component instances at
//! their ends are shared across projects through the PNS edge identity:
//! when two projects' walks produce the same PNS, they share one channel
//! and one instance, reference-counted so the last project to stop tears
//! the pipe down.

pub mod adapters;
pub mod channel;
pub mod config;
pub mod edge;
pub mod error;
pub mod graph;
pub mod pns;
pub mod project;
pub mod runtime;
pub mod sampler;
pub mod tables;

pub use channel::ChannelRegistry;
pub use edge::{AdapterErrorPolicy, Edge, NodeKind, NodeRef, ProjectSpec};
pub use error::{AdapterError, BuildError, PipelineError};
pub use graph::GraphPlan;
pub use pns::Pns;
pub use project::{Project, ProjectSnapshot, ProjectStatus, RestartReason};
pub use runtime::{PipelineRuntime, RuntimeStats};
pub use tables::ComponentTables;

use std::time::Duration;

/// Bounded capacity of every PNS channel; producers block when full.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on each graceful-drain hop during project stop.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum gap between consecutive drift-initiated restarts of a project.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(3);

/// Output batch buffer bounds.
pub const BATCH_MAX: usize = 100;
pub const BATCH_FLUSH: Duration = Duration::from_secs(1);

/// Events retained per output endpoint for introspection.
pub const SAMPLER_CAPACITY: usize = 64;
