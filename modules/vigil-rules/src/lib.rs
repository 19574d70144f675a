//! The rules engine: XML rulesets evaluated against pipeline events.
//!
//! A ruleset is either DETECTION (emit events that match a rule, transformed
//! by that rule) or EXCLUDE (drop events that match, pass the rest through).
//! The rest of the platform treats this crate as a black box with three
//! operations: parse/verify a raw XML document, evaluate one event into zero
//! or more derived events, and resolve plugin references.
//!
//! Evaluation is pure: no I/O, no blocking, no retained state between
//! events. Per-event failures (a plugin rejecting its arguments, a
//! non-numeric comparison) are reported alongside the emitted events and
//! never abort evaluation.

pub mod error;
pub mod eval;
pub mod model;
pub mod parse;
pub mod plugin;

pub use error::VerifyError;
pub use eval::Evaluation;
pub use model::{Append, Check, CheckOp, Logic, PluginCall, Rule, Ruleset, RulesetKind};
pub use plugin::{resolve_plugin_config, PluginSet};
