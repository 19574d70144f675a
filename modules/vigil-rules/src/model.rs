//! Parsed ruleset programs.

use regex::Regex;

/// What the ruleset does with matching events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesetKind {
    /// Emit events that match any rule, transformed by that rule.
    Detection,
    /// Drop events that match any rule; pass everything else through.
    Exclude,
}

/// How a rule's check nodes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// Condition operators available in `<check>` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOp {
    /// Exact string equality.
    Equ,
    /// Negated equality.
    Neq,
    /// Substring containment.
    Incl,
    /// Negated containment.
    Ni,
    /// Regular-expression match.
    Regex,
    /// Numeric greater-than.
    Mt,
    /// Numeric less-than.
    Lt,
    /// Field absent or empty.
    IsNull,
    /// Field present and non-empty.
    NotNull,
    /// Delegate to a named plugin.
    Plugin,
}

/// A named plugin invocation, e.g. `is_private_ip(_$src_ip)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginCall {
    pub name: String,
    pub args: Vec<String>,
}

/// One condition node.
#[derive(Debug, Clone)]
pub struct Check {
    pub op: CheckOp,
    /// Absent only for `PLUGIN` checks.
    pub field: Option<String>,
    /// Raw comparison value (may contain `_$field` references).
    pub value: String,
    /// Compiled at parse time for `REGEX` checks.
    pub regex: Option<Regex>,
    /// Parsed call for `PLUGIN` checks.
    pub call: Option<PluginCall>,
}

/// A field to add or overwrite on emitted copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Append {
    pub field: String,
    pub value: String,
}

/// One rule: conditions plus the transform applied on match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub logic: Logic,
    pub checks: Vec<Check>,
    pub appends: Vec<Append>,
    pub deletes: Vec<String>,
    /// Action plugins run (for their side effects on counters/log) on match.
    pub actions: Vec<PluginCall>,
}

/// A complete parsed ruleset document.
#[derive(Debug, Clone)]
pub struct Ruleset {
    pub kind: RulesetKind,
    pub author: Option<String>,
    pub rules: Vec<Rule>,
}

impl Ruleset {
    /// Every plugin name the document references, checks and actions alike.
    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().flat_map(|rule| {
            rule.checks
                .iter()
                .filter_map(|check| check.call.as_ref())
                .chain(rule.actions.iter())
                .map(|call| call.name.as_str())
        })
    }
}
