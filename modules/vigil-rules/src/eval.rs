//! Rule evaluation.

use serde_json::Value;

use vigil_common::Event;

use crate::model::{Check, CheckOp, Logic, PluginCall, Rule, Ruleset, RulesetKind};
use crate::plugin::PluginSet;

/// Result of evaluating one event: what to emit downstream, plus any
/// per-event failures (plugin errors, non-numeric comparisons). Failures
/// never abort evaluation; the caller counts and logs them.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub emitted: Vec<Event>,
    pub matched_rules: usize,
    pub errors: Vec<String>,
}

impl Ruleset {
    /// Evaluate one event. DETECTION emits one transformed copy per
    /// matching rule; EXCLUDE emits the unmodified event unless a rule
    /// matches.
    pub fn evaluate(&self, event: &Event, plugins: &PluginSet) -> Evaluation {
        let mut out = Evaluation::default();
        for rule in &self.rules {
            if !rule_matches(rule, event, plugins, &mut out.errors) {
                continue;
            }
            out.matched_rules += 1;
            match self.kind {
                RulesetKind::Detection => {
                    out.emitted.push(apply_transform(rule, event, plugins, &mut out.errors));
                }
                RulesetKind::Exclude => {
                    // One match is enough to drop the event.
                    return out;
                }
            }
        }
        if self.kind == RulesetKind::Exclude {
            out.emitted.push(event.clone());
        }
        out
    }
}

fn rule_matches(
    rule: &Rule,
    event: &Event,
    plugins: &PluginSet,
    errors: &mut Vec<String>,
) -> bool {
    let mut results = rule
        .checks
        .iter()
        .map(|check| check_matches(rule, check, event, plugins, errors));
    match rule.logic {
        Logic::And => results.all(|r| r),
        Logic::Or => results.any(|r| r),
    }
}

fn check_matches(
    rule: &Rule,
    check: &Check,
    event: &Event,
    plugins: &PluginSet,
    errors: &mut Vec<String>,
) -> bool {
    match check.op {
        CheckOp::IsNull => field_string(event, check).map_or(true, |s| s.is_empty()),
        CheckOp::NotNull => field_string(event, check).map_or(false, |s| !s.is_empty()),
        CheckOp::Plugin => {
            let call = match &check.call {
                Some(call) => call,
                None => return false,
            };
            invoke(call, rule, event, plugins, errors)
        }
        _ => {
            let actual = match field_string(event, check) {
                Some(s) => s,
                // Absent field: only negative checks can pass.
                None => return matches!(check.op, CheckOp::Neq | CheckOp::Ni),
            };
            let expected = resolve_value(&check.value, event);
            match check.op {
                CheckOp::Equ => actual == expected,
                CheckOp::Neq => actual != expected,
                CheckOp::Incl => actual.contains(&expected),
                CheckOp::Ni => !actual.contains(&expected),
                CheckOp::Regex => check
                    .regex
                    .as_ref()
                    .map(|re| re.is_match(&actual))
                    .unwrap_or(false),
                CheckOp::Mt | CheckOp::Lt => {
                    match (actual.parse::<f64>(), expected.parse::<f64>()) {
                        (Ok(a), Ok(b)) => {
                            if check.op == CheckOp::Mt {
                                a > b
                            } else {
                                a < b
                            }
                        }
                        _ => {
                            errors.push(format!(
                                "rule {}: non-numeric comparison on {}",
                                rule.id,
                                check.field.as_deref().unwrap_or("?")
                            ));
                            false
                        }
                    }
                }
                CheckOp::IsNull | CheckOp::NotNull | CheckOp::Plugin => unreachable!(),
            }
        }
    }
}

fn invoke(
    call: &PluginCall,
    rule: &Rule,
    event: &Event,
    plugins: &PluginSet,
    errors: &mut Vec<String>,
) -> bool {
    let args: Vec<String> = call
        .args
        .iter()
        .map(|arg| resolve_value(arg, event))
        .collect();
    match plugins.invoke(&call.name, &args) {
        Ok(verdict) => verdict,
        Err(e) => {
            errors.push(format!("rule {}: plugin {}: {e}", rule.id, call.name));
            false
        }
    }
}

fn apply_transform(
    rule: &Rule,
    event: &Event,
    plugins: &PluginSet,
    errors: &mut Vec<String>,
) -> Event {
    let mut emitted = event.clone();
    for append in &rule.appends {
        let value = resolve_value(&append.value, event);
        emitted.insert(append.field.clone(), Value::String(value));
    }
    for field in &rule.deletes {
        emitted.remove(field);
    }
    for action in &rule.actions {
        // Action verdicts are ignored; failures still surface.
        let _ = invoke(action, rule, event, plugins, errors);
    }
    emitted
}

/// Current string value of a check's field, if present.
fn field_string(event: &Event, check: &Check) -> Option<String> {
    let field = check.field.as_deref()?;
    event.get(field)?;
    event.get_str(field).ok()
}

/// Resolve `_$field` references against the event; anything else is
/// returned literally. A missing referenced field resolves to "".
fn resolve_value(raw: &str, event: &Event) -> String {
    match raw.strip_prefix("_$") {
        Some(field) => event.get_str(field).unwrap_or_default(),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ruleset;

    fn event(json: &str) -> Event {
        Event::from_json_line(json).unwrap()
    }

    fn detection(body: &str) -> Ruleset {
        Ruleset::parse(&format!(r#"<root type="DETECTION">{body}</root>"#)).unwrap()
    }

    #[test]
    fn equ_and_regex_checks() {
        let rs = detection(
            r#"<rule id="r1">
                 <check type="EQU" field="exe">/bin/sh</check>
                 <check type="REGEX" field="cmdline">curl\s+http</check>
               </rule>"#,
        );
        let plugins = PluginSet::builtin();

        let hit = event(r#"{"exe":"/bin/sh","cmdline":"curl http://x"}"#);
        assert_eq!(rs.evaluate(&hit, &plugins).emitted.len(), 1);

        let miss = event(r#"{"exe":"/bin/bash","cmdline":"curl http://x"}"#);
        assert!(rs.evaluate(&miss, &plugins).emitted.is_empty());
    }

    #[test]
    fn or_logic_needs_one_check() {
        let rs = Ruleset::parse(
            r#"<root type="DETECTION">
                 <rule id="r1" logic="OR">
                   <check type="EQU" field="a">1</check>
                   <check type="EQU" field="b">2</check>
                 </rule>
               </root>"#,
        )
        .unwrap();
        let plugins = PluginSet::builtin();
        assert_eq!(
            rs.evaluate(&event(r#"{"b":"2"}"#), &plugins).emitted.len(),
            1
        );
        assert!(rs
            .evaluate(&event(r#"{"b":"3"}"#), &plugins)
            .emitted
            .is_empty());
    }

    #[test]
    fn append_and_del_produce_a_new_map() {
        let rs = detection(
            r#"<rule id="r1">
                 <check type="NOTNULL" field="exe"/>
                 <append field="alert">true</append>
                 <append field="seen_exe">_$exe</append>
                 <del>secret</del>
               </rule>"#,
        );
        let plugins = PluginSet::builtin();
        let input = event(r#"{"exe":"/bin/sh","secret":"x"}"#);
        let out = rs.evaluate(&input, &plugins);
        let emitted = &out.emitted[0];
        assert_eq!(emitted.get_str("alert").unwrap(), "true");
        assert_eq!(emitted.get_str("seen_exe").unwrap(), "/bin/sh");
        assert!(!emitted.contains("secret"));
        // The input event is untouched.
        assert!(input.contains("secret"));
    }

    #[test]
    fn exclude_drops_matches_and_passes_the_rest() {
        let rs = Ruleset::parse(
            r#"<root type="EXCLUDE">
                 <rule id="noise">
                   <check type="EQU" field="level">debug</check>
                 </rule>
               </root>"#,
        )
        .unwrap();
        let plugins = PluginSet::builtin();
        assert!(rs
            .evaluate(&event(r#"{"level":"debug"}"#), &plugins)
            .emitted
            .is_empty());
        let passed = rs.evaluate(&event(r#"{"level":"warn"}"#), &plugins);
        assert_eq!(passed.emitted.len(), 1);
        assert_eq!(passed.emitted[0], event(r#"{"level":"warn"}"#));
    }

    #[test]
    fn plugin_checks_resolve_field_references() {
        let rs = detection(
            r#"<rule id="r1">
                 <check type="PLUGIN">is_private_ip(_$src_ip)</check>
               </rule>"#,
        );
        let plugins = PluginSet::builtin();
        assert_eq!(
            rs.evaluate(&event(r#"{"src_ip":"10.0.0.9"}"#), &plugins)
                .emitted
                .len(),
            1
        );
        assert!(rs
            .evaluate(&event(r#"{"src_ip":"1.1.1.1"}"#), &plugins)
            .emitted
            .is_empty());
    }

    #[test]
    fn plugin_errors_are_collected_not_fatal() {
        let rs = detection(
            r#"<rule id="r1" logic="OR">
                 <check type="PLUGIN">is_private_ip(_$missing)</check>
                 <check type="EQU" field="keep">yes</check>
               </rule>"#,
        );
        let plugins = PluginSet::builtin();
        let out = rs.evaluate(&event(r#"{"keep":"yes"}"#), &plugins);
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.errors.len(), 1, "errors: {:?}", out.errors);
    }

    #[test]
    fn numeric_comparisons() {
        let rs = detection(
            r#"<rule id="r1">
                 <check type="MT" field="score">5</check>
                 <check type="LT" field="score">10</check>
               </rule>"#,
        );
        let plugins = PluginSet::builtin();
        assert_eq!(
            rs.evaluate(&event(r#"{"score":7}"#), &plugins).emitted.len(),
            1
        );
        assert!(rs
            .evaluate(&event(r#"{"score":12}"#), &plugins)
            .emitted
            .is_empty());
        let bad = rs.evaluate(&event(r#"{"score":"high"}"#), &plugins);
        assert!(bad.emitted.is_empty());
        assert!(!bad.errors.is_empty());
    }
}
