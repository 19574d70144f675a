//! Verification contract: structural errors carry usable line/column
//! positions, and plugin references resolve against the plugin table.

use vigil_rules::{PluginSet, Ruleset, RulesetKind};

#[test]
fn well_formed_document_parses() {
    let rs = Ruleset::parse(
        r#"<root type="DETECTION" author="secops">
    <rule id="shell">
        <check type="EQU" field="exe">/bin/sh</check>
        <append field="alert">true</append>
    </rule>
    <rule id="scan" logic="OR">
        <check type="INCL" field="cmdline">nmap</check>
        <check type="INCL" field="cmdline">masscan</check>
    </rule>
</root>"#,
    )
    .unwrap();
    assert_eq!(rs.kind, RulesetKind::Detection);
    assert_eq!(rs.author.as_deref(), Some("secops"));
    assert_eq!(rs.rules.len(), 2);
    assert_eq!(rs.rules[1].checks.len(), 2);
}

#[test]
fn malformed_xml_is_positioned() {
    let err = Ruleset::parse(
        "<root type=\"DETECTION\">\n  <rule id=\"r\">\n    <check type=\"EQU\" field=\"a\">v</chk>\n  </rule>\n</root>",
    )
    .unwrap_err();
    assert!(err.line >= 3, "error should point into the document: {err}");
}

#[test]
fn unknown_check_type_is_rejected() {
    let err = Ruleset::parse(
        r#"<root type="DETECTION">
  <rule id="r">
    <check type="FUZZY" field="a">v</check>
  </rule>
</root>"#,
    )
    .unwrap_err();
    assert!(err.message.contains("unknown check type"), "{err}");
    assert_eq!(err.line, 3);
}

#[test]
fn missing_rule_id_is_rejected() {
    let err = Ruleset::parse(
        r#"<root type="DETECTION">
  <rule>
    <check type="EQU" field="a">v</check>
  </rule>
</root>"#,
    )
    .unwrap_err();
    assert!(err.message.contains("missing id"), "{err}");
}

#[test]
fn bad_regex_is_rejected_at_parse_time() {
    let err = Ruleset::parse(
        r#"<root type="DETECTION">
  <rule id="r">
    <check type="REGEX" field="a">([unclosed</check>
  </rule>
</root>"#,
    )
    .unwrap_err();
    assert!(err.message.contains("invalid regex"), "{err}");
}

#[test]
fn root_type_is_mandatory() {
    let err = Ruleset::parse(r#"<root><rule id="r"><check type="NOTNULL" field="a"/></rule></root>"#)
        .unwrap_err();
    assert!(err.message.contains("type"), "{err}");
}

#[test]
fn empty_rulesets_are_rejected() {
    assert!(Ruleset::parse(r#"<root type="DETECTION"></root>"#).is_err());
    assert!(Ruleset::parse("").is_err());
}

#[test]
fn verify_resolves_plugin_names() {
    let raw = r#"<root type="DETECTION">
  <rule id="r">
    <check type="PLUGIN">is_private_ip(_$ip)</check>
  </rule>
</root>"#;
    assert!(Ruleset::verify(raw, &PluginSet::builtin()).is_ok());

    let raw_bad = raw.replace("is_private_ip", "no_such_plugin");
    let err = Ruleset::verify(&raw_bad, &PluginSet::builtin()).unwrap_err();
    assert!(err.message.contains("unknown plugin"), "{err}");
}

#[test]
fn del_lists_split_on_commas() {
    let rs = Ruleset::parse(
        r#"<root type="DETECTION">
  <rule id="r">
    <check type="NOTNULL" field="a"/>
    <del>one, two,three</del>
  </rule>
</root>"#,
    )
    .unwrap();
    assert_eq!(rs.rules[0].deletes, vec!["one", "two", "three"]);
}
