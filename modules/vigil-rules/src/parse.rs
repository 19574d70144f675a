//! XML parsing and structural verification of ruleset documents.
//!
//! Grammar:
//!
//! ```xml
//! <root type="DETECTION" author="ops">
//!     <rule id="shell_exec" logic="OR">
//!         <check type="EQU" field="exe">/bin/sh</check>
//!         <check type="REGEX" field="cmdline">curl\s+http</check>
//!         <check type="PLUGIN">is_private_ip(_$src_ip)</check>
//!         <append field="alert">true</append>
//!         <del>raw_payload,tmp</del>
//!         <plugin>tag_host(_$hostname)</plugin>
//!     </rule>
//! </root>
//! ```
//!
//! Every structural error carries the line/column of the offending
//! construct so operators can fix documents without guessing.

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use regex::Regex;

use crate::error::{line_col, VerifyError};
use crate::model::{Append, Check, CheckOp, Logic, PluginCall, Rule, Ruleset, RulesetKind};
use crate::plugin::PluginSet;

impl Ruleset {
    /// Parse a raw XML document. Structural errors are line-annotated.
    pub fn parse(raw: &str) -> Result<Ruleset, VerifyError> {
        Parser::new(raw).run()
    }

    /// Full verification: structure plus plugin-name resolution.
    pub fn verify(raw: &str, plugins: &PluginSet) -> Result<Ruleset, VerifyError> {
        let ruleset = Ruleset::parse(raw)?;
        for name in ruleset.plugin_names() {
            if !plugins.contains(name) {
                return Err(VerifyError::new(
                    1,
                    1,
                    format!("unknown plugin: {name}"),
                ));
            }
        }
        Ok(ruleset)
    }
}

struct Parser<'a> {
    raw: &'a str,
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        let mut reader = Reader::from_reader(raw.as_bytes());
        reader.config_mut().trim_text(true);
        Self { raw, reader }
    }

    fn err_here(&self, message: impl Into<String>) -> VerifyError {
        let (line, column) = line_col(self.raw, self.reader.buffer_position() as usize);
        VerifyError::new(line, column, message)
    }

    fn attr(&self, start: &BytesStart<'_>, name: &str) -> Result<Option<String>, VerifyError> {
        for attr in start.attributes() {
            let attr = attr.map_err(|e| self.err_here(format!("bad attribute: {e}")))?;
            if attr.key.as_ref() == name.as_bytes() {
                let value = attr
                    .unescape_value()
                    .map_err(|e| self.err_here(format!("bad attribute value: {e}")))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    }

    fn run(mut self) -> Result<Ruleset, VerifyError> {
        let mut ruleset: Option<Ruleset> = None;
        loop {
            let event = self
                .reader
                .read_event()
                .map_err(|e| self.err_here(format!("malformed XML: {e}")))?;
            match event {
                XmlEvent::Decl(_) | XmlEvent::Comment(_) => {}
                XmlEvent::Start(start) if start.name().as_ref() == b"root" => {
                    if ruleset.is_some() {
                        return Err(self.err_here("multiple <root> elements"));
                    }
                    ruleset = Some(self.parse_root(&start)?);
                }
                XmlEvent::Eof => break,
                XmlEvent::Text(t) if t.unescape().map(|s| s.trim().is_empty()).unwrap_or(false) => {}
                _ => return Err(self.err_here("expected a single <root> element")),
            }
        }
        ruleset.ok_or_else(|| VerifyError::new(1, 1, "empty document: missing <root>"))
    }

    fn parse_root(&mut self, start: &BytesStart<'_>) -> Result<Ruleset, VerifyError> {
        let kind = match self.attr(start, "type")?.as_deref() {
            Some("DETECTION") => RulesetKind::Detection,
            Some("EXCLUDE") => RulesetKind::Exclude,
            Some(other) => {
                return Err(self.err_here(format!(
                    "root type must be DETECTION or EXCLUDE, got {other}"
                )))
            }
            None => return Err(self.err_here("root element missing type attribute")),
        };
        let author = self.attr(start, "author")?;

        let mut rules = Vec::new();
        loop {
            let event = self
                .reader
                .read_event()
                .map_err(|e| self.err_here(format!("malformed XML: {e}")))?;
            match event {
                XmlEvent::Start(el) if el.name().as_ref() == b"rule" => {
                    rules.push(self.parse_rule(&el)?);
                }
                XmlEvent::End(end) if end.name().as_ref() == b"root" => break,
                XmlEvent::Comment(_) => {}
                XmlEvent::Text(t)
                    if t.unescape().map(|s| s.trim().is_empty()).unwrap_or(false) => {}
                XmlEvent::Eof => return Err(self.err_here("unexpected end of document")),
                XmlEvent::Start(el) | XmlEvent::Empty(el) => {
                    let name = String::from_utf8_lossy(el.name().as_ref()).into_owned();
                    return Err(self.err_here(format!("unexpected element <{name}> under <root>")));
                }
                _ => return Err(self.err_here("unexpected content under <root>")),
            }
        }

        if rules.is_empty() {
            return Err(self.err_here("ruleset has no rules"));
        }
        Ok(Ruleset {
            kind,
            author,
            rules,
        })
    }

    fn parse_rule(&mut self, start: &BytesStart<'_>) -> Result<Rule, VerifyError> {
        let id = self
            .attr(start, "id")?
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| self.err_here("rule missing id attribute"))?;
        let logic = match self.attr(start, "logic")?.as_deref() {
            None | Some("AND") => Logic::And,
            Some("OR") => Logic::Or,
            Some(other) => {
                return Err(self.err_here(format!("rule logic must be AND or OR, got {other}")))
            }
        };

        let mut rule = Rule {
            id,
            logic,
            checks: Vec::new(),
            appends: Vec::new(),
            deletes: Vec::new(),
            actions: Vec::new(),
        };

        loop {
            let event = self
                .reader
                .read_event()
                .map_err(|e| self.err_here(format!("malformed XML: {e}")))?;
            match event {
                XmlEvent::Start(el) => {
                    let name = el.name().as_ref().to_vec();
                    let text = self.element_text(&name)?;
                    self.add_child(&mut rule, &el, &name, text)?;
                }
                XmlEvent::Empty(el) => {
                    let name = el.name().as_ref().to_vec();
                    self.add_child(&mut rule, &el, &name, String::new())?;
                }
                XmlEvent::End(end) if end.name().as_ref() == b"rule" => break,
                XmlEvent::Comment(_) => {}
                XmlEvent::Text(t)
                    if t.unescape().map(|s| s.trim().is_empty()).unwrap_or(false) => {}
                XmlEvent::Eof => return Err(self.err_here("unexpected end of document")),
                _ => return Err(self.err_here("unexpected content under <rule>")),
            }
        }

        if rule.checks.is_empty() {
            return Err(self.err_here(format!("rule {} has no checks", rule.id)));
        }
        Ok(rule)
    }

    /// Read the text content of the element just opened and its end tag.
    fn element_text(&mut self, name: &[u8]) -> Result<String, VerifyError> {
        let mut text = String::new();
        loop {
            let event = self
                .reader
                .read_event()
                .map_err(|e| self.err_here(format!("malformed XML: {e}")))?;
            match event {
                XmlEvent::Text(t) => {
                    text.push_str(
                        &t.unescape()
                            .map_err(|e| self.err_here(format!("bad text: {e}")))?,
                    );
                }
                XmlEvent::CData(c) => {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
                XmlEvent::End(end) if end.name().as_ref() == name => break,
                XmlEvent::Eof => return Err(self.err_here("unexpected end of document")),
                _ => {
                    let name = String::from_utf8_lossy(name).into_owned();
                    return Err(self.err_here(format!("<{name}> must contain only text")));
                }
            }
        }
        Ok(text.trim().to_string())
    }

    fn add_child(
        &mut self,
        rule: &mut Rule,
        el: &BytesStart<'_>,
        name: &[u8],
        text: String,
    ) -> Result<(), VerifyError> {
        match name {
            b"check" => {
                let check = self.parse_check(el, text)?;
                rule.checks.push(check);
            }
            b"append" => {
                let field = self
                    .attr(el, "field")?
                    .filter(|f| !f.trim().is_empty())
                    .ok_or_else(|| self.err_here("append missing field attribute"))?;
                rule.appends.push(Append { field, value: text });
            }
            b"del" => {
                if text.trim().is_empty() {
                    return Err(self.err_here("del element is empty"));
                }
                rule.deletes.extend(
                    text.split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty()),
                );
            }
            b"plugin" => {
                let call = parse_plugin_call(&text)
                    .map_err(|msg| self.err_here(msg))?;
                rule.actions.push(call);
            }
            other => {
                let name = String::from_utf8_lossy(other).into_owned();
                return Err(self.err_here(format!("unexpected element <{name}> under <rule>")));
            }
        }
        Ok(())
    }

    fn parse_check(&mut self, el: &BytesStart<'_>, text: String) -> Result<Check, VerifyError> {
        let op = match self.attr(el, "type")?.as_deref() {
            Some("EQU") => CheckOp::Equ,
            Some("NEQ") => CheckOp::Neq,
            Some("INCL") => CheckOp::Incl,
            Some("NI") => CheckOp::Ni,
            Some("REGEX") => CheckOp::Regex,
            Some("MT") => CheckOp::Mt,
            Some("LT") => CheckOp::Lt,
            Some("ISNULL") => CheckOp::IsNull,
            Some("NOTNULL") => CheckOp::NotNull,
            Some("PLUGIN") => CheckOp::Plugin,
            Some(other) => {
                return Err(self.err_here(format!("unknown check type: {other}")))
            }
            None => return Err(self.err_here("check missing type attribute")),
        };

        let field = self.attr(el, "field")?;
        if op != CheckOp::Plugin && field.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(self.err_here("check missing field attribute"));
        }
        if matches!(
            op,
            CheckOp::Equ | CheckOp::Neq | CheckOp::Incl | CheckOp::Ni | CheckOp::Mt | CheckOp::Lt
        ) && text.is_empty()
        {
            return Err(self.err_here("check has no comparison value"));
        }

        let regex = if op == CheckOp::Regex {
            Some(
                Regex::new(&text)
                    .map_err(|e| self.err_here(format!("invalid regex: {e}")))?,
            )
        } else {
            None
        };

        let call = if op == CheckOp::Plugin {
            Some(parse_plugin_call(&text).map_err(|msg| self.err_here(msg))?)
        } else {
            None
        };

        Ok(Check {
            op,
            field,
            value: text,
            regex,
            call,
        })
    }
}

/// Parse `name(arg1, arg2)` or bare `name`.
pub(crate) fn parse_plugin_call(text: &str) -> Result<PluginCall, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("plugin call is empty".to_string());
    }
    let (name, args) = match text.split_once('(') {
        Some((name, rest)) => {
            let rest = rest
                .strip_suffix(')')
                .ok_or_else(|| format!("plugin call missing closing paren: {text}"))?;
            let args = if rest.trim().is_empty() {
                Vec::new()
            } else {
                rest.split(',').map(|a| a.trim().to_string()).collect()
            };
            (name.trim(), args)
        }
        None => (text, Vec::new()),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid plugin name: {name}"));
    }
    Ok(PluginCall {
        name: name.to_string(),
        args,
    })
}
