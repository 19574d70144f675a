//! Plugin resolution.
//!
//! The scripting host that would evaluate user-supplied plugin code is an
//! external collaborator; the engine only honors its contract: a plugin is
//! a named predicate over already-resolved string arguments. The built-in
//! table below provides the predicates shipped with the hub, and plugin
//! *components* replicate an alias onto one of them (see
//! [`resolve_plugin_config`]).

use std::collections::HashMap;
use std::net::IpAddr;

/// A plugin predicate: resolved argument strings in, verdict out.
pub type PluginFn = fn(&[String]) -> Result<bool, String>;

#[derive(Clone)]
pub struct PluginSet {
    table: HashMap<String, PluginFn>,
}

impl PluginSet {
    /// The built-in predicates every node ships with.
    pub fn builtin() -> Self {
        let mut table: HashMap<String, PluginFn> = HashMap::new();
        table.insert("is_private_ip".to_string(), is_private_ip as PluginFn);
        table.insert("starts_with".to_string(), starts_with as PluginFn);
        table.insert("ends_with".to_string(), ends_with as PluginFn);
        table.insert("is_empty".to_string(), is_empty as PluginFn);
        Self { table }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Register `alias` as another name for the built-in `target`.
    /// Fails when the target does not exist.
    pub fn alias(&mut self, alias: &str, target: &str) -> Result<(), String> {
        let f = *self
            .table
            .get(target)
            .ok_or_else(|| format!("unknown builtin plugin: {target}"))?;
        self.table.insert(alias.to_string(), f);
        Ok(())
    }

    pub fn invoke(&self, name: &str, args: &[String]) -> Result<bool, String> {
        let f = self
            .table
            .get(name)
            .ok_or_else(|| format!("unknown plugin: {name}"))?;
        f(args)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parse a plugin component's raw config: `#` comment lines, then a single
/// `builtin: <name>` line naming the predicate the component aliases.
pub fn resolve_plugin_config(raw: &str) -> Result<String, String> {
    let mut target = None;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.strip_prefix("builtin:") {
            Some(name) if target.is_none() => target = Some(name.trim().to_string()),
            Some(_) => return Err("plugin config declares builtin more than once".to_string()),
            None => return Err(format!("unexpected line in plugin config: {line}")),
        }
    }
    target
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "plugin config missing builtin declaration".to_string())
}

fn one_arg<'a>(name: &str, args: &'a [String]) -> Result<&'a str, String> {
    match args {
        [a] => Ok(a),
        _ => Err(format!("{name} expects 1 argument, got {}", args.len())),
    }
}

fn two_args<'a>(name: &str, args: &'a [String]) -> Result<(&'a str, &'a str), String> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(format!("{name} expects 2 arguments, got {}", args.len())),
    }
}

fn is_private_ip(args: &[String]) -> Result<bool, String> {
    let raw = one_arg("is_private_ip", args)?;
    let addr: IpAddr = raw
        .parse()
        .map_err(|_| format!("not an IP address: {raw}"))?;
    Ok(match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    })
}

fn starts_with(args: &[String]) -> Result<bool, String> {
    let (s, prefix) = two_args("starts_with", args)?;
    Ok(s.starts_with(prefix))
}

fn ends_with(args: &[String]) -> Result<bool, String> {
    let (s, suffix) = two_args("ends_with", args)?;
    Ok(s.ends_with(suffix))
}

fn is_empty(args: &[String]) -> Result<bool, String> {
    Ok(one_arg("is_empty", args)?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_predicates() {
        let set = PluginSet::builtin();
        assert!(set
            .invoke("is_private_ip", &["10.1.2.3".to_string()])
            .unwrap());
        assert!(!set
            .invoke("is_private_ip", &["8.8.8.8".to_string()])
            .unwrap());
        assert!(set
            .invoke("starts_with", &["/bin/sh".to_string(), "/bin".to_string()])
            .unwrap());
        assert!(set.invoke("is_empty", &["".to_string()]).unwrap());
    }

    #[test]
    fn invoke_reports_arity_and_unknown_names() {
        let set = PluginSet::builtin();
        assert!(set.invoke("is_private_ip", &[]).is_err());
        assert!(set.invoke("no_such_plugin", &[]).is_err());
    }

    #[test]
    fn aliases_resolve_to_builtins() {
        let mut set = PluginSet::builtin();
        set.alias("internal_addr", "is_private_ip").unwrap();
        assert!(set
            .invoke("internal_addr", &["192.168.0.1".to_string()])
            .unwrap());
        assert!(set.alias("x", "missing").is_err());
    }

    #[test]
    fn plugin_config_resolution() {
        let raw = "# internal address matcher\nbuiltin: is_private_ip\n";
        assert_eq!(resolve_plugin_config(raw).unwrap(), "is_private_ip");
        assert!(resolve_plugin_config("").is_err());
        assert!(resolve_plugin_config("nonsense").is_err());
        assert!(resolve_plugin_config("builtin: a\nbuiltin: b").is_err());
    }
}
