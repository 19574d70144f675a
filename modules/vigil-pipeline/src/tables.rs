//! Component tables: the replicated raw-config store plus leader-side
//! pending drafts.
//!
//! Two tables per component type: `live` (authoritative, replicated by the
//! instruction log) and `pending` (leader-only drafts awaiting publish).
//! The mutation helpers never touch external storage; persisting is the
//! leader's job through the registry. Lookups are read-mostly; holders of
//! the inner locks never perform I/O.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use vigil_common::{ComponentKey, ComponentType};
use vigil_rules::{resolve_plugin_config, PluginSet, Ruleset};

use crate::config::{InputConfig, OutputConfig};
use crate::edge::{NodeKind, ProjectSpec};

type Table = HashMap<ComponentKey, String>;

#[derive(Default)]
pub struct ComponentTables {
    live: RwLock<Table>,
    pending: RwLock<Table>,
}

impl ComponentTables {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> RwLockReadGuard<'_, Table> {
        self.live.read().expect("component tables poisoned")
    }

    fn live_mut(&self) -> RwLockWriteGuard<'_, Table> {
        self.live.write().expect("component tables poisoned")
    }

    // ------------------------------------------------------------------
    // Live table
    // ------------------------------------------------------------------

    pub fn get(&self, component_type: ComponentType, id: &str) -> Option<String> {
        self.live()
            .get(&ComponentKey::new(component_type, id))
            .cloned()
    }

    pub fn contains(&self, component_type: ComponentType, id: &str) -> bool {
        self.live()
            .contains_key(&ComponentKey::new(component_type, id))
    }

    /// Ids of one type, sorted for deterministic iteration.
    pub fn ids(&self, component_type: ComponentType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .live()
            .keys()
            .filter(|key| key.component_type == component_type)
            .map(|key| key.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Install or replace a raw config in memory only.
    pub fn create_memory_only(&self, component_type: ComponentType, id: &str, raw: &str) {
        self.live_mut()
            .insert(ComponentKey::new(component_type, id), raw.to_string());
    }

    /// Alias of `create_memory_only`: replace-on-update has identical
    /// table semantics.
    pub fn update_memory_only(&self, component_type: ComponentType, id: &str, raw: &str) {
        self.create_memory_only(component_type, id, raw);
    }

    pub fn delete_memory_only(&self, component_type: ComponentType, id: &str) -> bool {
        self.live_mut()
            .remove(&ComponentKey::new(component_type, id))
            .is_some()
    }

    pub fn clear(&self) {
        self.live_mut().clear();
        self.pending.write().expect("component tables poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    // ------------------------------------------------------------------
    // Pending drafts (leader only)
    // ------------------------------------------------------------------

    pub fn save_pending(&self, component_type: ComponentType, id: &str, raw: &str) {
        self.pending
            .write()
            .expect("component tables poisoned")
            .insert(ComponentKey::new(component_type, id), raw.to_string());
    }

    pub fn get_pending(&self, component_type: ComponentType, id: &str) -> Option<String> {
        self.pending
            .read()
            .expect("component tables poisoned")
            .get(&ComponentKey::new(component_type, id))
            .cloned()
    }

    /// Remove and return a draft, typically to publish it.
    pub fn take_pending(&self, component_type: ComponentType, id: &str) -> Option<String> {
        self.pending
            .write()
            .expect("component tables poisoned")
            .remove(&ComponentKey::new(component_type, id))
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// The plugin table: built-ins plus one alias per plugin component.
    pub fn plugin_set(&self) -> PluginSet {
        let mut set = PluginSet::builtin();
        let aliases: Vec<(String, String)> = self
            .live()
            .iter()
            .filter(|(key, _)| key.component_type == ComponentType::Plugin)
            .filter_map(|(key, raw)| {
                resolve_plugin_config(raw)
                    .ok()
                    .map(|target| (key.id.clone(), target))
            })
            .collect();
        for (alias, target) in aliases {
            if let Err(e) = set.alias(&alias, &target) {
                // The config was verified at publish; a miss here means the
                // builtin table changed underneath it.
                warn!(plugin = %alias, error = %e, "Skipping unresolvable plugin alias");
            }
        }
        set
    }

    /// Structural verification of a raw config. Must pass before a
    /// definition may be published; never touches external systems.
    pub fn verify(
        &self,
        component_type: ComponentType,
        id: &str,
        raw: &str,
    ) -> Result<(), String> {
        if id.trim().is_empty() {
            return Err("component id must not be empty".to_string());
        }
        match component_type {
            ComponentType::Input => InputConfig::parse(raw).map(|_| ()),
            ComponentType::Output => OutputConfig::parse(raw).map(|_| ()),
            ComponentType::Ruleset => Ruleset::verify(raw, &self.plugin_set())
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ComponentType::Plugin => {
                let target = resolve_plugin_config(raw)?;
                if PluginSet::builtin().contains(&target) {
                    Ok(())
                } else {
                    Err(format!("unknown builtin plugin: {target}"))
                }
            }
            ComponentType::Project => {
                let spec = ProjectSpec::parse(raw).map_err(|e| e.to_string())?;
                for node in spec.nodes() {
                    if !self.contains(node.kind.into(), &node.id) {
                        return Err(format!("unresolved component: {node}"));
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Reference analysis
    // ------------------------------------------------------------------

    /// Projects whose edge lists transitively reference the component.
    /// Plugin references resolve through the rulesets that call them.
    pub fn projects_referencing(&self, component_type: ComponentType, id: &str) -> Vec<String> {
        let node_kind = match component_type {
            ComponentType::Input => Some(NodeKind::Input),
            ComponentType::Output => Some(NodeKind::Output),
            ComponentType::Ruleset => Some(NodeKind::Ruleset),
            ComponentType::Plugin => None,
            ComponentType::Project => return Vec::new(),
        };

        let ruleset_ids_for_plugin: Vec<String> = if component_type == ComponentType::Plugin {
            self.rulesets_referencing_plugin(id)
        } else {
            Vec::new()
        };

        let live = self.live();
        let mut projects: Vec<String> = Vec::new();
        for (key, raw) in live.iter() {
            if key.component_type != ComponentType::Project {
                continue;
            }
            let Ok(spec) = ProjectSpec::parse(raw) else {
                continue;
            };
            let referenced = match node_kind {
                Some(kind) => spec.references(kind, id),
                None => ruleset_ids_for_plugin
                    .iter()
                    .any(|rs| spec.references(NodeKind::Ruleset, rs)),
            };
            if referenced {
                projects.push(key.id.clone());
            }
        }
        projects.sort();
        projects
    }

    fn rulesets_referencing_plugin(&self, plugin_id: &str) -> Vec<String> {
        self.live()
            .iter()
            .filter(|(key, _)| key.component_type == ComponentType::Ruleset)
            .filter_map(|(key, raw)| {
                let ruleset = Ruleset::parse(raw).ok()?;
                let matches = ruleset.plugin_names().any(|name| name == plugin_id);
                matches.then(|| key.id.clone())
            })
            .collect()
    }
}

impl From<NodeKind> for ComponentType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Input => ComponentType::Input,
            NodeKind::Ruleset => ComponentType::Ruleset,
            NodeKind::Output => ComponentType::Output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables_with_pipeline() -> ComponentTables {
        let tables = ComponentTables::new();
        tables.create_memory_only(ComponentType::Input, "in1", "type: memory\nmemory:\n  queue: q1\n");
        tables.create_memory_only(ComponentType::Output, "out1", "type: print\n");
        tables.create_memory_only(
            ComponentType::Ruleset,
            "rs1",
            r#"<root type="DETECTION"><rule id="r"><check type="NOTNULL" field="x"/></rule></root>"#,
        );
        tables.create_memory_only(
            ComponentType::Project,
            "p1",
            "INPUT.in1 -> RULESET.rs1\nRULESET.rs1 -> OUTPUT.out1",
        );
        tables
    }

    #[test]
    fn verify_dispatches_per_type() {
        let tables = tables_with_pipeline();
        assert!(tables
            .verify(ComponentType::Input, "x", "type: memory\nmemory:\n  queue: q\n")
            .is_ok());
        assert!(tables.verify(ComponentType::Input, "x", "type: nope\n").is_err());
        assert!(tables
            .verify(ComponentType::Project, "p", "INPUT.in1 -> OUTPUT.out1")
            .is_ok());
        // Unresolved reference
        assert!(tables
            .verify(ComponentType::Project, "p", "INPUT.ghost -> OUTPUT.out1")
            .is_err());
    }

    #[test]
    fn ruleset_verify_is_line_annotated() {
        let tables = tables_with_pipeline();
        let err = tables
            .verify(
                ComponentType::Ruleset,
                "bad",
                "<root type=\"DETECTION\">\n  <rule id=\"r\">\n    <check type=\"WAT\" field=\"a\">v</check>\n  </rule>\n</root>",
            )
            .unwrap_err();
        assert!(err.starts_with("line 3"), "{err}");
    }

    #[test]
    fn projects_referencing_components() {
        let tables = tables_with_pipeline();
        assert_eq!(
            tables.projects_referencing(ComponentType::Input, "in1"),
            vec!["p1"]
        );
        assert_eq!(
            tables.projects_referencing(ComponentType::Ruleset, "rs1"),
            vec!["p1"]
        );
        assert!(tables
            .projects_referencing(ComponentType::Input, "other")
            .is_empty());
    }

    #[test]
    fn plugin_references_resolve_through_rulesets() {
        let tables = tables_with_pipeline();
        tables.create_memory_only(ComponentType::Plugin, "internal_ip", "builtin: is_private_ip\n");
        tables.create_memory_only(
            ComponentType::Ruleset,
            "rs2",
            r#"<root type="DETECTION"><rule id="r"><check type="PLUGIN">internal_ip(_$ip)</check></rule></root>"#,
        );
        tables.create_memory_only(
            ComponentType::Project,
            "p2",
            "INPUT.in1 -> RULESET.rs2\nRULESET.rs2 -> OUTPUT.out1",
        );

        assert_eq!(
            tables.projects_referencing(ComponentType::Plugin, "internal_ip"),
            vec!["p2"]
        );
        // And the alias resolves during ruleset verification.
        assert!(tables
            .verify(
                ComponentType::Ruleset,
                "rs3",
                r#"<root type="DETECTION"><rule id="r"><check type="PLUGIN">internal_ip(_$ip)</check></rule></root>"#,
            )
            .is_ok());
    }

    #[test]
    fn pending_drafts_are_separate() {
        let tables = tables_with_pipeline();
        tables.save_pending(ComponentType::Ruleset, "rs1", "<draft/>");
        assert_eq!(
            tables.get_pending(ComponentType::Ruleset, "rs1").unwrap(),
            "<draft/>"
        );
        // Live untouched
        assert!(tables
            .get(ComponentType::Ruleset, "rs1")
            .unwrap()
            .contains("DETECTION"));
        assert!(tables.take_pending(ComponentType::Ruleset, "rs1").is_some());
        assert!(tables.get_pending(ComponentType::Ruleset, "rs1").is_none());
    }
}
