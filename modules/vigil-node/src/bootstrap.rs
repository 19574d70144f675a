//! Config-root loading: the leader's authoritative component configs live
//! on disk, one file per component, under one directory per type.
//!
//! ```text
//! <config_root>/input/*.yaml      <config_root>/ruleset/*.xml
//! <config_root>/output/*.yaml     <config_root>/project/*.txt
//! <config_root>/plugin/*.txt
//! ```
//!
//! The file stem is the component id. Files that fail verification are
//! skipped with a warning so one broken config cannot keep the node from
//! booting.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vigil_common::ComponentType;
use vigil_pipeline::ComponentTables;

fn extensions(component_type: ComponentType) -> &'static [&'static str] {
    match component_type {
        ComponentType::Input | ComponentType::Output => &["yaml", "yml"],
        ComponentType::Ruleset => &["xml"],
        ComponentType::Plugin | ComponentType::Project => &["txt"],
    }
}

/// Load every component config under `root` into the live tables, in
/// dependency order so verification can resolve references.
pub fn load_config_root(root: &Path, tables: &Arc<ComponentTables>) -> Result<usize> {
    let mut loaded = 0;
    for component_type in ComponentType::BOOTSTRAP_ORDER {
        let dir = root.join(component_type.as_str());
        if !dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("cannot read {}", dir.display()))?;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| extensions(component_type).contains(&ext))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            match tables.verify(component_type, id, &raw) {
                Ok(()) => {
                    tables.create_memory_only(component_type, id, &raw);
                    loaded += 1;
                }
                Err(detail) => {
                    warn!(
                        path = %path.display(),
                        error = %detail,
                        "Skipping config that failed verification"
                    );
                }
            }
        }
    }
    info!(loaded, root = %root.display(), "Config root loaded");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_a_full_pipeline_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "input/in1.yaml", "type: memory\nmemory:\n  queue: q\n");
        write(root, "output/out1.yaml", "type: print\n");
        write(root, "plugin/internal_ip.txt", "builtin: is_private_ip\n");
        write(
            root,
            "ruleset/rs1.xml",
            r#"<root type="DETECTION"><rule id="r"><check type="PLUGIN">internal_ip(_$ip)</check></rule></root>"#,
        );
        write(
            root,
            "project/p1.txt",
            "INPUT.in1 -> RULESET.rs1\nRULESET.rs1 -> OUTPUT.out1",
        );

        let tables = Arc::new(ComponentTables::new());
        let loaded = load_config_root(root, &tables).unwrap();
        assert_eq!(loaded, 5);
        assert!(tables.contains(ComponentType::Project, "p1"));
    }

    #[test]
    fn broken_configs_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "input/good.yaml", "type: memory\nmemory:\n  queue: q\n");
        write(root, "input/bad.yaml", "type: warp_drive\n");
        write(root, "input/ignored.json", "{}");

        let tables = Arc::new(ComponentTables::new());
        let loaded = load_config_root(root, &tables).unwrap();
        assert_eq!(loaded, 1);
        assert!(tables.contains(ComponentType::Input, "good"));
        assert!(!tables.contains(ComponentType::Input, "bad"));
    }

    #[test]
    fn missing_directories_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let tables = Arc::new(ComponentTables::new());
        assert_eq!(load_config_root(dir.path(), &tables).unwrap(), 0);
    }
}
