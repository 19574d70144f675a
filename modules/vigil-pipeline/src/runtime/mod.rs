//! The project runtime: executes graph plans over shared, reference-
//! counted instances and channels.
//!
//! Structural changes (wiring projects up and tearing them down) are
//! serialized by one async mutex; the event hot path never touches it.
//! Start wires downstream-first (outputs, rulesets, inputs) so sinks are
//! consuming before the first event is produced; stop is the mirror
//! image (quiesce inputs, drain hop by hop, close sinks last).

pub mod input;
pub mod output;
pub mod ruleset;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use vigil_common::{ComponentType, Event};
use vigil_rules::Ruleset;

use crate::channel::ChannelRegistry;
use crate::config::{InputConfig, OutputConfig};
use crate::edge::ProjectSpec;
use crate::error::PipelineError;
use crate::graph::{self, GraphPlan};
use crate::pns::Pns;
use crate::project::{Project, ProjectSnapshot, ProjectStatus, RestartReason};
use crate::tables::ComponentTables;

pub use input::InputInstance;
pub use output::OutputInstance;
pub use ruleset::RulesetInstance;

/// Everything a running project holds references on, recorded so stop can
/// release exactly what start acquired.
#[derive(Debug, Clone, Default)]
pub struct OwnedWiring {
    pub channels: Vec<Pns>,
    pub inputs: Vec<String>,
    pub rulesets: Vec<Pns>,
    pub outputs: Vec<Pns>,
}

struct RefCounted<T> {
    instance: Arc<T>,
    refs: usize,
}

#[derive(Default)]
struct Wiring {
    inputs: HashMap<String, RefCounted<InputInstance>>,
    rulesets: HashMap<Pns, RefCounted<RulesetInstance>>,
    outputs: HashMap<Pns, RefCounted<OutputInstance>>,
}

pub struct PipelineRuntime {
    tables: Arc<ComponentTables>,
    channels: ChannelRegistry,
    wiring: Mutex<Wiring>,
    projects: StdMutex<HashMap<String, Arc<Project>>>,
}

impl PipelineRuntime {
    pub fn new(tables: Arc<ComponentTables>) -> Self {
        Self {
            tables,
            channels: ChannelRegistry::new(),
            wiring: Mutex::new(Wiring::default()),
            projects: StdMutex::new(HashMap::new()),
        }
    }

    pub fn tables(&self) -> &Arc<ComponentTables> {
        &self.tables
    }

    // ------------------------------------------------------------------
    // Project table
    // ------------------------------------------------------------------

    /// Get or create the runtime entry for a project component.
    pub fn ensure_project(&self, id: &str) -> Arc<Project> {
        self.projects
            .lock()
            .expect("projects poisoned")
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Project::new(id)))
            .clone()
    }

    pub fn project(&self, id: &str) -> Result<Arc<Project>, PipelineError> {
        self.projects
            .lock()
            .expect("projects poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownProject(id.to_string()))
    }

    pub fn snapshots(&self) -> Vec<ProjectSnapshot> {
        let mut snapshots: Vec<ProjectSnapshot> = self
            .projects
            .lock()
            .expect("projects poisoned")
            .values()
            .map(|p| p.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Test/introspection hook: current refcount of a PNS channel.
    pub fn channel_refcount(&self, pns: &Pns) -> usize {
        self.channels.refcount(pns)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start_project(&self, id: &str) -> Result<(), PipelineError> {
        let project = self.project(id)?;
        let _guard = project.lifecycle.lock().await;
        self.start_locked(&project).await
    }

    pub async fn stop_project(&self, id: &str) -> Result<(), PipelineError> {
        let project = self.project(id)?;
        let _guard = project.lifecycle.lock().await;
        self.stop_locked(&project).await
    }

    pub async fn restart_project(
        &self,
        id: &str,
        reason: RestartReason,
    ) -> Result<(), PipelineError> {
        let project = self.project(id)?;
        let _guard = project.lifecycle.lock().await;

        if reason == RestartReason::Drift && project.within_restart_cooldown() {
            debug!(project = id, "Skipping drift restart inside cooldown window");
            return Ok(());
        }
        if matches!(
            project.status(),
            ProjectStatus::Running | ProjectStatus::Error
        ) {
            self.stop_locked(&project).await?;
        }
        self.start_locked(&project).await?;
        project.mark_restarted();
        Ok(())
    }

    /// Stop (if needed) and forget a project. Its shared instances and
    /// channels survive as long as other projects reference them.
    pub async fn delete_project(&self, id: &str) -> Result<(), PipelineError> {
        let removed = self
            .projects
            .lock()
            .expect("projects poisoned")
            .remove(id);
        if let Some(project) = removed {
            let _guard = project.lifecycle.lock().await;
            if matches!(
                project.status(),
                ProjectStatus::Running | ProjectStatus::Error
            ) {
                self.stop_locked(&project).await?;
            }
        }
        Ok(())
    }

    async fn start_locked(&self, project: &Arc<Project>) -> Result<(), PipelineError> {
        project.transition(
            &[ProjectStatus::Stopped, ProjectStatus::Error],
            ProjectStatus::Starting,
            "start",
        )?;
        info!(project = %project.id, "Starting project");

        match self.start_inner(project).await {
            Ok(owned) => {
                project.set_running(owned);
                info!(project = %project.id, "Project running");
                Ok(())
            }
            Err(e) => {
                warn!(project = %project.id, error = %e, "Project start failed");
                project.set_error(&e.to_string());
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, project: &Arc<Project>) -> Result<(), PipelineError> {
        project.transition(
            &[ProjectStatus::Running, ProjectStatus::Error],
            ProjectStatus::Stopping,
            "stop",
        )?;
        info!(project = %project.id, "Stopping project");

        let owned = project.take_owned();
        let clean = self.teardown(&owned).await;
        if !clean {
            warn!(project = %project.id, "Drain timed out during stop; force-closed");
        }
        project.set_stopped();
        info!(project = %project.id, "Project stopped");
        Ok(())
    }

    async fn start_inner(&self, project: &Arc<Project>) -> Result<OwnedWiring, PipelineError> {
        let raw = self
            .tables
            .get(ComponentType::Project, &project.id)
            .ok_or_else(|| PipelineError::UnknownProject(project.id.clone()))?;
        let spec = ProjectSpec::parse(&raw)?;
        let plan = graph::build(&spec, |kind, id| self.tables.contains(kind.into(), id))?;

        // Resolve and parse every referenced config before touching any
        // shared state, so a bad config cannot leave partial wiring.
        let plugins = Arc::new(self.tables.plugin_set());
        let mut input_configs: HashMap<String, InputConfig> = HashMap::new();
        for binding in &plan.inputs {
            if input_configs.contains_key(&binding.id) {
                continue;
            }
            let raw = self
                .tables
                .get(ComponentType::Input, &binding.id)
                .ok_or_else(|| unknown(ComponentType::Input, &binding.id))?;
            let config = InputConfig::parse(&raw).map_err(|detail| PipelineError::Verify {
                what: format!("input.{}", binding.id),
                detail,
            })?;
            input_configs.insert(binding.id.clone(), config);
        }
        let mut output_configs: HashMap<String, OutputConfig> = HashMap::new();
        for binding in &plan.outputs {
            if output_configs.contains_key(&binding.id) {
                continue;
            }
            let raw = self
                .tables
                .get(ComponentType::Output, &binding.id)
                .ok_or_else(|| unknown(ComponentType::Output, &binding.id))?;
            let config = OutputConfig::parse(&raw).map_err(|detail| PipelineError::Verify {
                what: format!("output.{}", binding.id),
                detail,
            })?;
            output_configs.insert(binding.id.clone(), config);
        }
        let mut ruleset_programs: HashMap<String, Ruleset> = HashMap::new();
        for binding in &plan.rulesets {
            if ruleset_programs.contains_key(&binding.id) {
                continue;
            }
            let raw = self
                .tables
                .get(ComponentType::Ruleset, &binding.id)
                .ok_or_else(|| unknown(ComponentType::Ruleset, &binding.id))?;
            let program =
                Ruleset::verify(&raw, &plugins).map_err(|e| PipelineError::Verify {
                    what: format!("ruleset.{}", binding.id),
                    detail: e.to_string(),
                })?;
            ruleset_programs.insert(binding.id.clone(), program);
        }

        let mut owned = OwnedWiring::default();
        let wired = {
            let mut wiring = self.wiring.lock().await;
            self.wire(
                &mut wiring,
                &plan,
                &input_configs,
                &output_configs,
                &ruleset_programs,
                plugins,
                &mut owned,
            )
            .await
        };
        if let Err(e) = wired {
            // Roll partial wiring back before surfacing the failure.
            self.teardown(&owned).await;
            return Err(e);
        }
        Ok(owned)
    }

    /// Wire one project's plan into the shared runtime. Records every
    /// acquisition in `owned` as it happens so the caller can roll back a
    /// partial failure with a plain teardown.
    #[allow(clippy::too_many_arguments)]
    async fn wire(
        &self,
        wiring: &mut Wiring,
        plan: &GraphPlan,
        input_configs: &HashMap<String, InputConfig>,
        output_configs: &HashMap<String, OutputConfig>,
        ruleset_programs: &HashMap<String, Ruleset>,
        plugins: Arc<vigil_rules::PluginSet>,
        owned: &mut OwnedWiring,
    ) -> Result<(), PipelineError> {
        let mut senders: HashMap<Pns, mpsc::Sender<Event>> = HashMap::new();
        for pns in &plan.channels {
            let tx = self.channels.acquire(pns);
            owned.channels.push(pns.clone());
            senders.insert(pns.clone(), tx);
        }

        // Outputs first: sinks are consuming before anything produces.
        for binding in &plan.outputs {
            owned.outputs.push(binding.node_pns.clone());
            if let Some(rc) = wiring.outputs.get_mut(&binding.node_pns) {
                rc.refs += 1;
                continue;
            }
            let upstream = self
                .channels
                .take_receiver(&binding.node_pns)
                .expect("fresh channel keeps its receiver until an instance claims it");
            let config = output_configs
                .get(&binding.id)
                .expect("parsed before wiring");
            let instance = OutputInstance::start(
                &binding.id,
                binding.node_pns.clone(),
                config,
                plan.policy,
                upstream,
            )
            .await?;
            wiring
                .outputs
                .insert(binding.node_pns.clone(), RefCounted { instance, refs: 1 });
        }

        for binding in &plan.rulesets {
            owned.rulesets.push(binding.node_pns.clone());
            if let Some(rc) = wiring.rulesets.get_mut(&binding.node_pns) {
                rc.refs += 1;
                for pns in &binding.out_edges {
                    let tx = senders.get(pns).expect("acquired above").clone();
                    rc.instance.ensure_downstream(pns.clone(), tx);
                }
                continue;
            }
            let upstream = self
                .channels
                .take_receiver(&binding.node_pns)
                .expect("fresh channel keeps its receiver until an instance claims it");
            let downstream: HashMap<Pns, mpsc::Sender<Event>> = binding
                .out_edges
                .iter()
                .map(|pns| (pns.clone(), senders.get(pns).expect("acquired above").clone()))
                .collect();
            let program = ruleset_programs
                .get(&binding.id)
                .expect("parsed before wiring")
                .clone();
            let instance = RulesetInstance::start(
                &binding.id,
                binding.node_pns.clone(),
                program,
                plugins.clone(),
                upstream,
                downstream,
            );
            wiring
                .rulesets
                .insert(binding.node_pns.clone(), RefCounted { instance, refs: 1 });
        }

        // Inputs last: nothing produces until every hop below is ready.
        for binding in &plan.inputs {
            owned.inputs.push(binding.id.clone());
            if let Some(rc) = wiring.inputs.get_mut(&binding.id) {
                rc.refs += 1;
                for pns in &binding.out_edges {
                    let tx = senders.get(pns).expect("acquired above").clone();
                    rc.instance.add_downstream(pns.clone(), tx);
                }
                continue;
            }
            let downstream: HashMap<Pns, mpsc::Sender<Event>> = binding
                .out_edges
                .iter()
                .map(|pns| (pns.clone(), senders.get(pns).expect("acquired above").clone()))
                .collect();
            let config = input_configs
                .get(&binding.id)
                .expect("parsed before wiring");
            let instance =
                InputInstance::start(&binding.id, config, downstream, plan.policy).await?;
            wiring
                .inputs
                .insert(binding.id.clone(), RefCounted { instance, refs: 1 });
        }

        Ok(())
    }

    /// Release one project's references: decrement instance and channel
    /// refcounts, then drain the instances whose counts reached zero,
    /// inputs first, then rulesets upstream-to-downstream, then outputs.
    /// Returns false if any drain hit its timeout.
    async fn teardown(&self, owned: &OwnedWiring) -> bool {
        let (doomed_inputs, doomed_rulesets, doomed_outputs, dead_entries) = {
            let mut wiring = self.wiring.lock().await;

            let mut doomed_inputs = Vec::new();
            for id in &owned.inputs {
                if let Some(rc) = wiring.inputs.get_mut(id) {
                    rc.refs = rc.refs.saturating_sub(1);
                    if rc.refs == 0 {
                        if let Some(rc) = wiring.inputs.remove(id) {
                            doomed_inputs.push(rc.instance);
                        }
                    }
                }
            }
            let mut doomed_rulesets = Vec::new();
            for pns in &owned.rulesets {
                if let Some(rc) = wiring.rulesets.get_mut(pns) {
                    rc.refs = rc.refs.saturating_sub(1);
                    if rc.refs == 0 {
                        if let Some(rc) = wiring.rulesets.remove(pns) {
                            doomed_rulesets.push(rc.instance);
                        }
                    }
                }
            }
            let mut doomed_outputs = Vec::new();
            for pns in &owned.outputs {
                if let Some(rc) = wiring.outputs.get_mut(pns) {
                    rc.refs = rc.refs.saturating_sub(1);
                    if rc.refs == 0 {
                        if let Some(rc) = wiring.outputs.remove(pns) {
                            doomed_outputs.push(rc.instance);
                        }
                    }
                }
            }

            // Release channels; entries that die detach from surviving
            // producers so the consumer side sees end-of-stream.
            let mut dead_entries = Vec::new();
            for pns in &owned.channels {
                if let Some(entry) = self.channels.release(pns) {
                    for rc in wiring.inputs.values() {
                        rc.instance.remove_downstream(pns);
                    }
                    for rc in wiring.rulesets.values() {
                        rc.instance.remove_downstream(pns);
                    }
                    dead_entries.push(entry);
                }
            }
            (doomed_inputs, doomed_rulesets, doomed_outputs, dead_entries)
        };

        let mut clean = true;
        // Quiesce sources, then let closure cascade down the graph.
        for instance in &doomed_inputs {
            clean &= instance.stop().await;
        }
        drop(dead_entries);
        // owned.rulesets is in plan (upstream-first) order, so each hop's
        // channel is closed by the time we wait on it.
        for instance in &doomed_rulesets {
            clean &= instance.stop().await;
        }
        for instance in &doomed_outputs {
            clean &= instance.stop().await;
        }
        clean
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> RuntimeStats {
        let wiring = self.wiring.lock().await;
        let mut inputs: Vec<AdapterStats> = wiring
            .inputs
            .values()
            .map(|rc| AdapterStats {
                id: rc.instance.id.clone(),
                pns: None,
                total: rc.instance.counter.total(),
                qps: rc.instance.counter.qps(),
                health: rc.instance.health(),
                refs: rc.refs,
            })
            .collect();
        let mut rulesets: Vec<RulesetStats> = wiring
            .rulesets
            .values()
            .map(|rc| RulesetStats {
                id: rc.instance.ruleset_id.clone(),
                pns: rc.instance.pns.to_string(),
                processed: rc.instance.processed.total(),
                matched: rc.instance.matched.total(),
                emitted: rc.instance.emitted.total(),
                errors: rc.instance.error_count(),
                refs: rc.refs,
            })
            .collect();
        let mut outputs: Vec<OutputStats> = wiring
            .outputs
            .values()
            .map(|rc| {
                let mut sample = rc.instance.sampler.snapshot();
                let recent = sample.split_off(sample.len().saturating_sub(5));
                OutputStats {
                    id: rc.instance.output_id.clone(),
                    pns: rc.instance.pns.to_string(),
                    total: rc.instance.counter.total(),
                    qps: rc.instance.counter.qps(),
                    health: rc.instance.health(),
                    dropped: rc.instance.dropped(),
                    refs: rc.refs,
                    recent,
                }
            })
            .collect();
        inputs.sort_by(|a, b| a.id.cmp(&b.id));
        rulesets.sort_by(|a, b| a.pns.cmp(&b.pns));
        outputs.sort_by(|a, b| a.pns.cmp(&b.pns));

        RuntimeStats {
            channels: self.channels.len(),
            inputs,
            rulesets,
            outputs,
        }
    }
}

fn unknown(component_type: ComponentType, id: &str) -> PipelineError {
    PipelineError::Build(crate::error::BuildError::UnknownComponent {
        kind: component_type.to_string(),
        id: id.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStats {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pns: Option<String>,
    pub total: u64,
    pub qps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    pub refs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesetStats {
    pub id: String,
    pub pns: String,
    pub processed: u64,
    pub matched: u64,
    pub emitted: u64,
    pub errors: u64,
    pub refs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputStats {
    pub id: String,
    pub pns: String,
    pub total: u64,
    pub qps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    pub dropped: u64,
    pub refs: usize,
    /// Tail of the endpoint's sample ring.
    pub recent: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub channels: usize,
    pub inputs: Vec<AdapterStats>,
    pub rulesets: Vec<RulesetStats>,
    pub outputs: Vec<OutputStats>,
}
