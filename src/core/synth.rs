//! Synthesis: write one template per stack plus a manifest, record locks and
//! provenance events.

use super::app::App;
use super::template::Template;
use super::types::ProvenanceEvent;
use super::{resolver, state};
use crate::error::{InfraError, Result};
use crate::tripwire::{eventlog, hasher};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-stack manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStack {
    pub template_file: String,
    pub template_hash: String,
    pub dependencies: Vec<String>,
    pub resources: usize,
    pub outputs: usize,
    pub exports: Vec<String>,
}

/// `manifest.json`: what was synthesized, for whom, in what order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub app: String,
    pub environment: String,
    pub run_id: String,
    pub deployment_order: Vec<String>,
    pub stacks: IndexMap<String, ManifestStack>,
    /// Composite hash over every template hash, in deployment order
    pub hash: String,
}

/// File name of a stack's template.
pub fn template_file_name(stack: &str) -> String {
    format!("{}.template.json", stack)
}

/// Pretty JSON with a trailing newline.
pub fn render_template(template: &Template) -> Result<String> {
    let mut json = serde_json::to_string_pretty(template)?;
    json.push('\n');
    Ok(json)
}

/// Check ordering and references across the whole app. Returns the stack
/// deployment order.
pub fn verify(app: &App) -> Result<Vec<String>> {
    let order = resolver::stack_order(app)?;
    resolver::verify_imports(app)?;
    for stack in app.stacks() {
        let resources = resolver::resource_order(&stack.name, &stack.template)?;
        debug!(stack = %stack.name, resources = resources.len(), "resource order verified");
    }
    Ok(order)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|source| InfraError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Synthesize every stack into `out_dir`, update locks under `state_dir`.
pub fn synthesize(app: &App, out_dir: &Path, state_dir: &Path) -> Result<Manifest> {
    let started = Instant::now();
    let order = verify(app)?;

    std::fs::create_dir_all(out_dir).map_err(|source| InfraError::Write {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let run_id = eventlog::generate_run_id();
    eventlog::append_event(
        state_dir,
        ProvenanceEvent::SynthStarted {
            app: app.name.clone(),
            run_id: run_id.clone(),
            generator_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )?;

    let mut stacks = IndexMap::new();
    for name in &order {
        let stack = app.stack(name)?;
        let path = out_dir.join(template_file_name(name));
        write_file(&path, &render_template(&stack.template)?)?;
        let template_hash = hasher::hash_file(&path)?;
        let template_file = std::fs::canonicalize(&path)
            .map_err(|source| InfraError::Read {
                path: path.clone(),
                source,
            })?
            .display()
            .to_string();

        let previous = state::load_lock(state_dir, name)?;
        let lock = state::build_lock(stack, &template_file, &template_hash, previous.as_ref())?;
        state::save_lock(state_dir, &lock)?;

        let resources = stack.template.resources.len();
        let outputs = stack.template.outputs.len();
        eventlog::append_event(
            state_dir,
            ProvenanceEvent::StackSynthesized {
                stack: name.clone(),
                resources: u32::try_from(resources).unwrap_or(u32::MAX),
                outputs: u32::try_from(outputs).unwrap_or(u32::MAX),
                hash: template_hash.clone(),
            },
        )?;
        info!(stack = %name, resources, outputs, hash = %template_hash, "synthesized");

        stacks.insert(
            name.clone(),
            ManifestStack {
                template_file: template_file_name(name),
                template_hash,
                dependencies: stack.dependencies.clone(),
                resources,
                outputs,
                exports: stack
                    .template
                    .exports()
                    .map(|(export, _)| export.to_string())
                    .collect(),
            },
        );
    }

    prune_removed_stacks(&order, out_dir, state_dir)?;

    let hashes: Vec<&str> = stacks.values().map(|s| s.template_hash.as_str()).collect();
    let manifest = Manifest {
        version: "1.0".to_string(),
        app: app.name.clone(),
        environment: app.env.to_string(),
        run_id: run_id.clone(),
        hash: hasher::composite_hash(&hashes),
        deployment_order: order,
        stacks,
    };
    let mut json = serde_json::to_string_pretty(&manifest)?;
    json.push('\n');
    write_file(&out_dir.join(MANIFEST_FILE), &json)?;

    eventlog::append_event(
        state_dir,
        ProvenanceEvent::SynthCompleted {
            app: app.name.clone(),
            run_id,
            stacks: u32::try_from(manifest.stacks.len()).unwrap_or(u32::MAX),
            total_seconds: started.elapsed().as_secs_f64(),
        },
    )?;
    Ok(manifest)
}

/// Delete the lock and template of every stack no longer composed.
fn prune_removed_stacks(order: &[String], out_dir: &Path, state_dir: &Path) -> Result<()> {
    for (name, lock) in state::load_all_locks(state_dir)? {
        if order.contains(&name) {
            continue;
        }
        let templates = [
            PathBuf::from(&lock.template_file),
            out_dir.join(template_file_name(&name)),
        ];
        for template in templates {
            if template.is_file() {
                std::fs::remove_file(&template).map_err(|source| InfraError::Write {
                    path: template.clone(),
                    source,
                })?;
            }
        }
        state::remove_lock(state_dir, &name)?;
        eventlog::append_event(
            state_dir,
            ProvenanceEvent::StackRemoved {
                stack: name.clone(),
                template_file: lock.template_file.clone(),
            },
        )?;
        info!(stack = %name, "removed stale stack");
    }
    Ok(())
}

/// Read a manifest written by [`synthesize`].
pub fn read_manifest(out_dir: &Path) -> Result<Manifest> {
    let path = out_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|source| InfraError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Environment;
    use crate::core::{compose, parser, planner};
    use crate::tripwire::drift;

    fn app() -> App {
        let config = parser::parse_config(parser::DEFAULT_CONFIG).unwrap();
        compose::compose_in(
            &config,
            Environment {
                account: Some("046397301718".into()),
                region: "ap-southeast-1".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_synthesize_writes_templates_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("cdk.out");
        let state_dir = dir.path().join("state");
        let manifest = synthesize(&app(), &out, &state_dir).unwrap();

        assert_eq!(manifest.deployment_order[0], "MedianVPCStack");
        assert_eq!(manifest.environment, "aws://046397301718/ap-southeast-1");
        for name in &manifest.deployment_order {
            assert!(out.join(template_file_name(name)).exists());
            assert!(state::lock_file_path(&state_dir, name).exists());
        }
        let vpc = &manifest.stacks["MedianVPCStack"];
        assert!(vpc.exports.contains(&"MedianVPCID".to_string()));

        let read = read_manifest(&out).unwrap();
        assert_eq!(read, manifest);
    }

    #[test]
    fn test_template_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        synthesize(&app(), &out, &dir.path().join("state")).unwrap();
        let raw = std::fs::read_to_string(out.join("MedianRdsStack.template.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(v["Description"], "Median RDS Stack");
        assert!(v["Outputs"]["MedianPostgresRdsEndpoint"]["Export"]["Name"].is_string());
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = synthesize(&app(), &dir.path().join("a"), &dir.path().join("sa")).unwrap();
        let b = synthesize(&app(), &dir.path().join("b"), &dir.path().join("sb")).unwrap();
        assert_eq!(a.hash, b.hash);
        for (name, stack) in &a.stacks {
            assert_eq!(stack.template_hash, b.stacks[name].template_hash);
        }
    }

    #[test]
    fn test_events_logged() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        synthesize(&app(), &dir.path().join("out"), &state_dir).unwrap();
        let events = eventlog::read_events(&state_dir).unwrap();
        assert_eq!(events.len(), 7);
        assert!(matches!(events[0].event, ProvenanceEvent::SynthStarted { .. }));
        assert!(matches!(events[6].event, ProvenanceEvent::SynthCompleted { stacks: 5, .. }));
    }

    #[test]
    fn test_no_drift_after_synth_then_drift_on_edit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let state_dir = dir.path().join("state");
        synthesize(&app(), &out, &state_dir).unwrap();
        let locks: Vec<_> = state::load_all_locks(&state_dir).unwrap().into_values().collect();
        assert!(drift::detect_drift(&locks).is_empty());

        std::fs::write(out.join("MedianAlbStack.template.json"), "{}").unwrap();
        let findings = drift::detect_drift(&locks);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].stack, "MedianAlbStack");
    }

    #[test]
    fn test_resynth_drops_removed_stack() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let state_dir = dir.path().join("state");
        synthesize(&app(), &out, &state_dir).unwrap();
        assert!(out.join("MedianBastionHostStack.template.json").exists());

        let mut config = parser::parse_config(parser::DEFAULT_CONFIG).unwrap();
        config.bastion = None;
        let smaller = compose::compose_in(
            &config,
            Environment {
                account: Some("046397301718".into()),
                region: "ap-southeast-1".into(),
            },
        )
        .unwrap();
        synthesize(&smaller, &out, &state_dir).unwrap();

        let locks = state::load_all_locks(&state_dir).unwrap();
        assert!(!locks.contains_key("MedianBastionHostStack"));
        assert_eq!(locks.len(), 4);
        assert!(!out.join("MedianBastionHostStack.template.json").exists());
        assert!(!state_dir.join("MedianBastionHostStack").exists());

        let order = resolver::stack_order(&smaller).unwrap();
        let plan = planner::plan(&smaller, &order, &locks).unwrap();
        assert_eq!(plan.to_destroy, 0);
        assert_eq!(plan.to_create + plan.to_update, 0);

        let events = eventlog::read_events(&state_dir).unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.event,
            ProvenanceEvent::StackRemoved { stack, .. } if stack == "MedianBastionHostStack"
        )));
    }

    #[test]
    fn test_lock_records_absolute_template_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        let out = dir.path().join("work").join("..").join("out");
        let state_dir = dir.path().join("state");
        synthesize(&app(), &out, &state_dir).unwrap();

        let lock = state::load_lock(&state_dir, "MedianVPCStack").unwrap().unwrap();
        let recorded = Path::new(&lock.template_file);
        assert!(recorded.is_absolute());
        assert!(!recorded
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir)));
        assert!(recorded.ends_with("out/MedianVPCStack.template.json"));
        assert!(drift::check_stack_drift(&lock).is_none());
    }

    #[test]
    fn test_resynth_keeps_launch_template_version() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let state_dir = dir.path().join("state");
        synthesize(&app(), &out, &state_dir).unwrap();
        synthesize(&app(), &out, &state_dir).unwrap();
        let lock = state::load_lock(&state_dir, "MedianAlbStack").unwrap().unwrap();
        let lt = lock
            .resources
            .values()
            .find(|r| r.resource_type == "AWS::EC2::LaunchTemplate")
            .unwrap();
        assert_eq!(lt.version, Some(1));
    }
}
