//! CLI subcommands: init, validate, synth, plan, outputs, graph, drift,
//! status, schema.

use crate::core::app::App;
use crate::core::{compose, parser, planner, resolver, state, synth, types};
use crate::error::{InfraError, Result};
use crate::tripwire::drift;
use clap::Subcommand;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project with the default Median configuration
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate median.yaml and report advisories
    Validate {
        /// Path to median.yaml
        #[arg(short, long, default_value = "median.yaml")]
        file: PathBuf,
    },

    /// Synthesize CloudFormation templates and a manifest
    Synth {
        /// Path to median.yaml
        #[arg(short, long, default_value = "median.yaml")]
        file: PathBuf,

        /// Output directory for templates
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show what a synthesis would change (diff against lock files)
    Plan {
        /// Path to median.yaml
        #[arg(short, long, default_value = "median.yaml")]
        file: PathBuf,

        /// Target specific stack
        #[arg(short, long)]
        stack: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// List declared outputs and export names
    Outputs {
        /// Path to median.yaml
        #[arg(short, long, default_value = "median.yaml")]
        file: PathBuf,

        /// Target specific stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Print stack deployment order and dependency edges
    Graph {
        /// Path to median.yaml
        #[arg(short, long, default_value = "median.yaml")]
        file: PathBuf,
    },

    /// Detect edits to synthesized templates (tripwire)
    Drift {
        /// Target specific stack
        #[arg(short, long)]
        stack: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show current state from lock files
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Target specific stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Print the JSON schema of median.yaml
    Schema,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Synth {
            file,
            out,
            state_dir,
        } => cmd_synth(&file, &out, &state_dir),
        Commands::Plan {
            file,
            stack,
            state_dir,
        } => cmd_plan(&file, &state_dir, stack.as_deref()),
        Commands::Outputs { file, stack } => cmd_outputs(&file, stack.as_deref()),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Drift {
            stack,
            state_dir,
            tripwire,
        } => cmd_drift(&state_dir, stack.as_deref(), tripwire),
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
        Commands::Schema => cmd_schema(),
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("median.yaml");
    if config_path.exists() {
        return Err(InfraError::config(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|source| InfraError::Write {
        path: state_dir.clone(),
        source,
    })?;
    std::fs::write(&config_path, parser::DEFAULT_CONFIG).map_err(|source| InfraError::Write {
        path: config_path.clone(),
        source,
    })?;

    println!("Initialized median-infra project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parse_and_validate(file)?;
    let optional = [
        config.load_balancing.is_some(),
        config.deployment.is_some(),
        config.database.is_some(),
        config.bastion.is_some(),
    ];
    let enabled = 1 + optional.iter().filter(|e| **e).count();
    println!("OK: {} ({} stacks)", config.name, enabled);
    for advisory in parser::advisories(&config) {
        println!("  ADVISORY: {}", advisory);
    }
    Ok(())
}

/// Parse and validate a config file, printing every finding on failure.
fn parse_and_validate(file: &Path) -> Result<types::InfraConfig> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(InfraError::Validation(errors.len()));
    }
    Ok(config)
}

/// Parse, validate and compose.
fn load_app(file: &Path) -> Result<App> {
    let config = parse_and_validate(file)?;
    for advisory in parser::advisories(&config) {
        warn!("{}", advisory);
    }
    compose::compose(&config)
}

fn cmd_synth(file: &Path, out: &Path, state_dir: &Path) -> Result<()> {
    let app = load_app(file)?;
    let manifest = synth::synthesize(&app, out, state_dir)?;

    for name in &manifest.deployment_order {
        let s = &manifest.stacks[name];
        println!(
            "  {} ({} resources, {} outputs) {}",
            out.join(&s.template_file).display(),
            s.resources,
            s.outputs,
            s.template_hash
        );
    }
    println!();
    println!(
        "Synthesized {} stack(s) to {} [{}]",
        manifest.stacks.len(),
        out.display(),
        manifest.run_id
    );
    info!(run_id = %manifest.run_id, hash = %manifest.hash, "synthesis complete");
    Ok(())
}

fn cmd_plan(file: &Path, state_dir: &Path, stack_filter: Option<&str>) -> Result<()> {
    let app = load_app(file)?;
    let order = resolver::stack_order(&app)?;
    let locks = state::load_all_locks(state_dir)?;
    let plan = planner::plan(&app, &order, &locks)?;
    print!("{}", render_plan(&plan, stack_filter));
    Ok(())
}

fn render_plan(plan: &types::ExecutionPlan, stack_filter: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Planning: {} ({} resources)", plan.name, plan.changes.len());
    let _ = writeln!(out);

    let mut current_stack = String::new();
    for change in &plan.changes {
        if stack_filter.is_some_and(|f| change.stack != f) {
            continue;
        }
        if change.stack != current_stack {
            current_stack.clone_from(&change.stack);
            let _ = writeln!(out, "{}:", current_stack);
        }
        let symbol = match change.action {
            types::PlanAction::Create => "+",
            types::PlanAction::Update => "~",
            types::PlanAction::Destroy => "-",
            types::PlanAction::NoOp => " ",
        };
        let _ = writeln!(out, "  {} {}", symbol, change.description);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
    out
}

fn cmd_outputs(file: &Path, stack_filter: Option<&str>) -> Result<()> {
    let app = load_app(file)?;
    print!("{}", render_outputs(&app, stack_filter));
    Ok(())
}

/// Outputs per stack; generated cross-stack exports are listed separately.
fn render_outputs(app: &App, stack_filter: Option<&str>) -> String {
    let mut out = String::new();
    for stack in app.stacks() {
        if stack_filter.is_some_and(|f| stack.name != f) {
            continue;
        }
        let _ = writeln!(out, "{}:", stack.name);
        let (declared, generated): (Vec<_>, Vec<_>) = stack
            .template
            .outputs
            .iter()
            .partition(|(key, _)| !key.starts_with("ExportsOutput"));
        if declared.is_empty() {
            let _ = writeln!(out, "  (no declared outputs)");
        }
        for (key, output) in declared {
            match &output.export {
                Some(export) => {
                    let _ = writeln!(out, "  {} (export: {})", key, export.name);
                }
                None => {
                    let _ = writeln!(out, "  {}", key);
                }
            }
        }
        if !generated.is_empty() {
            let _ = writeln!(out, "  cross-stack exports: {}", generated.len());
        }
    }
    out
}

fn cmd_graph(file: &Path) -> Result<()> {
    let app = load_app(file)?;
    let order = resolver::stack_order(&app)?;
    print!("{}", render_graph(&app, &order));
    Ok(())
}

fn render_graph(app: &App, order: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Deployment order ({}):", app.env);
    for (i, name) in order.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, name);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Dependencies:");
    for name in order {
        if let Ok(stack) = app.stack(name) {
            for dep in &stack.dependencies {
                let _ = writeln!(out, "  {} -> {}", dep, name);
            }
        }
    }
    out
}

fn cmd_drift(state_dir: &Path, stack_filter: Option<&str>, tripwire_mode: bool) -> Result<()> {
    let locks: Vec<types::StackLock> = state::load_all_locks(state_dir)?
        .into_values()
        .filter(|l| stack_filter.is_none_or(|f| l.stack == f))
        .collect();

    let mut total_drift = 0;
    for lock in &locks {
        println!("Checking {} ({})...", lock.stack, lock.template_file);
        match drift::check_stack_drift(lock) {
            None => println!("  No drift detected."),
            Some(f) => {
                println!("  DRIFTED: {} ({})", f.stack, f.detail);
                println!("    Expected: {}", f.expected_hash);
                println!("    Actual:   {}", f.actual_hash);
                crate::tripwire::eventlog::append_event(
                    state_dir,
                    types::ProvenanceEvent::DriftDetected {
                        stack: f.stack.clone(),
                        expected_hash: f.expected_hash.clone(),
                        actual_hash: f.actual_hash.clone(),
                    },
                )?;
                total_drift += 1;
            }
        }
    }

    if total_drift > 0 {
        println!();
        println!("Drift detected: {} stack(s)", total_drift);
        if tripwire_mode {
            return Err(InfraError::Drift(total_drift));
        }
    } else {
        println!("No drift detected.");
    }
    Ok(())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>) -> Result<()> {
    let locks = state::load_all_locks(state_dir)?;
    let mut found = false;

    for (name, lock) in &locks {
        if stack_filter.is_some_and(|f| name != f) {
            continue;
        }
        found = true;
        println!("Stack: {}", lock.stack);
        println!("  Generated: {}", lock.generated_at);
        println!("  Generator: {}", lock.generator);
        println!("  Template:  {} ({})", lock.template_file, lock.template_hash);
        println!("  Resources: {}", lock.resources.len());
        for (id, rl) in &lock.resources {
            let version = rl
                .version
                .map(|v| format!(" v{}", v))
                .unwrap_or_default();
            println!("    {}: {}{}", id, rl.resource_type, version);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `median-infra synth` first.");
    }
    Ok(())
}

fn cmd_schema() -> Result<()> {
    let schema = schemars::schema_for!(types::InfraConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
