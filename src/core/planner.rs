//! Plan generation: diff the composed app against the last synthesis' locks.

use super::app::App;
use super::state;
use super::types::*;
use crate::error::Result;
use indexmap::IndexMap;

/// Generate an execution plan by comparing composed templates to lock state.
///
/// Stacks are visited in `deployment_order`; stacks that only exist in the
/// locks are planned for destruction after them.
pub fn plan(
    app: &App,
    deployment_order: &[String],
    locks: &IndexMap<String, StackLock>,
) -> Result<ExecutionPlan> {
    let mut changes = Vec::new();

    for stack_name in deployment_order {
        let stack = app.stack(stack_name)?;
        let lock = locks.get(stack_name);

        for (id, resource) in &stack.template.resources {
            let hash = state::resource_hash(resource)?;
            let previous = lock.and_then(|l| l.resources.get(id));
            let action = match previous {
                None => PlanAction::Create,
                Some(rl) if rl.hash == hash && rl.resource_type == resource.resource_type => {
                    PlanAction::NoOp
                }
                Some(_) => PlanAction::Update,
            };
            let description = describe_action(id, &resource.resource_type, &action, previous, &hash);
            changes.push(PlannedChange {
                stack: stack_name.clone(),
                logical_id: id.clone(),
                resource_type: resource.resource_type.clone(),
                action,
                description,
            });
        }

        if let Some(lock) = lock {
            for (id, rl) in &lock.resources {
                if !stack.template.resources.contains_key(id) {
                    changes.push(destroy(stack_name, id, rl));
                }
            }
        }
    }

    for (stack_name, lock) in locks {
        if app.stack(stack_name).is_err() {
            for (id, rl) in &lock.resources {
                changes.push(destroy(stack_name, id, rl));
            }
        }
    }

    let count = |a: PlanAction| -> u32 {
        changes
            .iter()
            .filter(|c| c.action == a)
            .count()
            .try_into()
            .unwrap_or(u32::MAX)
    };

    Ok(ExecutionPlan {
        name: app.name.clone(),
        to_create: count(PlanAction::Create),
        to_update: count(PlanAction::Update),
        to_destroy: count(PlanAction::Destroy),
        unchanged: count(PlanAction::NoOp),
        deployment_order: deployment_order.to_vec(),
        changes,
    })
}

fn destroy(stack: &str, id: &str, rl: &ResourceLock) -> PlannedChange {
    PlannedChange {
        stack: stack.to_string(),
        logical_id: id.to_string(),
        resource_type: rl.resource_type.clone(),
        action: PlanAction::Destroy,
        description: format!("{}: destroy {}", id, rl.resource_type),
    }
}

/// Generate a human-readable description of a planned action.
fn describe_action(
    id: &str,
    resource_type: &str,
    action: &PlanAction,
    previous: Option<&ResourceLock>,
    hash: &str,
) -> String {
    let versioned = state::is_versioned(resource_type);
    match action {
        PlanAction::Create if versioned => {
            format!("{}: create {} (version 1)", id, resource_type)
        }
        PlanAction::Create => format!("{}: create {}", id, resource_type),
        PlanAction::Update if versioned => {
            let prev = previous.and_then(|p| p.version).unwrap_or(1);
            format!(
                "{}: publish version {} (was {})",
                id,
                state::next_version(previous, hash),
                prev
            )
        }
        PlanAction::Update => format!("{}: update (declaration changed)", id),
        PlanAction::Destroy => format!("{}: destroy {}", id, resource_type),
        PlanAction::NoOp => format!("{}: no changes", id),
    }
}
