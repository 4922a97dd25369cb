//! Dependency DAG construction for stacks and template resources.
//!
//! Stack order comes from the dependencies recorded while resolving
//! cross-stack references. Resource order inside one template comes from
//! `Ref`/`Fn::GetAtt` edges plus explicit `DependsOn`. Both use Kahn's
//! algorithm with deterministic (alphabetical) tie-breaking.

use super::app::App;
use super::template::{self, Template, PSEUDO_PARAMETERS};
use crate::error::{InfraError, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Topologically sort `nodes` given `(before, after)` edges.
pub fn topological_order(nodes: &[String], edges: &[(String, String)]) -> Result<Vec<String>> {
    let mut in_degree: FxHashMap<&str, usize> = FxHashMap::default();
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for id in nodes {
        in_degree.insert(id, 0);
        adjacency.insert(id, Vec::new());
    }

    for (before, after) in edges {
        let (Some(next), Some(_)) = (adjacency.get_mut(before.as_str()), in_degree.get(after.as_str())) else {
            return Err(InfraError::config(format!(
                "edge '{}' -> '{}' names an unknown node",
                before, after
            )));
        };
        next.push(after);
        if let Some(d) = in_degree.get_mut(after.as_str()) {
            *d += 1;
        }
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<&str> = zero_degree.into_iter().collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready = Vec::new();
        for neighbor in adjacency.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(neighbor) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(*neighbor);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != nodes.len() {
        let ordered: FxHashSet<&str> = order.iter().map(String::as_str).collect();
        let mut members: Vec<&str> = nodes
            .iter()
            .map(String::as_str)
            .filter(|n| !ordered.contains(n))
            .collect();
        members.sort_unstable();
        return Err(InfraError::Cycle(members.join(", ")));
    }

    Ok(order)
}

/// Deployment order of the app's stacks.
pub fn stack_order(app: &App) -> Result<Vec<String>> {
    let nodes: Vec<String> = app.stacks().map(|s| s.name.clone()).collect();
    let edges: Vec<(String, String)> = app
        .stacks()
        .flat_map(|s| {
            s.dependencies
                .iter()
                .map(move |dep| (dep.clone(), s.name.clone()))
        })
        .collect();
    topological_order(&nodes, &edges)
}

/// Creation order of the resources in one template. Every `Ref`/`Fn::GetAtt`
/// target must be a resource, a parameter or a pseudo parameter.
pub fn resource_order(stack: &str, template: &Template) -> Result<Vec<String>> {
    let nodes: Vec<String> = template.resources.keys().cloned().collect();
    let mut edges = Vec::new();

    for (id, resource) in &template.resources {
        let mut targets = Vec::new();
        for value in resource.properties.values() {
            template::collect_references(value, &mut targets);
        }
        targets.extend(resource.depends_on.iter().cloned());

        for target in targets {
            if template.resources.contains_key(&target) {
                let edge = (target, id.clone());
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            } else if !template.parameters.contains_key(&target)
                && !PSEUDO_PARAMETERS.contains(&target.as_str())
            {
                return Err(InfraError::DanglingReference {
                    consumer: format!("{}/{}", stack, id),
                    producer: stack.to_string(),
                    logical_id: target,
                });
            }
        }
    }

    topological_order(&nodes, &edges)
}

/// Every `Fn::ImportValue` must name an export of a stack the consumer
/// depends on.
pub fn verify_imports(app: &App) -> Result<()> {
    for stack in app.stacks() {
        let mut imports = Vec::new();
        for resource in stack.template.resources.values() {
            for value in resource.properties.values() {
                template::collect_imports(value, &mut imports);
            }
        }
        for output in stack.template.outputs.values() {
            template::collect_imports(&output.value, &mut imports);
        }

        for name in imports {
            match app.export_value(&name) {
                Some((producer, _)) if stack.dependencies.iter().any(|d| d == producer) => {}
                Some((producer, _)) => {
                    return Err(InfraError::config(format!(
                        "stack '{}' imports '{}' from '{}' without depending on it",
                        stack.name, name, producer
                    )))
                }
                None => {
                    return Err(InfraError::DanglingReference {
                        consumer: stack.name.clone(),
                        producer: name.split(':').next().unwrap_or_default().to_string(),
                        logical_id: name.clone(),
                    })
                }
            }
        }
    }
    Ok(())
}
