//! App and stack registry with cross-stack reference resolution.
//!
//! Definitions never hold `&mut` access to another stack. They receive
//! [`Reference`] handles and ask the [`App`] to resolve them from the consuming
//! stack. A same-stack reference resolves to `Ref`/`Fn::GetAtt`; a cross-stack
//! reference adds an export to the producer (once), an `Fn::ImportValue` to the
//! consumer and a dependency edge between the two stacks.

use super::template::{self, CfnResource, Export, Output, Parameter, Template};
use super::types::Environment;
use crate::error::{InfraError, Result};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

/// Read-only handle to a resource (or one of its attributes) in some stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub stack: String,
    pub logical_id: String,
    pub attribute: Option<String>,
}

impl Reference {
    /// `Ref` form.
    pub fn to(stack: &str, logical_id: &str) -> Self {
        Self {
            stack: stack.to_string(),
            logical_id: logical_id.to_string(),
            attribute: None,
        }
    }

    /// `Fn::GetAtt` form.
    pub fn attr(stack: &str, logical_id: &str, attribute: &str) -> Self {
        Self {
            stack: stack.to_string(),
            logical_id: logical_id.to_string(),
            attribute: Some(attribute.to_string()),
        }
    }

    /// Output key and export name used when this reference crosses stacks.
    fn export_key(&self) -> String {
        match &self.attribute {
            None => format!("ExportsOutputRef{}", self.logical_id),
            Some(attr) => format!(
                "ExportsOutputFnGetAtt{}{}",
                self.logical_id,
                attr.replace('.', "")
            ),
        }
    }
}

/// A security-group style source: declared in some stack, or a fixed external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundarySource {
    Declared(Reference),
    External(String),
}

/// One stack: its template plus the stacks it imports from.
#[derive(Debug, Clone)]
pub struct Stack {
    pub name: String,
    pub template: Template,
    pub dependencies: Vec<String>,
}

impl Stack {
    /// Declare a resource; logical ids are unique per stack.
    pub fn add_resource(&mut self, logical_id: &str, resource: CfnResource) -> Result<Reference> {
        if self.template.resources.contains_key(logical_id) {
            return Err(InfraError::DuplicateResource {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        debug!(stack = %self.name, %logical_id, kind = %resource.resource_type, "declare resource");
        self.template
            .resources
            .insert(logical_id.to_string(), resource);
        Ok(Reference::to(&self.name, logical_id))
    }

    pub fn add_parameter(&mut self, name: &str, parameter: Parameter) -> Reference {
        self.template.parameters.insert(name.to_string(), parameter);
        Reference::to(&self.name, name)
    }

    /// Declare a named output, optionally exported.
    pub fn add_output(&mut self, key: &str, value: Value, export_name: Option<&str>) {
        self.template.outputs.insert(
            key.to_string(),
            Output {
                description: None,
                value,
                export: export_name.map(|name| Export {
                    name: name.to_string(),
                }),
            },
        );
    }

    fn declares(&self, logical_id: &str) -> bool {
        self.template.resources.contains_key(logical_id)
            || self.template.parameters.contains_key(logical_id)
    }

    fn depend_on(&mut self, producer: &str) {
        if producer != self.name && !self.dependencies.iter().any(|d| d == producer) {
            self.dependencies.push(producer.to_string());
        }
    }
}

/// The composition: environment plus stacks in declaration order.
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub env: Environment,
    stacks: IndexMap<String, Stack>,
}

impl App {
    pub fn new(name: &str, env: Environment) -> Self {
        Self {
            name: name.to_string(),
            env,
            stacks: IndexMap::new(),
        }
    }

    pub fn add_stack(&mut self, name: &str, description: Option<String>) -> Result<()> {
        if self.stacks.contains_key(name) {
            return Err(InfraError::DuplicateStack(name.to_string()));
        }
        self.stacks.insert(
            name.to_string(),
            Stack {
                name: name.to_string(),
                template: Template::new(description),
                dependencies: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn stack(&self, name: &str) -> Result<&Stack> {
        self.stacks
            .get(name)
            .ok_or_else(|| InfraError::UnknownStack(name.to_string()))
    }

    pub fn stack_mut(&mut self, name: &str) -> Result<&mut Stack> {
        self.stacks
            .get_mut(name)
            .ok_or_else(|| InfraError::UnknownStack(name.to_string()))
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.values()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Record an ordering edge without importing a value.
    pub fn add_dependency(&mut self, consumer: &str, producer: &str) -> Result<()> {
        self.stack(producer)?;
        self.stack_mut(consumer)?.depend_on(producer);
        Ok(())
    }

    /// Resolve a reference as seen from `consumer`.
    pub fn resolve(&mut self, consumer: &str, reference: &Reference) -> Result<Value> {
        self.stack(consumer)?;
        let producer = self.stack_mut(&reference.stack)?;
        if !producer.declares(&reference.logical_id) {
            return Err(InfraError::DanglingReference {
                consumer: consumer.to_string(),
                producer: reference.stack.clone(),
                logical_id: reference.logical_id.clone(),
            });
        }

        let local = match &reference.attribute {
            None => template::ref_(&reference.logical_id),
            Some(attr) => template::get_att(&reference.logical_id, attr),
        };
        if reference.stack == consumer {
            return Ok(local);
        }

        let key = reference.export_key();
        let export_name = format!("{}:{}", reference.stack, key);
        if !producer.template.outputs.contains_key(&key) {
            debug!(producer = %reference.stack, %consumer, export = %export_name, "add export");
            producer.add_output(&key, local, Some(&export_name));
        }
        self.stack_mut(consumer)?.depend_on(&reference.stack);
        Ok(template::import_value(&export_name))
    }

    /// Resolve a list of references into a JSON array.
    pub fn resolve_all(&mut self, consumer: &str, references: &[Reference]) -> Result<Value> {
        let mut items = Vec::with_capacity(references.len());
        for r in references {
            items.push(self.resolve(consumer, r)?);
        }
        Ok(Value::Array(items))
    }

    /// Resolve a boundary source; external ids pass through as literals.
    pub fn resolve_boundary(&mut self, consumer: &str, source: &BoundarySource) -> Result<Value> {
        match source {
            BoundarySource::Declared(reference) => self.resolve(consumer, reference),
            BoundarySource::External(id) => Ok(Value::String(id.clone())),
        }
    }

    /// Find which stack exports `export_name` and the value it exports.
    pub fn export_value(&self, export_name: &str) -> Option<(&str, &Value)> {
        self.stacks.values().find_map(|s| {
            s.template
                .outputs
                .values()
                .find(|o| o.export.as_ref().is_some_and(|e| e.name == export_name))
                .map(|o| (s.name.as_str(), &o.value))
        })
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        /// Resolving the same producer resources any number of times adds
        /// exactly one export per distinct reference and one dependency.
        #[test]
        fn one_export_per_distinct_reference(picks in prop::collection::vec((0usize..4, any::<bool>()), 1..40)) {
            let mut app = App::new(
                "p",
                Environment {
                    account: None,
                    region: "ap-southeast-1".into(),
                },
            );
            app.add_stack("Net", None).unwrap();
            app.add_stack("Web", None).unwrap();
            for i in 0..4 {
                app.stack_mut("Net")
                    .unwrap()
                    .add_resource(&format!("Res{}", i), CfnResource::new("AWS::EC2::Subnet", json!({})))
                    .unwrap();
            }

            let mut distinct = std::collections::BTreeSet::new();
            for (i, with_attr) in picks {
                let id = format!("Res{}", i);
                let reference = if with_attr {
                    Reference::attr("Net", &id, "SubnetId")
                } else {
                    Reference::to("Net", &id)
                };
                distinct.insert(reference.export_key());
                app.resolve("Web", &reference).unwrap();
            }

            let net = app.stack("Net").unwrap();
            prop_assert_eq!(net.template.outputs.len(), distinct.len());
            prop_assert_eq!(app.stack("Web").unwrap().dependencies.clone(), vec!["Net".to_string()]);
        }
    }
}
