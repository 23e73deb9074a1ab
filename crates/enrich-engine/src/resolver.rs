//! Cross-pipeline dependency ordering.
//!
//! Every attribute referenced by a pipeline (as its target or as one of its
//! declared inputs) becomes a node. Kahn's algorithm over those nodes yields
//! an order in which each pipeline runs after the pipelines producing its
//! inputs. Among nodes ready at the same time the smallest attribute id goes
//! first, so the order is reproducible.
//!
//! The graph is rebuilt on every call from the catalog; nothing is cached.

use std::collections::{BTreeMap, BTreeSet};

use enrich_types::{AttributeId, EnrichError, Result};

use crate::module::ModuleRegistry;
use crate::pipeline::{Catalog, Pipeline};

#[derive(Debug, Default)]
struct Node<'a> {
    pipeline: Option<&'a Pipeline>,
    dependencies: BTreeSet<AttributeId>,
    dependents: BTreeSet<AttributeId>,
}

#[derive(Debug, Default)]
struct DependencyGraph<'a> {
    nodes: BTreeMap<AttributeId, Node<'a>>,
}

impl<'a> DependencyGraph<'a> {
    fn build(pipelines: &[&'a Pipeline], registry: &ModuleRegistry) -> Self {
        let mut graph = Self::default();
        for &pipeline in pipelines {
            let node = graph.nodes.entry(pipeline.target_attribute.clone()).or_default();
            match node.pipeline {
                Some(existing) => {
                    tracing::warn!(
                        attribute = %pipeline.target_attribute,
                        kept = %existing.id,
                        ignored = %pipeline.id,
                        "Two pipelines target the same attribute"
                    );
                    continue;
                }
                None => node.pipeline = Some(pipeline),
            }
            for dependency in pipeline.dependencies(registry) {
                graph.add_edge(&dependency, &pipeline.target_attribute);
            }
        }
        graph
    }

    /// `dependent` reads `dependency`.
    fn add_edge(&mut self, dependency: &str, dependent: &str) {
        self.nodes
            .entry(dependent.to_string())
            .or_default()
            .dependencies
            .insert(dependency.to_string());
        self.nodes
            .entry(dependency.to_string())
            .or_default()
            .dependents
            .insert(dependent.to_string());
    }

    fn topological_order(&self) -> Result<Vec<&'a Pipeline>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::new();
        let mut visited = 0;
        while let Some(id) = ready.pop_first() {
            visited += 1;
            let node = &self.nodes[id];
            if let Some(pipeline) = node.pipeline {
                order.push(pipeline);
            }
            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if visited < self.nodes.len() {
            let blocked: Vec<String> = in_degree
                .iter()
                .filter(|(id, degree)| **degree > 0 && self.nodes[**id].pipeline.is_some())
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(EnrichError::DependencyCycle { attributes: blocked });
        }
        Ok(order)
    }
}

/// Answers ordering and impact questions over a catalog's pipelines.
pub struct DependencyResolver<'a> {
    catalog: &'a Catalog,
    registry: &'a ModuleRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a ModuleRegistry) -> Self {
        Self { catalog, registry }
    }

    /// Active pipelines of `entity_type` in an order that respects their
    /// declared inputs.
    pub fn compute_execution_order(&self, entity_type: &str) -> Result<Vec<&'a Pipeline>> {
        let pipelines = self.catalog.pipelines_for(entity_type);
        let order = DependencyGraph::build(&pipelines, self.registry).topological_order()?;
        tracing::debug!(
            entity_type,
            order = ?order.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            "Execution order computed"
        );
        Ok(order)
    }

    /// The entity type's active pipelines with `candidate` added, or
    /// replacing the pipeline with the same id.
    fn with_candidate<'b>(&self, candidate: &'b Pipeline) -> Vec<&'b Pipeline>
    where
        'a: 'b,
    {
        let mut pipelines: Vec<&'b Pipeline> = self
            .catalog
            .pipelines_for(&candidate.entity_type)
            .into_iter()
            .filter(|p| p.id != candidate.id)
            .collect();
        pipelines.push(candidate);
        pipelines
    }

    /// Every reason `candidate` could not be saved as active. Empty means valid.
    pub fn validate_pipeline(&self, candidate: &Pipeline) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = candidate.resolve_chain(self.registry) {
            errors.push(e.to_string());
        }

        let clash = self
            .catalog
            .pipelines_for(&candidate.entity_type)
            .into_iter()
            .find(|p| p.id != candidate.id && p.target_attribute == candidate.target_attribute);
        if let Some(other) = clash {
            errors.push(format!(
                "Attribute '{}' is already computed by pipeline '{}'",
                candidate.target_attribute, other.id
            ));
        }

        let pipelines = self.with_candidate(candidate);
        if let Err(e) = DependencyGraph::build(&pipelines, self.registry).topological_order() {
            errors.push(e.to_string());
        }
        errors
    }

    /// Whether making `pipeline` read `dependency` would close a cycle.
    pub fn would_create_cycle(&self, pipeline: &Pipeline, dependency: &str) -> bool {
        if pipeline.target_attribute == dependency {
            return true;
        }
        let pipelines = self.with_candidate(pipeline);
        let mut graph = DependencyGraph::build(&pipelines, self.registry);
        graph.add_edge(dependency, &pipeline.target_attribute);
        graph.topological_order().is_err()
    }

    /// Active pipelines reading any of `changed`, in catalog order.
    pub fn trigger_dependents(&self, changed: &[AttributeId]) -> Vec<&'a Pipeline> {
        let changed: BTreeSet<&str> = changed.iter().map(String::as_str).collect();
        self.catalog
            .pipelines
            .iter()
            .filter(|p| p.active)
            .filter(|p| {
                p.dependencies(self.registry)
                    .iter()
                    .any(|dep| changed.contains(dep.as_str()))
            })
            .collect()
    }
}
