//! Stage handler registry, resolved once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::executor::StageExecutor;
use super::graph::StageGraph;
use crate::errors::GraphError;

/// Maps stage names to executors. Built once and frozen.
#[derive(Clone)]
pub struct StageRegistry {
    handlers: HashMap<String, Arc<dyn StageExecutor>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl StageRegistry {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// The executor of `stage`.
    pub fn get(&self, stage: &str) -> Result<Arc<dyn StageExecutor>, GraphError> {
        self.handlers
            .get(stage)
            .cloned()
            .ok_or_else(|| GraphError::MissingHandler(stage.to_string()))
    }

    /// Returns true if `stage` has an executor.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.handlers.contains_key(stage)
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of executors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`StageRegistry`].
#[derive(Default)]
pub struct StageRegistryBuilder {
    handlers: HashMap<String, Arc<dyn StageExecutor>>,
}

impl std::fmt::Debug for StageRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistryBuilder")
            .field("stages", &self.handlers.len())
            .finish()
    }
}

impl StageRegistryBuilder {
    /// Registers `executor` for `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage already has an executor.
    pub fn register(
        mut self,
        stage: impl Into<String>,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<Self, GraphError> {
        let stage = stage.into();
        if self.handlers.contains_key(&stage) {
            return Err(GraphError::DuplicateStage(stage));
        }
        self.handlers.insert(stage, executor);
        Ok(self)
    }

    /// Validates the handlers against `graph` and freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a graph stage has no executor or an executor is
    /// registered for a stage the graph does not contain.
    pub fn build(self, graph: &StageGraph) -> Result<StageRegistry, GraphError> {
        for node in graph.nodes() {
            if !self.handlers.contains_key(&node.name) {
                return Err(GraphError::MissingHandler(node.name.clone()));
            }
        }
        let mut unknown: Vec<&String> = self.handlers.keys().filter(|name| !graph.contains(name)).collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(GraphError::UnknownHandler((*name).clone()));
        }
        Ok(StageRegistry {
            handlers: self.handlers,
        })
    }
}
