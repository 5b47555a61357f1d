//! The static stage graph.
//!
//! A graph is an ordered list of stages with progress weights. A stage may
//! carry a skip predicate over the accumulated data; the graph walks past
//! skipped stages when computing the next one.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::core::DocumentStage;
use crate::errors::GraphError;
use crate::store::AccumulatedData;

/// Decides from the accumulated data whether a stage is skipped.
pub type SkipPredicate = Arc<dyn Fn(&AccumulatedData) -> bool + Send + Sync>;

/// One stage of a graph.
#[derive(Clone)]
pub struct StageNode {
    /// Unique stage name.
    pub name: String,
    /// Share of overall progress.
    pub weight: u32,
    /// Queue the stage's jobs go to.
    pub queue: String,
    skip: Option<SkipPredicate>,
}

impl fmt::Debug for StageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageNode")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("queue", &self.queue)
            .field("conditional", &self.skip.is_some())
            .finish()
    }
}

impl StageNode {
    /// Creates a node on its own queue, `docflow:<name>`.
    #[must_use]
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        let name = name.into();
        Self {
            queue: format!("docflow:{name}"),
            name,
            weight,
            skip: None,
        }
    }

    /// Routes the stage to another queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Skips the stage whenever `predicate` holds.
    #[must_use]
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AccumulatedData) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Returns true if the stage has a skip predicate.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.skip.is_some()
    }

    /// Returns true if the stage is skipped for `data`.
    #[must_use]
    pub fn should_skip(&self, data: &AccumulatedData) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(data))
    }
}

/// True when persistence produced no line items.
fn has_no_line_items(data: &AccumulatedData) -> bool {
    match data.stage_field(DocumentStage::Persistence.as_str(), "line_items") {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// An ordered, validated list of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    nodes: Vec<StageNode>,
    total_weight: u64,
}

impl StageGraph {
    /// Builds a graph, rejecting empty graphs and duplicate names.
    pub fn new(name: impl Into<String>, nodes: Vec<StageNode>) -> Result<Self, GraphError> {
        let name = name.into();
        if nodes.is_empty() {
            return Err(GraphError::Empty(name));
        }
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateStage(node.name.clone()));
            }
        }
        let total_weight = nodes.iter().map(|n| u64::from(n.weight)).sum();
        Ok(Self {
            name,
            nodes,
            total_weight,
        })
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> StageGraphBuilder {
        StageGraphBuilder {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// The document pipeline: extraction, persistence, enrichment, external
    /// sync, finalization. Enrichment is skipped when persistence stored no
    /// line items.
    #[must_use]
    pub fn document_pipeline() -> Self {
        let nodes = vec![
            StageNode::new(DocumentStage::Extraction, 30),
            StageNode::new(DocumentStage::Persistence, 25),
            StageNode::new(DocumentStage::Enrichment, 20).skip_when(has_no_line_items),
            StageNode::new(DocumentStage::ExternalSync, 15),
            StageNode::new(DocumentStage::Finalization, 10),
        ];
        let total_weight = nodes.iter().map(|n| u64::from(n.weight)).sum();
        Self {
            name: "document".to_string(),
            nodes,
            total_weight,
        }
    }

    /// Graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in order.
    #[must_use]
    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a built graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Distinct queue names in stage order.
    #[must_use]
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for node in &self.nodes {
            if !queues.contains(&node.queue) {
                queues.push(node.queue.clone());
            }
        }
        queues
    }

    /// Returns true if `stage` belongs to the graph.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.position(stage).is_some()
    }

    /// Zero-based index of `stage`.
    #[must_use]
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == stage)
    }

    /// The node named `stage`.
    pub fn node(&self, stage: &str) -> Result<&StageNode, GraphError> {
        self.nodes
            .iter()
            .find(|n| n.name == stage)
            .ok_or_else(|| GraphError::UnknownStage(stage.to_string()))
    }

    /// Queue that runs `stage`.
    pub fn queue_for(&self, stage: &str) -> Result<&str, GraphError> {
        self.node(stage).map(|n| n.queue.as_str())
    }

    /// First stage that is not skipped for `data`.
    #[must_use]
    pub fn first_stage(&self, data: &AccumulatedData) -> Option<&str> {
        self.walk_from(0, data)
    }

    /// Stage to run after `after`, walking past skipped stages. `None` when
    /// `after` is the last stage to run.
    pub fn next_stage(&self, after: &str, data: &AccumulatedData) -> Result<Option<&str>, GraphError> {
        let index = self
            .position(after)
            .ok_or_else(|| GraphError::UnknownStage(after.to_string()))?;
        Ok(self.walk_from(index + 1, data))
    }

    /// Progress once `stage` finished: cumulative weight up to and including
    /// it, 100 for the last stage.
    pub fn progress_after(&self, stage: &str) -> Result<u8, GraphError> {
        let index = self
            .position(stage)
            .ok_or_else(|| GraphError::UnknownStage(stage.to_string()))?;
        Ok(self.percent_through(index + 1))
    }

    /// Progress when `stage` starts.
    pub fn progress_before(&self, stage: &str) -> Result<u8, GraphError> {
        let index = self
            .position(stage)
            .ok_or_else(|| GraphError::UnknownStage(stage.to_string()))?;
        Ok(self.percent_through(index))
    }

    fn walk_from(&self, start: usize, data: &AccumulatedData) -> Option<&str> {
        self.nodes
            .iter()
            .skip(start)
            .find(|node| !node.should_skip(data))
            .map(|node| node.name.as_str())
    }

    fn percent_through(&self, count: usize) -> u8 {
        if count >= self.nodes.len() {
            return 100;
        }
        let percent = if self.total_weight == 0 {
            count as u64 * 100 / self.nodes.len() as u64
        } else {
            let done: u64 = self.nodes[..count].iter().map(|n| u64::from(n.weight)).sum();
            done * 100 / self.total_weight
        };
        u8::try_from(percent.min(100)).unwrap_or(100)
    }
}

/// Builder for [`StageGraph`].
#[derive(Debug, Clone)]
pub struct StageGraphBuilder {
    name: String,
    nodes: Vec<StageNode>,
}

impl StageGraphBuilder {
    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, node: StageNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends a plain stage.
    #[must_use]
    pub fn simple(self, name: impl Into<String>, weight: u32) -> Self {
        self.stage(StageNode::new(name, weight))
    }

    /// Validates and builds the graph.
    pub fn build(self) -> Result<StageGraph, GraphError> {
        StageGraph::new(self.name, self.nodes)
    }
}
