//! Accumulated stage data.
//!
//! Each stage's payload stays in its own namespace. The flat view merges the
//! namespaces in pipeline order: objects merge recursively and a later stage
//! wins a leaf collision. Every collision between different values is
//! recorded, so two stages writing the same array field never overwrite each
//! other unnoticed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A field written by more than one stage with different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCollision {
    /// Dotted path of the field in the flat view.
    pub path: String,
    /// Stages that wrote it, in merge order. The last one won.
    pub stages: Vec<String>,
}

/// The union of all stage results of a workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedData {
    stages: Vec<(String, Map<String, Value>)>,
    merged: Map<String, Value>,
    collisions: Vec<FieldCollision>,
}

impl AccumulatedData {
    /// Builds the view from payloads already sorted in pipeline order.
    #[must_use]
    pub fn from_stages(stages: Vec<(String, Map<String, Value>)>) -> Self {
        let mut merged = Map::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut collisions: Vec<FieldCollision> = Vec::new();
        for (stage, payload) in &stages {
            merge_object(&mut merged, payload, stage, "", &mut owners, &mut collisions);
        }
        Self {
            stages,
            merged,
            collisions,
        }
    }

    /// Returns a copy with `stage` appended (or replaced) and the view
    /// rebuilt.
    #[must_use]
    pub fn with_stage(&self, stage: &str, payload: &Map<String, Value>) -> Self {
        let mut stages: Vec<_> = self
            .stages
            .iter()
            .filter(|(name, _)| name != stage)
            .cloned()
            .collect();
        stages.push((stage.to_string(), payload.clone()));
        Self::from_stages(stages)
    }

    /// The flat merged view.
    #[must_use]
    pub fn merged(&self) -> &Map<String, Value> {
        &self.merged
    }

    /// Looks up a top-level field in the flat view.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key)
    }

    /// One stage's own payload.
    #[must_use]
    pub fn stage(&self, stage: &str) -> Option<&Map<String, Value>> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, payload)| payload)
    }

    /// Looks up `key` inside one stage's namespace.
    #[must_use]
    pub fn stage_field(&self, stage: &str, key: &str) -> Option<&Value> {
        self.stage(stage).and_then(|payload| payload.get(key))
    }

    /// Stage names in merge order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }

    /// Collisions found while merging.
    #[must_use]
    pub fn collisions(&self) -> &[FieldCollision] {
        &self.collisions
    }

    /// `{stage: payload}` for every stage.
    #[must_use]
    pub fn namespaced(&self) -> Value {
        Value::Object(
            self.stages
                .iter()
                .map(|(name, payload)| (name.clone(), Value::Object(payload.clone())))
                .collect(),
        )
    }

    /// Consumes the view and returns the flat object.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.merged)
    }

    /// Number of stages merged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage has a result yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn merge_object(
    target: &mut Map<String, Value>,
    source: &Map<String, Value>,
    stage: &str,
    prefix: &str,
    owners: &mut HashMap<String, String>,
    collisions: &mut Vec<FieldCollision>,
) {
    for (key, value) in source {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
            mark_owner(owners, &path, value, stage);
            continue;
        }
        let Some(existing) = target.get_mut(key) else {
            continue;
        };

        if let (Value::Object(existing), Value::Object(incoming)) = (&mut *existing, value) {
            merge_object(existing, incoming, stage, &path, owners, collisions);
            continue;
        }
        if *existing != *value {
            record_collision(collisions, &path, owners.get(&path), stage);
            *existing = value.clone();
        }
        owners.insert(path, stage.to_string());
    }
}

fn mark_owner(owners: &mut HashMap<String, String>, path: &str, value: &Value, stage: &str) {
    owners.insert(path.to_string(), stage.to_string());
    if let Value::Object(map) = value {
        for (key, child) in map {
            mark_owner(owners, &format!("{path}.{key}"), child, stage);
        }
    }
}

fn record_collision(
    collisions: &mut Vec<FieldCollision>,
    path: &str,
    previous_owner: Option<&String>,
    stage: &str,
) {
    if let Some(existing) = collisions.iter_mut().find(|c| c.path == path) {
        existing.stages.push(stage.to_string());
        return;
    }
    let mut stages = Vec::with_capacity(2);
    if let Some(owner) = previous_owner {
        stages.push(owner.clone());
    }
    stages.push(stage.to_string());
    collisions.push(FieldCollision {
        path: path.to_string(),
        stages,
    });
}
