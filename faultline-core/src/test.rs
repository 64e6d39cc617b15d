//! The test descriptor shared by generators, workers, and checkers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Static facts about a run: its identity, the cluster under test, and how
/// many client threads drive it. Generators and checkers receive this by
/// reference; behavior (clients, generators, checkers themselves) is wired
/// up separately by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    /// Unique id for this run.
    pub run_id: Uuid,
    pub name: String,
    /// Wall-clock start; history times are relative nanoseconds.
    pub started_at: DateTime<Utc>,
    /// Nodes of the cluster under test. Client threads are bound to nodes
    /// round-robin.
    pub nodes: Vec<String>,
    /// Number of client worker threads; the nemesis is extra.
    pub concurrency: usize,
    /// Free-form parameters for user generators and checkers.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Test {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Test {
            run_id: Uuid::new_v4(),
            name: name.into(),
            started_at: Utc::now(),
            nodes: Vec::new(),
            concurrency,
            params: Map::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// The node a client thread is bound to, round-robin.
    pub fn node_for(&self, thread_index: usize) -> Option<&str> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes[thread_index % self.nodes.len()].as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_binding_round_robin() {
        let test = Test::new("set", 5).with_nodes(vec!["n1".into(), "n2".into()]);
        assert_eq!(test.node_for(0), Some("n1"));
        assert_eq!(test.node_for(1), Some("n2"));
        assert_eq!(test.node_for(4), Some("n1"));
    }

    #[test]
    fn test_node_binding_empty() {
        let test = Test::new("set", 2);
        assert_eq!(test.node_for(0), None);
    }
}
