//! Named processing nodes for audio pipelines
//!
//! A `ProcessorRegistry` maps node names to factories. Pipelines install
//! nodes by name; every install builds a fresh node, so two pipelines never
//! share node state. The registry is an explicit value owned by whoever wires
//! the pipelines together.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::processor::block_volume;

/// Name the console uses for the output level meter
pub const VU_METER: &str = "vu-meter";

/// One stage in a sample pipeline. Runs once per block, in place.
pub trait ProcessingNode: Send {
    fn process(&mut self, block: &mut [f32]);
}

type NodeFactory = Arc<dyn Fn() -> Box<dyn ProcessingNode> + Send + Sync>;

/// Registry of processing node factories, keyed by name
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    ///
    /// Returns false and keeps the existing factory if the name is taken.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Box<dyn ProcessingNode> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            log::debug!("ProcessorRegistry: '{}' already registered", name);
            return false;
        }
        self.factories.insert(name, Arc::new(factory));
        true
    }

    /// Build a new node instance, if `name` is registered
    pub fn create(&self, name: &str) -> Option<Box<dyn ProcessingNode>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProcessorRegistry")
            .field("nodes", &names)
            .finish()
    }
}

/// Reports the level of every block it sees, leaving samples untouched
pub struct VolumeMeterNode {
    levels: mpsc::UnboundedSender<f32>,
}

impl VolumeMeterNode {
    pub fn new(levels: mpsc::UnboundedSender<f32>) -> Self {
        Self { levels }
    }
}

impl ProcessingNode for VolumeMeterNode {
    fn process(&mut self, block: &mut [f32]) {
        // Receiver gone means nobody is watching the meter
        let _ = self.levels.send(block_volume(block));
    }
}
