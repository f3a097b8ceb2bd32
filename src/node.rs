use std::collections::HashMap;
use std::sync::RwLock;

/// Live attribute set for the node this agent runs on.
///
/// Fingerprinting publishes backend capability flags here under
/// `driver.<name>` keys. Writes follow a single-writer-per-key discipline:
/// only the driver named in the key prefix may write its keys, so concurrent
/// fingerprint probes across backends never contend on the same entry.
#[derive(Debug, Default)]
pub struct Node {
    attributes: RwLock<HashMap<String, String>>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .write()
            .expect("node attribute lock poisoned")
            .insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .read()
            .expect("node attribute lock poisoned")
            .get(key)
            .cloned()
    }

    /// Snapshot of all attributes, for registration heartbeats and tests.
    pub fn attributes(&self) -> HashMap<String, String> {
        self.attributes
            .read()
            .expect("node attribute lock poisoned")
            .clone()
    }
}
