use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{DriverError, Result};
use crate::node::Node;

use super::qemu::QemuDriver;
use super::Driver;

/// Registry of execution backends keyed by driver name.
///
/// Handle ids carry their backend tag as a prefix; [`DriverRegistry::for_handle`]
/// routes a persisted id back to the only driver allowed to decode it.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend registered.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(QemuDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    /// Route a persisted handle id to the backend whose tag prefixes it.
    pub fn for_handle(&self, handle_id: &str) -> Result<Arc<dyn Driver>> {
        let tag = handle_id.split(':').next().unwrap_or("");
        self.drivers
            .values()
            .find(|d| d.tag() == tag)
            .cloned()
            .ok_or_else(|| DriverError::HandleDecode {
                handle_id: handle_id.to_string(),
                reason: format!("no registered backend with tag {:?}", tag),
            })
    }

    /// Fingerprint every registered backend against `node`.
    ///
    /// Probe errors are surfaced per driver rather than aborting the sweep,
    /// so one broken backend cannot hide the others' capabilities.
    pub async fn fingerprint_all(
        &self,
        config: &ClientConfig,
        node: &Node,
    ) -> Vec<(&'static str, Result<bool>)> {
        let mut results = Vec::with_capacity(self.drivers.len());
        for (name, driver) in &self.drivers {
            let result = driver.fingerprint(config, node).await;
            match &result {
                Ok(capable) => {
                    tracing::debug!(driver = name, capable, "fingerprinted");
                }
                Err(e) => {
                    tracing::warn!(driver = name, error = %e, "fingerprint failed");
                }
            }
            results.push((*name, result));
        }
        results
    }
}
