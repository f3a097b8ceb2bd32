use std::collections::HashMap;

use crate::error::{DriverError, Result};

/// A single unit of work placed on this node by the scheduler.
///
/// The config map is string-keyed and interpreted by the owning backend
/// driver. Unrecognized keys are ignored rather than rejected; each driver
/// documents the keys it reads.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    pub config: HashMap<String, String>,
    pub resources: Option<Resources>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Look up a config key, treating an empty value the same as absence.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Structural validation shared by all backends.
    pub fn validate(&self) -> Result<()> {
        if let Some(network) = self.resources.as_ref().and_then(|r| r.network.as_ref()) {
            network.validate()?;
        }
        Ok(())
    }
}

/// What a task requests from the node. Consumed by drivers when building the
/// backend invocation; never mutated by them.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub cpu_mhz: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network: Option<NetworkResource>,
}

/// Requested network bandwidth and named ports.
#[derive(Debug, Clone, Default)]
pub struct NetworkResource {
    pub mbits: u32,
    pub ports: Vec<Port>,
}

impl NetworkResource {
    /// Port labels must be unique within a task.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.label()) {
                return Err(DriverError::Configuration(format!(
                    "duplicate port label {:?}",
                    port.label()
                )));
            }
        }
        Ok(())
    }
}

/// A named port request: either assigned by the orchestrator at placement
/// time or pinned to a fixed host port.
#[derive(Debug, Clone)]
pub enum Port {
    Dynamic { label: String },
    Static { label: String, port: u16 },
}

impl Port {
    pub fn label(&self) -> &str {
        match self {
            Port::Dynamic { label } => label,
            Port::Static { label, .. } => label,
        }
    }
}
