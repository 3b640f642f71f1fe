//! Named batch system instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BatchError;
use crate::local::LocalBatch;
use crate::slurm::SlurmBatch;
use crate::system::BatchSystem;

/// Scheduler kinds that [`BatchRegistry::ensure`] can create.
pub const BUILTIN_SCHEDULERS: &[&str] = &["local", "slurm"];

/// Settings shared by the built-in batch systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Spool directory of the local batch system
    pub spool_dir: PathBuf,

    /// Hard timeout for every external scheduler command
    pub command_timeout: Duration,

    /// Minimum age of a poll table before it is refreshed
    pub poll_refresh: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from(".cyclewm/spool"),
            command_timeout: Duration::from_secs(60),
            poll_refresh: Duration::from_secs(30),
        }
    }
}

/// One batch system instance per scheduler name in use.
pub struct BatchRegistry {
    config: BatchConfig,
    systems: BTreeMap<String, Arc<dyn BatchSystem>>,
}

impl BatchRegistry {
    /// Create an empty registry.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            systems: BTreeMap::new(),
        }
    }

    /// Register an instance under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, system: Arc<dyn BatchSystem>) {
        self.systems.insert(name.into(), system);
    }

    /// Return the instance for `name`, creating a built-in one on first use.
    pub fn ensure(&mut self, name: &str) -> Result<Arc<dyn BatchSystem>, BatchError> {
        if let Some(system) = self.systems.get(name) {
            return Ok(system.clone());
        }
        let system: Arc<dyn BatchSystem> = match name {
            "local" => Arc::new(LocalBatch::new(
                self.config.spool_dir.clone(),
                self.config.command_timeout,
            )),
            "slurm" => Arc::new(SlurmBatch::new(
                self.config.command_timeout,
                self.config.poll_refresh,
            )),
            other => return Err(BatchError::UnknownScheduler(other.to_string())),
        };
        self.systems.insert(name.to_string(), system.clone());
        Ok(system)
    }

    /// Instance registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BatchSystem>> {
        self.systems.get(name).cloned()
    }

    /// Whether `name` is registered or can be created.
    pub fn supports(&self, name: &str) -> bool {
        self.systems.contains_key(name) || BUILTIN_SCHEDULERS.contains(&name)
    }

    /// Names of all instances, in order.
    pub fn names(&self) -> Vec<String> {
        self.systems.keys().cloned().collect()
    }

    /// Settings used for built-in instances.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_builtins_once() {
        let mut registry = BatchRegistry::new(BatchConfig::default());
        let first = registry.ensure("local").unwrap();
        let second = registry.ensure("local").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), "local");
        assert_eq!(registry.ensure("slurm").unwrap().kind(), "slurm");
        assert_eq!(registry.names(), vec!["local", "slurm"]);
    }

    #[test]
    fn test_unknown_scheduler() {
        let mut registry = BatchRegistry::new(BatchConfig::default());
        assert!(!registry.supports("pbs"));
        assert!(matches!(
            registry.ensure("pbs"),
            Err(BatchError::UnknownScheduler(name)) if name == "pbs"
        ));
    }
}
