use std::collections::HashMap;

use parking_lot::RwLock;

use super::types::{JobEntry, JobSpec};
use crate::error::RegistryError;
use crate::task::WorkFn;

/// Task type label to work function. Lets a paused task be bound to its
/// work function again after a process restart.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: WorkFn, mut spec: JobSpec) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName);
        }
        if spec.name.is_empty() {
            spec.name = name.to_string();
        }
        if spec.name != name {
            return Err(RegistryError::NameMismatch {
                name: name.to_string(),
                spec: spec.name,
            });
        }

        let mut map = self.jobs.write();
        if map.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        map.insert(
            name.to_string(),
            JobEntry {
                name: name.to_string(),
                handler,
                spec,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkFn> {
        self.jobs.read().get(name).map(|entry| entry.handler.clone())
    }

    pub fn spec(&self, name: &str) -> Option<JobSpec> {
        self.jobs.read().get(name).map(|entry| entry.spec.clone())
    }

    /// Sorted by name.
    pub fn specs(&self) -> Vec<JobSpec> {
        let mut specs: Vec<JobSpec> = self.jobs.read().values().map(|entry| entry.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn has(&self, name: &str) -> bool {
        self.jobs.read().contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.jobs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::task::TaskHandle;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn noop() -> WorkFn {
        Arc::new(|_: &TaskHandle| -> JobResult<Value> { Ok(json!({})) })
    }

    #[test]
    fn register_and_lookup() {
        let registry = JobRegistry::new();
        registry
            .register("download_links", noop(), JobSpec::new("", "fetch links"))
            .unwrap();
        assert!(registry.has("download_links"));
        assert!(registry.get("download_links").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.spec("download_links").unwrap().name, "download_links");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn rejects_bad_registrations() {
        let registry = JobRegistry::new();
        assert_eq!(
            registry.register(" ", noop(), JobSpec::new("", "")),
            Err(RegistryError::InvalidName)
        );
        assert_eq!(
            registry.register("a", noop(), JobSpec::new("b", "")),
            Err(RegistryError::NameMismatch {
                name: "a".into(),
                spec: "b".into()
            })
        );
        registry.register("a", noop(), JobSpec::new("a", "")).unwrap();
        assert_eq!(
            registry.register("a", noop(), JobSpec::new("a", "")),
            Err(RegistryError::Duplicate("a".into()))
        );
    }

    #[test]
    fn specs_are_sorted() {
        let registry = JobRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(name, noop(), JobSpec::new(name, "")).unwrap();
        }
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
