//! Immutable snapshot of configured targets.
//!
//! Built once at startup by the config loader; a config change means a new
//! process generation with a fresh snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A monitoring target.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub host: String,
    /// Time between probe cycle starts.
    pub interval: Duration,
    /// Per-probe reply deadline.
    pub timeout: Duration,
}

/// The set of targets for this process generation. Never mutated after load.
#[derive(Debug, Clone)]
pub struct Registry {
    targets: Arc<Vec<Target>>,
    by_name: Arc<HashMap<String, usize>>,
}

impl Registry {
    /// Build a registry from an already-validated target list.
    pub fn new(targets: Vec<Target>) -> Self {
        let by_name = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Self {
            targets: Arc::new(targets),
            by_name: Arc::new(by_name),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.by_name.get(name).map(|&i| &self.targets[i])
    }

    /// Iterate targets in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, host: &str) -> Target {
        Target {
            name: name.to_string(),
            host: host.to_string(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn lookup_by_name() {
        let registry = Registry::new(vec![target("gw", "192.168.1.1"), target("dns", "8.8.8.8")]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("dns").unwrap().host, "8.8.8.8");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn iteration_preserves_configuration_order() {
        let registry = Registry::new(vec![target("b", "1.1.1.1"), target("a", "2.2.2.2")]);
        let names: Vec<_> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
