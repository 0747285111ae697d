//! Kind discovery - enumerate registered kinds with introspection metadata.
//!
//! Kinds are registered explicitly (Rust has no module scanning); the
//! registry guarantees stable, registration-ordered discovery output within
//! a program run.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::DefineError;
use crate::kind::FsmKind;

/// Introspection metadata for one registered kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindInfo {
    /// Fully-qualified kind name.
    pub name: String,
    /// Last dotted segment, used in on-disk paths.
    pub module_short_name: String,
    /// Human description, if declared.
    pub description: Option<String>,
    /// Sorted state set.
    pub states: Vec<String>,
    /// Names of composed component kinds.
    pub components: Vec<String>,
    /// One line per resolved transition.
    pub transitions_summary: Vec<String>,
}

/// Process-wide registry of declared kinds.
#[derive(Default)]
pub struct KindRegistry {
    kinds: DashMap<String, Arc<FsmKind>>,
    /// Registration order, for stable discovery output.
    order: Mutex<Vec<String>>,
}

impl KindRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind. Names are unique.
    pub fn register(&self, kind: Arc<FsmKind>) -> Result<(), DefineError> {
        let name = kind.name().to_string();
        if self.kinds.contains_key(&name) {
            return Err(DefineError::DuplicateKind { kind: name });
        }
        self.kinds.insert(name.clone(), kind);
        self.order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(name);
        Ok(())
    }

    /// Look up a kind by fully-qualified name.
    pub fn get(&self, name: &str) -> Option<Arc<FsmKind>> {
        self.kinds.get(name).map(|k| k.clone())
    }

    /// Introspection metadata for every registered kind, in registration
    /// order.
    pub fn list_kinds(&self) -> Vec<KindInfo> {
        let order = self
            .order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        order
            .iter()
            .filter_map(|name| self.kinds.get(name))
            .map(|kind| KindInfo {
                name: kind.name().to_string(),
                module_short_name: kind.short_name().to_string(),
                description: kind.description().map(String::from),
                states: kind.states().iter().cloned().collect(),
                components: kind.component_names().to_vec(),
                transitions_summary: kind.transitions_summary(),
            })
            .collect()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindRegistry")
            .field("kinds", &self.kinds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(name: &str) -> Arc<FsmKind> {
        FsmKind::builder(name)
            .description("test kind")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = KindRegistry::new();
        registry.register(kind("Demo.One")).unwrap();

        assert!(registry.get("Demo.One").is_some());
        assert!(registry.get("Demo.Missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let registry = KindRegistry::new();
        registry.register(kind("Demo.One")).unwrap();
        let err = registry.register(kind("Demo.One")).unwrap_err();
        assert!(matches!(err, DefineError::DuplicateKind { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_kinds_is_registration_ordered() {
        let registry = KindRegistry::new();
        registry.register(kind("Demo.B")).unwrap();
        registry.register(kind("Demo.A")).unwrap();
        registry.register(kind("Demo.C")).unwrap();

        let names: Vec<_> = registry.list_kinds().into_iter().map(|k| k.name).collect();
        assert_eq!(names, ["Demo.B", "Demo.A", "Demo.C"]);
    }

    #[test]
    fn test_kind_info_shape() {
        let registry = KindRegistry::new();
        registry.register(kind("Demo.Door")).unwrap();

        let info = &registry.list_kinds()[0];
        assert_eq!(info.module_short_name, "Door");
        assert_eq!(info.description.as_deref(), Some("test kind"));
        assert_eq!(info.states, ["a", "b"]);
        assert_eq!(info.transitions_summary, ["a --go--> b"]);
        assert!(info.components.is_empty());
    }
}
