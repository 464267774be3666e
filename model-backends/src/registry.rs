//! Backend registry for resolving backend kinds named in configuration.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BackendError, IdentityBackend, LinearBackend, ModelBackend, Result, TreeEnsembleBackend};

/// Constructor for a fresh, unloaded backend instance.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn ModelBackend> + Send + Sync>;

/// Registry of backend constructors keyed by kind.
///
/// Worker pools ask the registry for one instance per worker, so a factory
/// must return a new instance on every call.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the reference backends shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("identity", || Box::new(IdentityBackend::new()));
        registry.register("linear", || Box::new(LinearBackend::new()));
        registry.register("tree-ensemble", || Box::new(TreeEnsembleBackend::new()));
        registry
    }

    /// Register (or replace) the factory for a backend kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ModelBackend> + Send + Sync + 'static,
    {
        let kind = kind.into();
        tracing::debug!("Registered backend kind {}", kind);
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Create a new, unloaded instance of `kind`.
    pub fn create(&self, kind: &str) -> Result<Box<dyn ModelBackend>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| BackendError::UnknownKind(kind.to_string()))
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["identity", "linear", "tree-ensemble"]);
        assert_eq!(registry.create("linear").unwrap().kind(), "linear");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.create("onnx"),
            Err(BackendError::UnknownKind(kind)) if kind == "onnx"
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register("linear", || Box::new(IdentityBackend::new()));
        assert_eq!(registry.create("linear").unwrap().kind(), "identity");
    }
}
