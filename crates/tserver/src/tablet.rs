//! The tablet capability and its registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Lookup contract for tablet state. The RPC layer never touches tablet
/// internals; the service implementation reaches them through this trait.
pub trait Tablet: Send + Sync + 'static {
    /// Unique id of this tablet.
    fn id(&self) -> &str;
}

/// Tablet storage, modeled as a map from id to tablet even though only one
/// entry is populated today. Lookup correctly returns `None` for
/// unregistered ids.
#[derive(Default)]
pub struct TabletRegistry {
    tablets: Mutex<HashMap<String, Arc<dyn Tablet>>>,
}

impl TabletRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tablet.
    ///
    /// # Panics
    ///
    /// Panics if a tablet is already registered; a single tablet per server
    /// is enforced, not silently overwritten.
    pub fn register(&self, tablet: Arc<dyn Tablet>) {
        let mut tablets = self.tablets.lock();
        assert!(
            tablets.is_empty(),
            "already have a tablet; only one tablet per server is currently supported"
        );
        tablets.insert(tablet.id().to_string(), tablet);
    }

    /// Look up a tablet by id.
    pub fn lookup(&self, tablet_id: &str) -> Option<Arc<dyn Tablet>> {
        self.tablets.lock().get(tablet_id).cloned()
    }

    /// Ids of all registered tablets.
    pub fn tablet_ids(&self) -> Vec<String> {
        self.tablets.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTablet {
        id: String,
    }

    impl Tablet for FakeTablet {
        fn id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn test_lookup_by_id() {
        let registry = TabletRegistry::new();
        registry.register(Arc::new(FakeTablet {
            id: "tablet-1".to_string(),
        }));

        assert!(registry.lookup("tablet-1").is_some());
        assert!(registry.lookup("tablet-2").is_none());
        assert_eq!(registry.tablet_ids(), vec!["tablet-1".to_string()]);
    }

    #[test]
    #[should_panic(expected = "only one tablet per server")]
    fn test_second_registration_panics() {
        let registry = TabletRegistry::new();
        registry.register(Arc::new(FakeTablet {
            id: "tablet-1".to_string(),
        }));
        registry.register(Arc::new(FakeTablet {
            id: "tablet-2".to_string(),
        }));
    }
}
