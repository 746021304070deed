//! The registry: name → service-surface mapping.
//!
//! Written at init, read thereafter. The registry owns its surfaces;
//! surfaces hold only their own name and options.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::api::Api;
use crate::error::BusError;

/// A shared mapping from surface name to surface instance.
///
/// `get(name)` succeeds iff `add` was previously called with a surface of
/// that name. Cloning is cheap and all clones observe the same entries.
#[derive(Clone, Default)]
pub struct ApiRegistry {
    apis: Arc<DashMap<String, Arc<Api>>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a surface, keyed by its name.
    ///
    /// Replacing an existing name is permitted — last writer wins, no
    /// implicit merge. Fails with [`BusError::InvalidApiRegistryEntry`] when
    /// handed a surface value that was never finished by its builder.
    pub fn add(&self, api: Api) -> Result<Arc<Api>, BusError> {
        if api.name.is_empty() {
            return Err(BusError::InvalidApiRegistryEntry(
                "the surface carries no name, which means its builder was \
                 never finished with build()"
                    .to_string(),
            ));
        }
        let api = Arc::new(api);
        self.apis.insert(api.name().to_string(), api.clone());
        Ok(api)
    }

    /// Look up a surface by name, failing with [`BusError::UnknownApi`]
    /// when absent.
    pub fn get(&self, name: &str) -> Result<Arc<Api>, BusError> {
        self.apis
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BusError::UnknownApi(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apis.contains_key(name)
    }

    /// All registered surfaces. Iteration order is unspecified.
    pub fn all(&self) -> Vec<Arc<Api>> {
        self.apis.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The surfaces visible to public enumeration.
    pub fn public(&self) -> Vec<Arc<Api>> {
        self.apis
            .iter()
            .filter(|entry| !entry.value().is_internal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The bus-infrastructural surfaces.
    pub fn internal(&self) -> Vec<Arc<Api>> {
        self.apis
            .iter()
            .filter(|entry| entry.value().is_internal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.apis.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}

impl fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("apis", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;

    fn surface(name: &str, internal: bool) -> Api {
        Api::builder(name).internal(internal).build().unwrap()
    }

    #[test]
    fn add_then_get_returns_the_same_surface() {
        let registry = ApiRegistry::new();
        let added = registry.add(surface("example.test", false)).unwrap();
        let fetched = registry.get("example.test").unwrap();
        assert!(Arc::ptr_eq(&added, &fetched));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_unknown_name_fails() {
        let registry = ApiRegistry::new();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, BusError::UnknownApi(name) if name == "nope"));
    }

    #[test]
    fn replacing_a_name_is_last_writer_wins() {
        let registry = ApiRegistry::new();
        registry.add(surface("example.test", false)).unwrap();
        let replacement = registry.add(surface("example.test", true)).unwrap();
        assert_eq!(registry.len(), 1);
        let fetched = registry.get("example.test").unwrap();
        assert!(Arc::ptr_eq(&replacement, &fetched));
        assert!(fetched.is_internal());
    }

    #[test]
    fn unfinished_surfaces_are_rejected() {
        // A nameless surface value can only exist when a builder was never
        // run to completion; the registry refuses it outright.
        let unfinished = Api {
            name: String::new(),
            internal: false,
            auto_register: true,
            events: BTreeMap::new(),
            procedures: BTreeMap::new(),
        };
        let registry = ApiRegistry::new();
        let err = registry.add(unfinished).unwrap_err();
        assert!(matches!(err, BusError::InvalidApiRegistryEntry(_)));
    }

    #[test]
    fn public_and_internal_partition_all() {
        let registry = ApiRegistry::new();
        registry.add(surface("support", false)).unwrap();
        registry.add(surface("auth", false)).unwrap();
        registry.add(surface("internal.metrics", true)).unwrap();

        let names = |apis: Vec<Arc<Api>>| {
            apis.iter()
                .map(|api| api.name().to_string())
                .collect::<BTreeSet<_>>()
        };
        let public = names(registry.public());
        let internal = names(registry.internal());
        let all = names(registry.all());

        assert!(public.is_disjoint(&internal));
        assert_eq!(
            public.union(&internal).cloned().collect::<BTreeSet<_>>(),
            all
        );
        assert_eq!(all.len(), 3);
    }
}
