use crate::context::{Context, Device};
use crate::error::{RegistryError, Result};
use crate::types::Fragment;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Type-erased view of a [`Context`], as stored in the registry catalog.
pub trait AnyContext: Send + Sync {
    fn kind(&self) -> &str;
    fn origin(&self) -> Option<&str>;
    fn accepts(&self) -> &'static str;
    fn derived_masks(&self) -> Vec<String>;
    fn len(&self) -> usize;
    fn identifiers(&self) -> Vec<String>;
    /// Realized identifiers with the `Debug` rendering of their device.
    fn describe(&self) -> Vec<(String, String)>;
    fn contains(&self, identifier: &str) -> bool;
    /// Register an untyped value: an identifier string, an `Arc<D>` or a `Handle<Arc<D>>`.
    fn register_any(&self, identifier: &str, value: Box<dyn Any + Send + Sync>) -> Result<()>;
    /// Parse `fragment` and register the result under `identifier`.
    fn load_entry(&self, registry: &Registry, identifier: &str, fragment: &Fragment) -> Result<()>;
    fn cast(&self, local: &str, origin_identifier: &str) -> Result<()>;
    fn teardown(&self) -> bool;
    fn as_any(&self) -> &dyn Any;

    fn is_mask(&self) -> bool {
        self.origin().is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Catalog of every device context known to one configuration.
///
/// Contexts are created up front, before any document is loaded, and live as long as the
/// registry. Independent registries do not share state.
#[derive(Default)]
pub struct Registry {
    contexts: RwLock<IndexMap<String, Arc<dyn AnyContext>>>,
    shut_down: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context<D: ?Sized + Device>(&self, kind: &str) -> Result<Context<D>> {
        let mut contexts = self.contexts.write();
        if contexts.contains_key(kind) {
            return Err(RegistryError::DuplicateContext(kind.to_string()));
        }
        let ctx = Context::<D>::new(kind);
        contexts.insert(kind.to_string(), Arc::new(ctx.clone()));
        debug!(context = kind, accepts = type_name::<D>(), "created context");
        Ok(ctx)
    }

    pub fn create_context_with<D, F>(&self, kind: &str, parser: F) -> Result<Context<D>>
    where
        D: ?Sized + Device,
        F: Fn(&Registry, &Fragment, &str) -> Result<Arc<D>> + Send + Sync + 'static,
    {
        let ctx = self.create_context::<D>(kind)?;
        ctx.bind_parser(parser);
        Ok(ctx)
    }

    /// Create a mask named `mask` over `origin`'s backing mapping.
    pub fn create_masked_context<D: ?Sized + Device>(
        &self,
        origin: &Context<D>,
        mask: &str,
    ) -> Result<Context<D>> {
        let mut contexts = self.contexts.write();
        if contexts.contains_key(mask) {
            return Err(RegistryError::DuplicateContext(mask.to_string()));
        }
        let ctx = origin.derive_mask(mask);
        contexts.insert(mask.to_string(), Arc::new(ctx.clone()));
        debug!(context = mask, origin = origin.kind(), "created masked context");
        Ok(ctx)
    }

    /// Non-failing lookup by kind name.
    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn AnyContext>> {
        self.contexts.read().get(kind).cloned()
    }

    /// Typed lookup by kind name.
    pub fn context<D: ?Sized + Device>(&self, kind: &str) -> Result<Context<D>> {
        let entry = self
            .lookup(kind)
            .ok_or_else(|| RegistryError::MissingContext(kind.to_string()))?;
        entry
            .as_any()
            .downcast_ref::<Context<D>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                context: kind.to_string(),
                expected: type_name::<D>(),
                found: entry.accepts().to_string(),
            })
    }

    /// Context names in creation order.
    pub fn kinds(&self) -> Vec<String> {
        self.contexts.read().keys().cloned().collect()
    }

    pub fn contexts(&self) -> Vec<Arc<dyn AnyContext>> {
        self.contexts.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Realized devices across all contexts. A device realized under several roles is counted
    /// once per role.
    pub fn device_count(&self) -> usize {
        self.contexts.read().values().map(|c| c.len()).sum()
    }

    /// Run every installed teardown hook once, newest context first. Later calls are no-ops.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("releasing devices");
        let mut ran = 0;
        for ctx in self.contexts().iter().rev() {
            if ctx.teardown() {
                ran += 1;
            }
        }
        info!(hooks = ran, "devices released");
        ran
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("contexts", &self.kinds())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Relay(u8);

    #[derive(Debug)]
    struct Sensor;

    #[test]
    fn test_lookup_is_non_failing() {
        let registry = Registry::new();
        assert!(registry.lookup("relay").is_none());
        registry.create_context::<Relay>("relay").unwrap();
        let ctx = registry.lookup("relay").unwrap();
        assert_eq!(ctx.kind(), "relay");
        assert!(!ctx.is_mask());
    }

    #[test]
    fn test_duplicate_context_name_fails() {
        let registry = Registry::new();
        let relays = registry.create_context::<Relay>("relay").unwrap();
        relays.register("r1", Arc::new(Relay(1))).unwrap();
        let err = registry.create_context::<Relay>("relay").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateContext(_)));
        // the original context is still the catalog entry
        assert!(registry.context::<Relay>("relay").unwrap().contains("r1"));

        let err = registry
            .create_masked_context(&relays, "relay")
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateContext(_)));
        assert!(relays.derived_masks().is_empty());
    }

    #[test]
    fn test_typed_lookup() {
        let registry = Registry::new();
        registry.create_context::<Relay>("relay").unwrap();
        assert!(registry.context::<Relay>("relay").is_ok());
        assert!(matches!(
            registry.context::<Sensor>("relay"),
            Err(RegistryError::TypeMismatch { .. })
        ));
        assert!(matches!(
            registry.context::<Relay>("sensor"),
            Err(RegistryError::MissingContext(_))
        ));
    }

    #[test]
    fn test_masked_context_is_cataloged() {
        let registry = Registry::new();
        let relays = registry.create_context::<Relay>("relay").unwrap();
        let pumps = registry.create_masked_context(&relays, "pump").unwrap();
        assert_eq!(registry.kinds(), vec!["relay".to_string(), "pump".to_string()]);
        assert_eq!(registry.lookup("pump").unwrap().origin(), Some("relay"));

        pumps.register("p1", Arc::new(Relay(3))).unwrap();
        let via_origin = registry.context::<Relay>("relay").unwrap().get("p1").unwrap();
        assert_eq!(via_origin.0, 3);
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_shutdown_runs_hooks_once() {
        let registry = Registry::new();
        let relays = registry.create_context::<Relay>("relay").unwrap();
        let pumps = registry.create_masked_context(&relays, "pump").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        relays.on_teardown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = pumps;

        assert_eq!(registry.shutdown(), 1);
        assert_eq!(registry.shutdown(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_shut_down());
    }
}
