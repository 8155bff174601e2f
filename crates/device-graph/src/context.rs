use crate::error::{RegistryError, Result};
use crate::handle::Handle;
use crate::registry::{AnyContext, Registry};
use crate::types::Fragment;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Anything a context can hold: shareable across threads and printable in load listings.
pub trait Device: Send + Sync + fmt::Debug + 'static {}

impl<T: ?Sized + Send + Sync + fmt::Debug + 'static> Device for T {}

/// Builds one device from a configuration fragment. Receives the registry so composite
/// builders can hydrate their sub-devices, and the identifier the device is built under.
pub type Parser<D> = Arc<dyn Fn(&Registry, &Fragment, &str) -> Result<Arc<D>> + Send + Sync>;

/// Release hook invoked once when the owning registry shuts down.
pub type Teardown<D> = Arc<dyn Fn(&Context<D>) + Send + Sync>;

pub(crate) enum Entry<D: ?Sized> {
    /// Identifier of another entry in the same backing mapping, resolved on lookup.
    Alias(String),
    Device(Arc<D>),
}

type Store<D> = Arc<RwLock<IndexMap<String, Entry<D>>>>;

struct Inner<D: ?Sized> {
    kind: String,
    origin: Option<String>,
    store: Store<D>,
    realized: RwLock<IndexSet<String>>,
    parser: RwLock<Option<Parser<D>>>,
    masks: RwLock<Vec<Context<D>>>,
    teardown: RwLock<Option<Teardown<D>>>,
}

/// Registry of one device kind.
///
/// `D` is the interface every stored device is viewed through, usually a trait object such as
/// `dyn DigitalOutput`; any implementor coerced into `Arc<D>` is accepted. Cloning a context is
/// cheap and yields another handle to the same registry entry.
pub struct Context<D: ?Sized> {
    inner: Arc<Inner<D>>,
}

impl<D: ?Sized> Clone for Context<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ?Sized + Device> Context<D> {
    pub(crate) fn new(kind: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind: kind.to_string(),
                origin: None,
                store: Arc::new(RwLock::new(IndexMap::new())),
                realized: RwLock::new(IndexSet::new()),
                parser: RwLock::new(None),
                masks: RwLock::new(Vec::new()),
                teardown: RwLock::new(None),
            }),
        }
    }

    /// Derive a mask sharing this context's backing mapping and current parser.
    pub(crate) fn derive_mask(&self, mask: &str) -> Self {
        let derived = Self {
            inner: Arc::new(Inner {
                kind: mask.to_string(),
                origin: Some(self.inner.kind.clone()),
                store: Arc::clone(&self.inner.store),
                realized: RwLock::new(IndexSet::new()),
                parser: RwLock::new(self.inner.parser.read().clone()),
                masks: RwLock::new(Vec::new()),
                teardown: RwLock::new(None),
            }),
        };
        self.inner.masks.write().push(derived.clone());
        derived
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Kind of the context this one masks, if any.
    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    pub fn is_mask(&self) -> bool {
        self.inner.origin.is_some()
    }

    pub fn accepts(&self) -> &'static str {
        type_name::<D>()
    }

    pub fn derived_masks(&self) -> Vec<String> {
        self.inner
            .masks
            .read()
            .iter()
            .map(|m| m.kind().to_string())
            .collect()
    }

    /// True when both handles view the same backing mapping.
    pub fn shares_store_with(&self, other: &Context<D>) -> bool {
        Arc::ptr_eq(&self.inner.store, &other.inner.store)
    }

    /// Install or replace the parser. Derived masks pick up the new parser as well.
    pub fn bind_parser<F>(&self, parser: F)
    where
        F: Fn(&Registry, &Fragment, &str) -> Result<Arc<D>> + Send + Sync + 'static,
    {
        self.install_parser(Arc::new(parser));
    }

    fn install_parser(&self, parser: Parser<D>) {
        *self.inner.parser.write() = Some(Arc::clone(&parser));
        for mask in self.inner.masks.read().iter() {
            mask.install_parser(Arc::clone(&parser));
        }
    }

    pub fn has_parser(&self) -> bool {
        self.inner.parser.read().is_some()
    }

    pub fn on_teardown<F>(&self, hook: F)
    where
        F: Fn(&Context<D>) + Send + Sync + 'static,
    {
        *self.inner.teardown.write() = Some(Arc::new(hook));
    }

    /// Run the bound parser. Does not register the result.
    pub fn parse(
        &self,
        registry: &Registry,
        fragment: &Fragment,
        identifier: &str,
    ) -> Result<Arc<D>> {
        let parser = self
            .inner
            .parser
            .read()
            .clone()
            .ok_or_else(|| RegistryError::MissingParser(self.inner.kind.clone()))?;
        debug!(context = %self.inner.kind, identifier, "parsing device");
        parser(registry, fragment, identifier)
    }

    /// Insert a device, or an alias to another identifier, and mark it realized in this view.
    pub fn register(&self, identifier: &str, value: impl Into<Handle<Arc<D>>>) -> Result<()> {
        let entry = match value.into() {
            Handle::Identifier(target) => Entry::Alias(target),
            Handle::Instance(device) => Entry::Device(device),
        };
        {
            let mut store = self.inner.store.write();
            if store.contains_key(identifier) {
                return Err(RegistryError::DuplicateIdentifier {
                    context: self.inner.kind.clone(),
                    identifier: identifier.to_string(),
                });
            }
            store.insert(identifier.to_string(), entry);
        }
        self.inner.realized.write().insert(identifier.to_string());
        debug!(context = %self.inner.kind, identifier, "registered device");
        Ok(())
    }

    /// Mark an identifier already present in the backing mapping as realized in this view.
    pub fn claim(&self, identifier: &str) -> Result<()> {
        if !self.inner.store.read().contains_key(identifier) {
            return Err(RegistryError::unknown(&self.inner.kind, identifier));
        }
        if self.inner.realized.write().insert(identifier.to_string()) {
            debug!(context = %self.inner.kind, identifier, "claimed device");
        }
        Ok(())
    }

    /// Bind the device stored under `origin_identifier` into this mask as `local`.
    pub fn cast(&self, local: &str, origin_identifier: &str) -> Result<()> {
        let origin = self.inner.origin.as_deref().ok_or_else(|| {
            RegistryError::invalid_fragment(
                &self.inner.kind,
                local,
                "cast directive is only valid for masked contexts",
            )
        })?;
        let device = self
            .follow(origin_identifier)
            .ok_or_else(|| RegistryError::unknown(origin, origin_identifier))?;
        debug!(context = %self.inner.kind, local, origin_identifier, "casting device");
        self.register(local, Handle::Instance(device))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.inner.store.read().contains_key(identifier)
    }

    pub fn is_realized(&self, identifier: &str) -> bool {
        self.inner.realized.read().contains(identifier)
    }

    /// Look up a device through the backing mapping, following aliases.
    pub fn get(&self, identifier: &str) -> Option<Arc<D>> {
        self.follow(identifier)
    }

    fn follow(&self, identifier: &str) -> Option<Arc<D>> {
        let store = self.inner.store.read();
        let mut current = identifier;
        // An alias chain can never be longer than the mapping without revisiting an entry.
        for _ in 0..=store.len() {
            match store.get(current)? {
                Entry::Device(device) => return Some(Arc::clone(device)),
                Entry::Alias(next) => current = next.as_str(),
            }
        }
        None
    }

    /// Resolve an identifier-or-instance argument to the device it names.
    pub fn resolve(&self, handle: &Handle<Arc<D>>) -> Result<Arc<D>> {
        match handle {
            Handle::Instance(device) => Ok(Arc::clone(device)),
            Handle::Identifier(identifier) => self
                .follow(identifier)
                .ok_or_else(|| RegistryError::unknown(&self.inner.kind, identifier)),
        }
    }

    /// Run `action` against the device named by `handle`.
    pub fn act<R>(
        &self,
        handle: impl Into<Handle<Arc<D>>>,
        action: impl FnOnce(&D) -> R,
    ) -> Result<R> {
        let device = self.resolve(&handle.into())?;
        Ok(action(&device))
    }

    /// Realized identifiers of this view, in registration order.
    pub fn identifiers(&self) -> Vec<String> {
        self.inner.realized.read().iter().cloned().collect()
    }

    /// Realized devices of this view, in registration order.
    pub fn devices(&self) -> Vec<(String, Arc<D>)> {
        self.identifiers()
            .into_iter()
            .filter_map(|id| self.follow(&id).map(|device| (id, device)))
            .collect()
    }

    /// Every device in the backing mapping, whichever view realized it. Aliases are skipped.
    pub fn stored(&self) -> Vec<(String, Arc<D>)> {
        self.inner
            .store
            .read()
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Device(device) => Some((id.clone(), Arc::clone(device))),
                Entry::Alias(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.realized.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the teardown hook, if one was installed on this context.
    pub fn teardown(&self) -> bool {
        let hook = self.inner.teardown.read().clone();
        match hook {
            Some(hook) => {
                debug!(context = %self.inner.kind, "running teardown hook");
                hook(self);
                true
            }
            None => false,
        }
    }
}

impl<D: ?Sized + Device> fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("accepts", &type_name::<D>())
            .field("realized", &self.len())
            .finish()
    }
}

impl<D: ?Sized + Device> AnyContext for Context<D> {
    fn kind(&self) -> &str {
        Context::kind(self)
    }

    fn origin(&self) -> Option<&str> {
        Context::origin(self)
    }

    fn accepts(&self) -> &'static str {
        Context::accepts(self)
    }

    fn derived_masks(&self) -> Vec<String> {
        Context::derived_masks(self)
    }

    fn len(&self) -> usize {
        Context::len(self)
    }

    fn identifiers(&self) -> Vec<String> {
        Context::identifiers(self)
    }

    fn describe(&self) -> Vec<(String, String)> {
        Context::devices(self)
            .into_iter()
            .map(|(id, device)| (id, format!("{device:?}")))
            .collect()
    }

    fn contains(&self, identifier: &str) -> bool {
        Context::contains(self, identifier)
    }

    fn register_any(&self, identifier: &str, value: Box<dyn Any + Send + Sync>) -> Result<()> {
        let handle = Handle::<Arc<D>>::try_from_any(value).map_err(|_| RegistryError::TypeMismatch {
            context: self.inner.kind.clone(),
            expected: type_name::<D>(),
            found: "a value of another type".to_string(),
        })?;
        Context::register(self, identifier, handle)
    }

    fn load_entry(&self, registry: &Registry, identifier: &str, fragment: &Fragment) -> Result<()> {
        let device = Context::parse(self, registry, fragment, identifier)?;
        Context::register(self, identifier, Handle::Instance(device))
    }

    fn cast(&self, local: &str, origin_identifier: &str) -> Result<()> {
        Context::cast(self, local, origin_identifier)
    }

    fn teardown(&self) -> bool {
        Context::teardown(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Lamp {
        pin: u8,
    }

    fn lamps() -> Context<Lamp> {
        Context::new("lamp")
    }

    #[test]
    fn test_register_and_get() {
        let ctx = lamps();
        ctx.register("porch", Arc::new(Lamp { pin: 4 })).unwrap();
        assert!(ctx.is_realized("porch"));
        assert_eq!(ctx.get("porch").unwrap().pin, 4);
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_duplicate_keeps_original_binding() {
        let ctx = lamps();
        let first = Arc::new(Lamp { pin: 4 });
        ctx.register("porch", Arc::clone(&first)).unwrap();
        let err = ctx.register("porch", Arc::new(Lamp { pin: 5 })).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentifier { .. }));
        assert!(Arc::ptr_eq(&ctx.get("porch").unwrap(), &first));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_alias_resolves_to_target() {
        let ctx = lamps();
        ctx.register("porch", Arc::new(Lamp { pin: 4 })).unwrap();
        ctx.register("front", "porch").unwrap();
        let a = ctx.get("porch").unwrap();
        let b = ctx.resolve(&Handle::from("front")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_alias_cycle_is_unknown() {
        let ctx = lamps();
        ctx.register("a", "b").unwrap();
        ctx.register("b", "a").unwrap();
        let err = ctx.resolve(&Handle::from("a")).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownIdentifier { .. }));
    }

    #[test]
    fn test_resolve_unknown_identifier() {
        let ctx = lamps();
        let err = ctx.act("nowhere", |lamp| lamp.pin).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownIdentifier { .. }));
    }

    #[test]
    fn test_mask_shares_store_but_not_realized() {
        let origin = lamps();
        let mask = origin.derive_mask("night_light");
        assert!(mask.shares_store_with(&origin));
        assert_eq!(origin.derived_masks(), vec!["night_light".to_string()]);

        mask.register("hall", Arc::new(Lamp { pin: 9 })).unwrap();
        assert!(Arc::ptr_eq(
            &origin.get("hall").unwrap(),
            &mask.get("hall").unwrap()
        ));
        assert!(mask.is_realized("hall"));
        assert!(!origin.is_realized("hall"));

        // the shared mapping already holds the key
        assert!(origin.register("hall", Arc::new(Lamp { pin: 1 })).is_err());
    }

    #[test]
    fn test_parser_binding_propagates_to_masks() {
        let registry = Registry::new();
        let origin = lamps();
        let mask = origin.derive_mask("night_light");
        let nested = mask.derive_mask("reading_light");
        assert!(!nested.has_parser());

        origin.bind_parser(|_, fragment, _| {
            let pin = fragment.as_u64().unwrap_or_default() as u8;
            Ok(Arc::new(Lamp { pin }))
        });
        let lamp = nested
            .parse(&registry, &Fragment::from(12u64), "desk")
            .unwrap();
        assert_eq!(lamp.pin, 12);
    }

    #[test]
    fn test_parse_without_parser() {
        let registry = Registry::new();
        let err = lamps().parse(&registry, &Fragment::Null, "x").unwrap_err();
        assert!(matches!(err, RegistryError::MissingParser(_)));
    }

    #[test]
    fn test_cast_and_claim() {
        let origin = lamps();
        let mask = origin.derive_mask("night_light");
        origin.register("porch", Arc::new(Lamp { pin: 4 })).unwrap();

        mask.cast("outside", "porch").unwrap();
        assert!(Arc::ptr_eq(
            &mask.get("outside").unwrap(),
            &origin.get("porch").unwrap()
        ));
        assert!(matches!(
            mask.cast("x", "missing"),
            Err(RegistryError::UnknownIdentifier { .. })
        ));
        assert!(matches!(
            origin.cast("x", "porch"),
            Err(RegistryError::InvalidFragment { .. })
        ));

        mask.claim("porch").unwrap();
        assert!(mask.is_realized("porch"));
        assert!(mask.claim("missing").is_err());
    }

    #[test]
    fn test_register_any_type_gating() {
        let ctx = lamps();
        let erased: &dyn AnyContext = &ctx;
        erased
            .register_any("a", Box::new(Arc::new(Lamp { pin: 1 })))
            .unwrap();
        erased.register_any("b", Box::new("a")).unwrap();
        erased.register_any("c", Box::new("a".to_string())).unwrap();
        let err = erased.register_any("d", Box::new(42u32)).unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
        assert!(!ctx.contains("d"));
    }

    #[test]
    fn test_teardown_runs_hook() {
        let ctx = lamps();
        assert!(!ctx.teardown());
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.register("porch", Arc::new(Lamp { pin: 4 })).unwrap();
        ctx.on_teardown(move |c| sink.write().extend(c.identifiers()));
        assert!(ctx.teardown());
        assert_eq!(*seen.read(), vec!["porch".to_string()]);
    }
}
