//! Construction helpers for composite devices.
//!
//! A composite (a muscle made of a valve and a pressure switch, a motor made of PWM and direction
//! pins) declares each sub-device as a field resolved through another context. The field may name
//! a device declared earlier, carry a live device, or hold an inline fragment that is built on the
//! spot and registered under `{owner}.{field}`.

use crate::context::{Context, Device};
use crate::error::{RegistryError, Result};
use crate::handle::Handle;
use crate::registry::Registry;
use crate::types::{decode, Fragment};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Value supplied for a sub-device field.
#[derive(Debug, Clone)]
pub enum FieldSource<D: ?Sized> {
    Identifier(String),
    Instance(Arc<D>),
    Inline(Fragment),
}

impl<D: ?Sized> From<Fragment> for FieldSource<D> {
    fn from(fragment: Fragment) -> Self {
        match fragment {
            Fragment::String(id) => FieldSource::Identifier(id),
            other => FieldSource::Inline(other),
        }
    }
}

impl<D: ?Sized> From<Handle<Arc<D>>> for FieldSource<D> {
    fn from(handle: Handle<Arc<D>>) -> Self {
        match handle {
            Handle::Identifier(id) => FieldSource::Identifier(id),
            Handle::Instance(device) => FieldSource::Instance(device),
        }
    }
}

/// Key an inline sub-device is registered under.
pub fn derived_key(owner: &str, field: &str) -> String {
    format!("{owner}.{field}")
}

/// Resolve one sub-device field of the composite `owner` through `target`.
pub fn hydrate<D: ?Sized + Device>(
    registry: &Registry,
    target: &Context<D>,
    owner: &str,
    field: &str,
    source: FieldSource<D>,
) -> Result<Handle<Arc<D>>> {
    match source {
        FieldSource::Identifier(id) => {
            if !target.is_realized(&id) {
                target.claim(&id)?;
            }
            Ok(Handle::Identifier(id))
        }
        FieldSource::Instance(device) => Ok(Handle::Instance(device)),
        FieldSource::Inline(fragment) => {
            let key = derived_key(owner, field);
            // fail before touching hardware in the parser
            if target.contains(&key) {
                return Err(RegistryError::DuplicateIdentifier {
                    context: target.kind().to_string(),
                    identifier: key,
                });
            }
            let device = target.parse(registry, &fragment, &key)?;
            target.register(&key, Handle::Instance(device))?;
            debug!(context = target.kind(), owner, field, key = %key, "built inline sub-device");
            Ok(Handle::Identifier(key))
        }
    }
}

/// Field-by-field reader over a composite's mapping fragment.
///
/// ```ignore
/// let mut h = Hydrator::new(registry, "muscle", fragment, identifier)?;
/// let valve = h.reference("valve", &valves)?;
/// let stroke: f32 = h.value_or_default("stroke")?;
/// h.finish()?;
/// ```
pub struct Hydrator<'a> {
    registry: &'a Registry,
    context: &'a str,
    identifier: &'a str,
    fields: serde_yaml::Mapping,
}

impl<'a> Hydrator<'a> {
    pub fn new(
        registry: &'a Registry,
        context: &'a str,
        fragment: &Fragment,
        identifier: &'a str,
    ) -> Result<Self> {
        let fields = match fragment {
            Fragment::Mapping(map) => map.clone(),
            Fragment::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(RegistryError::invalid_fragment(
                    context,
                    identifier,
                    "expected a mapping of fields",
                ))
            }
        };
        Ok(Self {
            registry,
            context,
            identifier,
            fields,
        })
    }

    /// Identifier the composite is being built under.
    pub fn identifier(&self) -> &str {
        self.identifier
    }

    fn take(&mut self, field: &str) -> Option<Fragment> {
        self.fields.remove(field)
    }

    fn missing(&self, field: &str) -> RegistryError {
        RegistryError::invalid_fragment(
            self.context,
            self.identifier,
            format!("missing field `{field}`"),
        )
    }

    /// Required sub-device field resolved through `target`.
    pub fn reference<D: ?Sized + Device>(
        &mut self,
        field: &str,
        target: &Context<D>,
    ) -> Result<Handle<Arc<D>>> {
        match self.optional_reference(field, target)? {
            Some(handle) => Ok(handle),
            None => Err(self.missing(field)),
        }
    }

    pub fn optional_reference<D: ?Sized + Device>(
        &mut self,
        field: &str,
        target: &Context<D>,
    ) -> Result<Option<Handle<Arc<D>>>> {
        match self.take(field) {
            None | Some(Fragment::Null) => Ok(None),
            Some(value) => hydrate(
                self.registry,
                target,
                self.identifier,
                field,
                FieldSource::from(value),
            )
            .map(Some),
        }
    }

    /// Required plain field.
    pub fn value<T: DeserializeOwned>(&mut self, field: &str) -> Result<T> {
        let value = self.take(field).ok_or_else(|| self.missing(field))?;
        decode(self.context, self.identifier, &value)
    }

    pub fn value_or_default<T: DeserializeOwned + Default>(&mut self, field: &str) -> Result<T> {
        match self.take(field) {
            None | Some(Fragment::Null) => Ok(T::default()),
            Some(value) => decode(self.context, self.identifier, &value),
        }
    }

    /// Reject any field outside `known` before sub-devices are built.
    ///
    /// Inline children are registered as each reference is read, and stay registered if the
    /// builder fails afterwards. Checking field names first keeps a typo from claiming keys.
    pub fn allow(&self, known: &[&str]) -> Result<()> {
        self.reject(|key| !known.contains(&key))
    }

    /// Reject fields the builder did not consume.
    pub fn finish(self) -> Result<()> {
        self.reject(|_| true)
    }

    fn reject(&self, unexpected: impl Fn(&str) -> bool) -> Result<()> {
        let names: Vec<String> = self
            .fields
            .keys()
            .map(|k| match k.as_str() {
                Some(s) => s.to_string(),
                None => format!("{k:?}"),
            })
            .filter(|name| unexpected(name))
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        Err(RegistryError::invalid_fragment(
            self.context,
            self.identifier,
            format!("unexpected field(s): {}", names.join(", ")),
        ))
    }
}
