use crate::context::Device;
use crate::error::{RegistryError, Result};
use std::any::{type_name, Any};
use std::sync::Arc;

/// Call-site argument for a device action: a registered identifier or a live device.
///
/// Composite devices also store their sub-devices as handles. Sub-devices built inline from
/// configuration are always stored as [`Handle::Identifier`] so they resolve through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle<T> {
    Identifier(String),
    Instance(T),
}

impl<T> Handle<T> {
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Handle::Identifier(id) => Some(id),
            Handle::Instance(_) => None,
        }
    }

    pub fn instance(&self) -> Option<&T> {
        match self {
            Handle::Identifier(_) => None,
            Handle::Instance(value) => Some(value),
        }
    }
}

impl<D: ?Sized + Device> Handle<Arc<D>> {
    /// Convert an untyped call-site argument. Accepts `String`, `&'static str`, `Arc<D>` and
    /// `Handle<Arc<D>>`; anything else is `InvalidArgumentType`.
    pub fn from_any(context: &str, value: Box<dyn Any + Send + Sync>) -> Result<Self> {
        Self::try_from_any(value).map_err(|_| RegistryError::InvalidArgumentType {
            context: context.to_string(),
            expected: type_name::<D>(),
        })
    }

    pub(crate) fn try_from_any(
        value: Box<dyn Any + Send + Sync>,
    ) -> core::result::Result<Self, Box<dyn Any + Send + Sync>> {
        let value = match value.downcast::<Self>() {
            Ok(handle) => return Ok(*handle),
            Err(value) => value,
        };
        let value = match value.downcast::<Arc<D>>() {
            Ok(device) => return Ok(Handle::Instance(*device)),
            Err(value) => value,
        };
        let value = match value.downcast::<String>() {
            Ok(id) => return Ok(Handle::Identifier(*id)),
            Err(value) => value,
        };
        value
            .downcast::<&'static str>()
            .map(|id| Handle::Identifier((*id).to_string()))
    }
}

impl<T> From<&str> for Handle<T> {
    fn from(id: &str) -> Self {
        Handle::Identifier(id.to_string())
    }
}

impl<T> From<String> for Handle<T> {
    fn from(id: String) -> Self {
        Handle::Identifier(id)
    }
}

impl<T> From<&String> for Handle<T> {
    fn from(id: &String) -> Self {
        Handle::Identifier(id.clone())
    }
}

impl<T: Clone> From<&Handle<T>> for Handle<T> {
    fn from(handle: &Handle<T>) -> Self {
        handle.clone()
    }
}

impl<D: ?Sized> From<Arc<D>> for Handle<Arc<D>> {
    fn from(device: Arc<D>) -> Self {
        Handle::Instance(device)
    }
}

impl<D: ?Sized> From<&Arc<D>> for Handle<Arc<D>> {
    fn from(device: &Arc<D>) -> Self {
        Handle::Instance(Arc::clone(device))
    }
}
