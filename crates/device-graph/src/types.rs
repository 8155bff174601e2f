use crate::error::{RegistryError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Raw configuration fragment handed to a parser.
pub type Fragment = serde_yaml::Value;

/// Ordered configuration document: context name -> identifier -> fragment.
pub type Document = serde_yaml::Mapping;

/// Decode a fragment into a typed configuration struct.
pub fn decode<T: DeserializeOwned>(
    context: &str,
    identifier: &str,
    fragment: &Fragment,
) -> Result<T> {
    serde_yaml::from_value(fragment.clone())
        .map_err(|e| RegistryError::invalid_fragment(context, identifier, e.to_string()))
}

/// Configuration of a single GPIO line: either a bare BCM pin number or a detailed mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(untagged)]
pub enum PinConfig {
    Number(u8),
    Detailed {
        pin: u8,
        #[serde(default)]
        initial: Option<f32>,
        #[serde(default)]
        active_high: Option<bool>,
    },
}

impl PinConfig {
    pub fn pin(&self) -> u8 {
        match self {
            PinConfig::Number(pin) => *pin,
            PinConfig::Detailed { pin, .. } => *pin,
        }
    }

    pub fn initial(&self) -> f32 {
        match self {
            PinConfig::Number(_) => 0.0,
            PinConfig::Detailed { initial, .. } => initial.unwrap_or(0.0),
        }
    }

    pub fn active_high(&self) -> bool {
        match self {
            PinConfig::Number(_) => true,
            PinConfig::Detailed { active_high, .. } => active_high.unwrap_or(true),
        }
    }
}
