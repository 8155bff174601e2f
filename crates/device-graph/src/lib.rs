//! device-graph: configuration-driven device registry and object-graph resolution

mod error;
pub use error::{RegistryError, Result};

mod context;
pub use context::{Context, Device, Parser, Teardown};

mod handle;
pub use handle::Handle;

mod registry;
pub use registry::{AnyContext, Registry};

mod types;
pub use types::*;

mod hydrate;
pub use hydrate::{derived_key, hydrate, FieldSource, Hydrator};

mod loader;
pub use loader::{
    parse_document, read_document, DocumentFormat, LoadSummary, Loader, Session, CAST_DIRECTIVE,
};

mod metrics;
pub use metrics::{GraphMetrics, MetricsHub};

mod devices;
pub use devices::{DigitalInput, DigitalOutput, EdgeCallback, PwmOutput};

#[cfg(feature = "sim")]
mod sim;
#[cfg(feature = "sim")]
pub use sim::{SimInputPin, SimOutputPin, SimPwmPin};

pub mod stock;
