use crate::loader::LoadSummary;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct GraphMetrics {
    pub contexts: IntGauge,
    pub devices_loaded: IntGauge,
    pub context_devices: IntGaugeVec,
    pub sections_skipped: IntCounter,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub graph: GraphMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let contexts = IntGauge::new("dg_contexts", "Number of device contexts in the catalog")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let devices_loaded =
            IntGauge::new("dg_devices_loaded", "Number of realized devices across contexts")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let context_devices = IntGaugeVec::new(
            Opts::new("dg_context_devices", "Realized devices per context"),
            &["context"],
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let sections_skipped = IntCounter::new(
            "dg_sections_skipped",
            "Configuration sections naming no known context",
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let graph = GraphMetrics {
            contexts,
            devices_loaded,
            context_devices,
            sections_skipped,
        };
        let _ = registry.register(Box::new(graph.contexts.clone()));
        let _ = registry.register(Box::new(graph.devices_loaded.clone()));
        let _ = registry.register(Box::new(graph.context_devices.clone()));
        let _ = registry.register(Box::new(graph.sections_skipped.clone()));
        Ok(Self { registry, graph })
    }

    /// Record the registry state reported by a load pass.
    pub fn observe(&self, summary: &LoadSummary) {
        self.graph.contexts.set(summary.contexts as i64);
        self.graph
            .devices_loaded
            .set(summary.total_devices() as i64);
        for (context, count) in &summary.devices {
            self.graph
                .context_devices
                .with_label_values(&[context.as_str()])
                .set(*count as i64);
        }
        self.graph
            .sections_skipped
            .inc_by(summary.skipped.len() as u64);
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
