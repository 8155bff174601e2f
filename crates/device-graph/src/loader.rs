use crate::error::{RegistryError, Result};
use crate::metrics::MetricsHub;
use crate::registry::{AnyContext, Registry};
use crate::types::{Document, Fragment};
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Reserved identifier holding a mask's block cast directive.
pub const CAST_DIRECTIVE: &str = "__cast";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yml" | "yaml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Registry state after a load pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub contexts: usize,
    /// Entries processed by this pass.
    pub entries: usize,
    /// Realized devices per context, in catalog order.
    pub devices: IndexMap<String, usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<String>,
}

impl LoadSummary {
    pub fn total_devices(&self) -> usize {
        self.devices.values().sum()
    }

    fn merge(&mut self, later: LoadSummary) {
        self.entries += later.entries;
        self.skipped.extend(later.skipped);
        self.contexts = later.contexts;
        self.devices = later.devices;
        self.loaded_at = later.loaded_at;
    }
}

pub fn parse_document(text: &str, format: DocumentFormat) -> anyhow::Result<Document> {
    let value: Fragment = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(text).context("parsing yaml")?,
        DocumentFormat::Json => {
            let json: serde_json::Value = serde_json::from_str(text).context("parsing json")?;
            serde_yaml::to_value(json).context("converting json document")?
        }
    };
    match value {
        Fragment::Mapping(doc) => Ok(doc),
        Fragment::Null => Ok(Document::new()),
        _ => anyhow::bail!("configuration document must be a mapping of context names"),
    }
}

pub fn read_document(path: impl AsRef<Path>) -> anyhow::Result<Document> {
    let path = path.as_ref();
    let format = DocumentFormat::from_path(path)
        .with_context(|| format!("unsupported document extension: {}", path.display()))?;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading document: {}", path.display()))?;
    parse_document(&raw, format).with_context(|| format!("decoding document: {}", path.display()))
}

/// Drives parsing and registration of a configuration document, in document order.
///
/// Loading is single pass: an identifier must be declared before anything references it.
pub struct Loader<'r> {
    registry: &'r Registry,
    metrics: Option<&'r MetricsHub>,
}

impl<'r> Loader<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'r MetricsHub) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn load_document(&self, doc: &Document) -> Result<LoadSummary> {
        info!("configuring devices");
        let mut entries = 0;
        let mut skipped = Vec::new();
        for (key, section) in doc {
            let kind = key.as_str().ok_or_else(|| {
                RegistryError::InvalidDocument(format!(
                    "context names must be strings, got {key:?}"
                ))
            })?;
            let Some(ctx) = self.registry.lookup(kind) else {
                warn!(context = kind, "context not found, skipping section");
                skipped.push(kind.to_string());
                continue;
            };
            entries += self.load_section(ctx.as_ref(), kind, section)?;
        }
        let summary = self.summarize(entries, skipped);
        self.report(&summary);
        Ok(summary)
    }

    fn load_section(&self, ctx: &dyn AnyContext, kind: &str, section: &Fragment) -> Result<usize> {
        let entries = match section {
            Fragment::Mapping(entries) => entries,
            Fragment::Null => return Ok(0),
            _ => {
                return Err(RegistryError::InvalidDocument(format!(
                    "section `{kind}` must map identifiers to fragments"
                )))
            }
        };
        let mut count = 0;
        for (id, fragment) in entries {
            let id = id.as_str().ok_or_else(|| {
                RegistryError::InvalidDocument(format!(
                    "section `{kind}`: identifiers must be strings, got {id:?}"
                ))
            })?;
            if id == CAST_DIRECTIVE {
                count += apply_casts(ctx, fragment)?;
                continue;
            }
            debug!(context = kind, identifier = id, "configuring device");
            match fragment {
                Fragment::String(origin_id) if ctx.is_mask() => ctx.cast(id, origin_id)?,
                _ => ctx.load_entry(self.registry, id, fragment)?,
            }
            count += 1;
        }
        Ok(count)
    }

    fn summarize(&self, entries: usize, skipped: Vec<String>) -> LoadSummary {
        let devices = self
            .registry
            .contexts()
            .iter()
            .map(|ctx| (ctx.kind().to_string(), ctx.len()))
            .collect();
        LoadSummary {
            contexts: self.registry.len(),
            entries,
            devices,
            skipped,
            loaded_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        }
    }

    fn report(&self, summary: &LoadSummary) {
        info!("device configuration complete");
        info!("total of {} device contexts configured", summary.contexts);
        debug!("device contexts:\n{}", self.registry.kinds().join("\n"));
        info!("total of {} devices configured", summary.total_devices());
        for ctx in self.registry.contexts() {
            let listing: Vec<String> = ctx
                .describe()
                .into_iter()
                .map(|(id, device)| format!("\t\"{id}\": {device}"))
                .collect();
            debug!("\"{}\":\n{}", ctx.kind(), listing.join("\n"));
        }
        if let Some(metrics) = self.metrics {
            metrics.observe(summary);
        }
    }

    pub fn load_str(&self, text: &str, format: DocumentFormat) -> anyhow::Result<LoadSummary> {
        let doc = parse_document(text, format)?;
        Ok(self.load_document(&doc)?)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> anyhow::Result<LoadSummary> {
        let path = path.as_ref();
        let doc = read_document(path)?;
        self.load_document(&doc)
            .with_context(|| format!("configuring devices from {}", path.display()))
    }

    /// Load every `.yml`, `.yaml` and `.json` document in `dir`, in file name order.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> anyhow::Result<LoadSummary> {
        let dir = dir.as_ref();
        let mut entries: Vec<PathBuf> = Vec::new();
        for entry in
            fs::read_dir(dir).with_context(|| format!("reading directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if DocumentFormat::from_path(&path).is_some() {
                entries.push(path);
            }
        }
        entries.sort();
        let mut summary: Option<LoadSummary> = None;
        for p in entries {
            let next = self.load_file(&p)?;
            match summary.as_mut() {
                Some(total) => total.merge(next),
                None => summary = Some(next),
            }
        }
        match summary {
            Some(summary) => Ok(summary),
            None => Ok(self.summarize(0, Vec::new())),
        }
    }

    /// Load `path` and return a guard that releases every device when dropped.
    ///
    /// A failed load releases whatever was built before the failure.
    pub fn load_scoped(&self, path: impl AsRef<Path>) -> anyhow::Result<Session<'r>> {
        self.scoped(|loader| loader.load_file(path))
    }

    /// Directory form of [`Loader::load_scoped`].
    pub fn load_dir_scoped(&self, dir: impl AsRef<Path>) -> anyhow::Result<Session<'r>> {
        self.scoped(|loader| loader.load_dir(dir))
    }

    fn scoped(
        &self,
        load: impl FnOnce(&Self) -> anyhow::Result<LoadSummary>,
    ) -> anyhow::Result<Session<'r>> {
        match load(self) {
            Ok(summary) => Ok(Session {
                registry: self.registry,
                summary,
            }),
            Err(err) => {
                warn!("configuration failed, releasing devices built so far");
                self.registry.shutdown();
                Err(err)
            }
        }
    }
}

fn apply_casts(ctx: &dyn AnyContext, directive: &Fragment) -> Result<usize> {
    let casts = directive.as_mapping().ok_or_else(|| {
        RegistryError::invalid_fragment(
            ctx.kind(),
            CAST_DIRECTIVE,
            "cast directive must map local names to identifiers",
        )
    })?;
    for (local, origin_id) in casts {
        let local = local.as_str().ok_or_else(|| {
            RegistryError::invalid_fragment(
                ctx.kind(),
                CAST_DIRECTIVE,
                "local names must be strings",
            )
        })?;
        let origin_id = origin_id.as_str().ok_or_else(|| {
            RegistryError::invalid_fragment(ctx.kind(), local, "cast target must be an identifier")
        })?;
        ctx.cast(local, origin_id)?;
    }
    Ok(casts.len())
}

/// Exit phase of a load: runs every context's teardown hook when dropped.
pub struct Session<'r> {
    registry: &'r Registry,
    summary: LoadSummary,
}

impl<'r> Session<'r> {
    pub fn summary(&self) -> &LoadSummary {
        &self.summary
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Pin {
        number: u8,
        on: AtomicBool,
    }

    fn pin_registry() -> Registry {
        let registry = Registry::new();
        let pins = registry
            .create_context_with("output_pin", |_, fragment, identifier| {
                let number: u8 = decode("output_pin", identifier, fragment)?;
                Ok(Arc::new(Pin {
                    number,
                    on: AtomicBool::new(false),
                }))
            })
            .unwrap();
        registry.create_masked_context(&pins, "valve").unwrap();
        registry
    }

    fn load(registry: &Registry, text: &str) -> Result<LoadSummary> {
        let doc = parse_document(text, DocumentFormat::Yaml).unwrap();
        Loader::new(registry).load_document(&doc)
    }

    #[test]
    fn test_valve_casts_generic_pin() {
        let registry = pin_registry();
        let summary = Loader::new(&registry)
            .load_str(
                r#"{"output_pin": {"pin7": 7}, "valve": {"intake": "pin7"}}"#,
                DocumentFormat::Json,
            )
            .unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.devices["output_pin"], 1);
        assert_eq!(summary.devices["valve"], 1);

        let pins = registry.context::<Pin>("output_pin").unwrap();
        let valves = registry.context::<Pin>("valve").unwrap();
        let intake = valves.get("intake").unwrap();
        assert!(Arc::ptr_eq(&intake, &pins.get("pin7").unwrap()));
        assert_eq!(intake.number, 7);

        valves
            .act("intake", |p| p.on.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(pins.get("pin7").unwrap().on.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cast_block_directive() {
        let registry = pin_registry();
        load(
            &registry,
            "output_pin: { a: 1, b: 2 }\nvalve:\n  __cast: { exhaust: a, intake: b }\n  spare: 9\n",
        )
        .unwrap();
        let valves = registry.context::<Pin>("valve").unwrap();
        assert_eq!(
            valves.identifiers(),
            vec!["exhaust".to_string(), "intake".to_string(), "spare".to_string()]
        );
        assert_eq!(valves.get("intake").unwrap().number, 2);
    }

    #[test]
    fn test_cast_needs_mask() {
        let registry = pin_registry();
        let err = load(&registry, "output_pin:\n  __cast: { x: y }\n").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidFragment { .. }));
    }

    #[test]
    fn test_forward_reference_fails() {
        let registry = pin_registry();
        let doc = "valve: { intake: pin7 }\noutput_pin: { pin7: 7 }\n";
        let err = load(&registry, doc).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownIdentifier { .. }));

        let registry = pin_registry();
        assert!(load(&registry, "output_pin: { pin7: 7 }\nvalve: { intake: pin7 }\n").is_ok());
    }

    #[test]
    fn test_unknown_section_is_skipped() {
        let registry = pin_registry();
        let summary = load(&registry, "latch: { l1: {} }\noutput_pin: { p: 3 }\n").unwrap();
        assert_eq!(summary.skipped, vec!["latch".to_string()]);
        assert_eq!(summary.total_devices(), 1);
    }

    #[test]
    fn test_duplicate_identifier_aborts_load() {
        let registry = pin_registry();
        let err = load(&registry, "output_pin: { p: 3 }\nvalve: { p: 4 }\n").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentifier { .. }));
        let pins = registry.context::<Pin>("output_pin").unwrap();
        assert_eq!(pins.get("p").unwrap().number, 3);
    }

    #[test]
    fn test_malformed_documents() {
        let registry = pin_registry();
        assert!(matches!(
            load(&registry, "output_pin: [1, 2]\n"),
            Err(RegistryError::InvalidDocument(_))
        ));
        assert!(parse_document("- a\n- b\n", DocumentFormat::Yaml).is_err());
    }

    #[test]
    fn test_json_document_keeps_order() {
        let doc = parse_document(
            r#"{"zeta": {}, "alpha": {}, "mid": {}}"#,
            DocumentFormat::Json,
        )
        .unwrap();
        let keys: Vec<&str> = doc.keys().filter_map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_session_runs_teardown_on_drop() {
        let registry = pin_registry();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        registry
            .context::<Pin>("output_pin")
            .unwrap()
            .on_teardown(move |ctx| {
                counter.fetch_add(ctx.len(), Ordering::SeqCst);
            });

        let dir = std::env::temp_dir().join(format!("dg-session-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pins.yaml");
        fs::write(&path, "output_pin: { a: 1, b: 2 }\n").unwrap();
        {
            let session = Loader::new(&registry).load_scoped(&path).unwrap();
            assert_eq!(session.summary().total_devices(), 2);
            assert_eq!(released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_scoped_load_releases_devices() {
        let registry = pin_registry();
        let pins = registry.context::<Pin>("output_pin").unwrap();
        pins.on_teardown(|ctx| {
            for (_, pin) in ctx.stored() {
                pin.on.store(false, Ordering::SeqCst);
            }
        });
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        pins.bind_parser(move |_, fragment, identifier| {
            let number: u8 = decode("output_pin", identifier, &fragment["pin"])?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Pin {
                number,
                on: AtomicBool::new(true),
            }))
        });

        let dir = std::env::temp_dir().join(format!("dg-failed-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pump.yaml");
        fs::write(
            &path,
            "output_pin: { pump: { pin: 13 } }\nvalve: { pump: { pin: 5 } }\n",
        )
        .unwrap();

        let err = Loader::new(&registry).load_scoped(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::DuplicateIdentifier { .. })
        ));
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(registry.is_shut_down());
        assert!(!pins.get("pump").unwrap().on.load(Ordering::SeqCst));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_dir_in_name_order() {
        let registry = pin_registry();
        let dir = std::env::temp_dir().join(format!("dg-dir-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("20-valves.yaml"), "valve: { intake: p1 }\n").unwrap();
        fs::write(dir.join("10-pins.json"), r#"{"output_pin": {"p1": 4}}"#).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let summary = Loader::new(&registry).load_dir(&dir).unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.devices["valve"], 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
