//! Scan and resolve orchestration.
//!
//! A run has three phases:
//!
//! 1. **scan**: open every selected destination through the resource layer,
//!    unpack archives to a working directory, walk directories and collect
//!    the descriptors matching the descriptor patterns with their
//!    placeholders
//! 2. **resolve**: look every placeholder up in the user properties, then
//!    the shared properties (earlier files win), then ask interactively as
//!    the [`InteractiveMode`] allows
//! 3. **apply**: substitute and write back (in place, into an output
//!    directory, or not at all), repacking or exploding archives
//!
//! Destinations scan in parallel on a bounded pool; directory walks fan out
//! on a second pool so a wide remote tree cannot starve other destinations.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = ConfigRuntime::new(manager, RuntimeOptions {
//!     destinations: vec!["/srv/app/".into()],
//!     user_properties: Some("~/antx.properties".into()),
//!     strict: true,
//!     ..Default::default()
//! })?;
//! let report = runtime.run();
//! std::process::exit(if report.succeeded() { 0 } else { 1 });
//! ```

pub mod interaction;
pub mod package;
pub mod placeholder;
pub mod report;
pub mod scan;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::charset::Charset;
use crate::pattern::PatternSet;
use crate::props::{Properties, PropertiesError};
use crate::resource::{Resource, ResourceError, ResourceManager, ResourceRef, ResourceUri, Scheme};
pub use interaction::{InteractionHandler, InteractiveMode, NoInteraction, PromptPolicy, ValueRequest};
pub use package::PackageType;
pub use report::{DestinationFailure, EntrySummary, FailureStage, RunReport, RuntimeError, ValueSource};
pub use scan::{ConfigEntry, DestinationKind, ScannedDestination};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_LISTING_CONCURRENCY: usize = 8;

/// Where substituted descriptors go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Write back through the resource layer.
    #[default]
    InPlace,
    /// Write below this directory, one subdirectory per destination.
    Directory(PathBuf),
    /// Resolve and report only.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub destinations: Vec<String>,
    pub descriptor_patterns: PatternSet,
    pub package_patterns: PatternSet,
    /// Overrides type detection for every destination.
    pub declared_type: Option<PackageType>,
    pub user_properties: Option<String>,
    pub shared_properties: Vec<String>,
    pub interactive: InteractiveMode,
    pub strict: bool,
    /// Charset for property files; `None` uses each resource's own.
    pub charset: Option<Charset>,
    pub output: OutputMode,
    /// Explode archives after substitution instead of repacking them.
    pub explode: bool,
    pub workers: usize,
    pub listing_concurrency: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            descriptor_patterns: PatternSet::all(),
            package_patterns: PatternSet::all(),
            declared_type: None,
            user_properties: None,
            shared_properties: Vec::new(),
            interactive: InteractiveMode::Auto,
            strict: false,
            charset: None,
            output: OutputMode::InPlace,
            explode: false,
            workers: DEFAULT_WORKERS,
            listing_concurrency: DEFAULT_LISTING_CONCURRENCY,
        }
    }
}

/// Output of [`ConfigRuntime::scan`].
#[derive(Debug, Default)]
pub struct ScanResult {
    pub destinations: Vec<ScannedDestination>,
    pub skipped: Vec<String>,
    pub failures: Vec<DestinationFailure>,
    /// Number of destinations selected by the package patterns.
    pub selected: usize,
}

impl ScanResult {
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.destinations.iter().flat_map(|d| d.entries.iter())
    }

    /// Placeholder names mapped to the descriptors that reference them.
    pub fn placeholders(&self) -> BTreeMap<String, Vec<String>> {
        let mut names: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.entries() {
            for name in &entry.placeholders {
                names
                    .entry(name.clone())
                    .or_default()
                    .push(entry.relative_path.clone());
            }
        }
        names
    }
}

/// Output of [`ConfigRuntime::resolve`].
#[derive(Default)]
pub struct Resolution {
    values: BTreeMap<String, (String, ValueSource)>,
    pub undefined: BTreeSet<String>,
    pub failures: Vec<DestinationFailure>,
}

impl Resolution {
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|(v, _)| v.as_str())
    }

    pub fn source(&self, name: &str) -> Option<ValueSource> {
        self.values.get(name).map(|(_, s)| *s)
    }

    pub fn sources(&self) -> BTreeMap<String, ValueSource> {
        self.values
            .iter()
            .map(|(name, (_, source))| (name.clone(), *source))
            .collect()
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("resolved", &self.values.keys().collect::<Vec<_>>())
            .field("undefined", &self.undefined)
            .field("failures", &self.failures.len())
            .finish()
    }
}

/// Output of [`ConfigRuntime::apply`].
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub written: Vec<String>,
    pub failures: Vec<DestinationFailure>,
}

pub struct ConfigRuntime {
    manager: Arc<ResourceManager>,
    options: RuntimeOptions,
    interaction: Arc<dyn InteractionHandler>,
    is_terminal: bool,
    scan_pool: ThreadPool,
    listing_pool: ThreadPool,
}

impl ConfigRuntime {
    pub fn new(manager: Arc<ResourceManager>, options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let scan_pool = ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .thread_name(|i| format!("autoconfig-scan-{i}"))
            .build()?;
        let listing_pool = ThreadPoolBuilder::new()
            .num_threads(options.listing_concurrency.max(1))
            .thread_name(|i| format!("autoconfig-list-{i}"))
            .build()?;
        Ok(Self {
            manager,
            options,
            interaction: Arc::new(NoInteraction),
            is_terminal: std::io::stdin().is_terminal(),
            scan_pool,
            listing_pool,
        })
    }

    pub fn with_interaction(mut self, handler: Arc<dyn InteractionHandler>) -> Self {
        self.interaction = handler;
        self
    }

    /// Override terminal detection for [`InteractiveMode::Auto`].
    pub fn with_terminal(mut self, is_terminal: bool) -> Self {
        self.is_terminal = is_terminal;
        self
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Scan, resolve and apply. Sessions stay open; the caller owns the
    /// [`ResourceManager`] and closes it.
    pub fn run(&self) -> RunReport {
        let started = Instant::now();
        info!(
            destinations = self.options.destinations.len(),
            interactive = %self.options.interactive,
            strict = self.options.strict,
            "starting run"
        );

        let scan = self.scan();
        let resolution = self.resolve(&scan);

        let blocked = self.options.strict && !resolution.undefined.is_empty();
        let applied = if blocked {
            warn!(
                undefined = resolution.undefined.len(),
                "strict mode: undefined placeholders, nothing written"
            );
            ApplyOutcome::default()
        } else {
            if !resolution.undefined.is_empty() {
                let names: Vec<&str> = resolution.undefined.iter().map(String::as_str).collect();
                warn!(names = %names.join(", "), "undefined placeholders left verbatim");
            }
            self.apply(&scan, &resolution)
        };

        let mut failures = scan.failures.clone();
        failures.extend(resolution.failures.iter().cloned());
        failures.extend(applied.failures);

        let report = RunReport {
            destinations: scan.selected,
            skipped: scan.skipped.clone(),
            entries: scan
                .entries()
                .map(|e| EntrySummary {
                    destination: e.destination.clone(),
                    path: e.relative_path.clone(),
                    placeholders: e.placeholders.iter().cloned().collect(),
                })
                .collect(),
            values: resolution.sources(),
            undefined: resolution.undefined.clone(),
            failures,
            written: applied.written,
            strict: self.options.strict,
            dry_run: self.options.output == OutputMode::DryRun,
            elapsed: started.elapsed(),
        };
        info!(
            entries = report.entries.len(),
            written = report.written.len(),
            failures = report.failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        report
    }

    /// Find descriptors in every selected destination.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();
        let mut selected = Vec::new();
        for location in &self.options.destinations {
            let name = scan::location_name(location);
            if self.options.package_patterns.matches_location(location, name) {
                selected.push(location.as_str());
            } else {
                info!(location = %location, "destination not selected by package patterns");
                result.skipped.push(location.clone());
            }
        }
        result.selected = selected.len();

        let outcomes: Vec<(Option<ScannedDestination>, Vec<DestinationFailure>)> = self
            .scan_pool
            .install(|| selected.par_iter().map(|l| self.scan_destination(l)).collect());

        for (destination, failures) in outcomes {
            result.destinations.extend(destination);
            result.failures.extend(failures);
        }
        result
    }

    fn scan_destination(&self, location: &str) -> (Option<ScannedDestination>, Vec<DestinationFailure>) {
        let open_failure = |e: &dyn std::fmt::Display| {
            warn!(location, error = %e, "cannot open destination");
            (
                None,
                vec![DestinationFailure::new(location, None, FailureStage::Open, e)],
            )
        };

        if let Err(e) = self.manager.context().check_cancelled() {
            return open_failure(&e);
        }
        let resource = match self.manager.open(location) {
            Ok(r) => r,
            Err(e) => return open_failure(&e),
        };
        let kind = scan::classify(&resource, self.options.declared_type);
        debug!(location, kind = ?kind, "scanning destination");

        let mut failures = Vec::new();
        let mut workdir = None;
        let files: Vec<(String, ResourceRef)> = match kind {
            DestinationKind::File => {
                if let Err(e) = resource.content() {
                    return open_failure(&e);
                }
                vec![(resource.name().to_string(), resource.clone())]
            }
            DestinationKind::Directory | DestinationKind::Archive(_) => {
                let root = match kind {
                    DestinationKind::Archive(package) => match self.unpack(&resource, package) {
                        Ok((dir, root)) => {
                            workdir = Some(dir);
                            root
                        }
                        Err(e) => return open_failure(&e),
                    },
                    _ => resource.clone(),
                };
                let walked = match self.listing_pool.install(|| scan::walk(&root, "")) {
                    Ok(w) => w,
                    Err(e) => return open_failure(&e),
                };
                for (path, e) in walked.errors {
                    failures.push(DestinationFailure::new(location, Some(path), FailureStage::Scan, e));
                }
                walked.files
            }
        };

        let descriptors: Vec<(String, ResourceRef)> = files
            .into_iter()
            .filter(|(path, _)| {
                kind == DestinationKind::File || self.options.descriptor_patterns.matches(path)
            })
            .collect();

        let read: Vec<(String, ResourceRef, Result<BTreeSet<String>, ResourceError>)> =
            self.listing_pool.install(|| {
                descriptors
                    .into_par_iter()
                    .map(|(path, descriptor)| {
                        // Lossy is enough to find names; apply decodes strictly.
                        let charset = descriptor.charset();
                        let found = descriptor
                            .content()
                            .map(|bytes| placeholder::extract(&charset.decode_lossy(bytes)));
                        (path, descriptor, found)
                    })
                    .collect()
            });

        let mut entries = Vec::new();
        for (path, descriptor, found) in read {
            match found {
                Ok(placeholders) => {
                    debug!(location, path = %path, placeholders = placeholders.len(), "descriptor");
                    entries.push(ConfigEntry {
                        destination: location.to_string(),
                        relative_path: path,
                        descriptor,
                        placeholders,
                    });
                }
                Err(e) if e.is_not_found() => debug!(location, path = %path, "descriptor vanished"),
                Err(e) => {
                    warn!(location, path = %path, error = %e, "cannot read descriptor");
                    failures.push(DestinationFailure::new(location, Some(path), FailureStage::Read, e));
                }
            }
        }
        info!(location, descriptors = entries.len(), "scanned destination");

        (
            Some(ScannedDestination {
                location: location.to_string(),
                resource,
                kind,
                entries,
                workdir,
            }),
            failures,
        )
    }

    /// Fetch an archive through the resource layer and unpack it into a
    /// fresh working directory.
    fn unpack(&self, archive: &ResourceRef, package: PackageType) -> anyhow::Result<(TempDir, ResourceRef)> {
        let bytes = archive.content()?;
        let dir = tempfile::Builder::new().prefix("autoconfig-").tempdir()?;
        let entries = package::unpack(bytes, dir.path())?;
        debug!(uri = %archive.uri(), package = %package, entries, "unpacked");
        let root = self
            .manager
            .resource(ResourceUri::from_path(dir.path()).with_directory_hint(true))?;
        Ok((dir, root))
    }

    /// Look up every placeholder found by `scan`.
    pub fn resolve(&self, scan: &ScanResult) -> Resolution {
        let names = scan.placeholders();
        let mut resolution = Resolution::default();

        if let Some(location) = &self.options.user_properties
            && let Some(props) = self.load_properties(location, &mut resolution.failures)
        {
            for name in names.keys() {
                if let Some(value) = props.get(name) {
                    resolution
                        .values
                        .insert(name.clone(), (value.to_string(), ValueSource::User));
                }
            }
        }

        for location in &self.options.shared_properties {
            let Some(props) = self.load_properties(location, &mut resolution.failures) else {
                continue;
            };
            for name in names.keys() {
                if let Some(value) = props.get(name) {
                    resolution
                        .values
                        .entry(name.clone())
                        .or_insert_with(|| (value.to_string(), ValueSource::Shared));
                }
            }
        }

        let policy = self.options.interactive.policy(self.is_terminal);
        if policy != PromptPolicy::Never {
            for (name, descriptors) in &names {
                let current = resolution.value(name).map(str::to_string);
                if policy == PromptPolicy::UndefinedOnly && current.is_some() {
                    continue;
                }
                if self.manager.context().cancel_token().is_cancelled() {
                    warn!("cancelled; skipping remaining prompts");
                    break;
                }
                let request = ValueRequest {
                    name,
                    default: current.as_deref(),
                    descriptors,
                };
                if let Some(answer) = self.interaction.prompt_value(&request) {
                    resolution
                        .values
                        .insert(name.clone(), (answer, ValueSource::Interactive));
                }
            }
        }

        resolution.undefined = names
            .keys()
            .filter(|name| !resolution.values.contains_key(*name))
            .cloned()
            .collect();
        debug!(
            resolved = resolution.values.len(),
            undefined = resolution.undefined.len(),
            "resolved placeholders"
        );
        resolution
    }

    /// A missing properties file counts as empty; any other problem is a
    /// failure.
    fn load_properties(
        &self,
        location: &str,
        failures: &mut Vec<DestinationFailure>,
    ) -> Option<Properties> {
        let loaded = self
            .manager
            .open(location)
            .map_err(PropertiesError::from)
            .and_then(|res| Properties::load(res.as_ref(), self.options.charset));
        match loaded {
            Ok(props) => {
                info!(location, entries = props.len(), "loaded properties");
                Some(props)
            }
            Err(PropertiesError::Resource(e)) if e.is_not_found() => {
                warn!(location, "properties file not found; treating as empty");
                None
            }
            Err(e) => {
                warn!(location, error = %e, "cannot load properties");
                failures.push(DestinationFailure::new(location, None, FailureStage::Properties, e));
                None
            }
        }
    }

    /// Substitute resolved values and write the results.
    pub fn apply(&self, scan: &ScanResult, resolution: &Resolution) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if self.options.output == OutputMode::DryRun {
            info!("dry run: nothing written");
            return outcome;
        }

        for (index, destination) in scan.destinations.iter().enumerate() {
            if let Err(e) = self.apply_destination(index, destination, resolution, &mut outcome) {
                warn!(location = %destination.location, error = %e, "cannot write destination");
                outcome.failures.push(DestinationFailure::new(
                    &destination.location,
                    None,
                    FailureStage::Package,
                    format!("{e:#}"),
                ));
            }
        }
        outcome
    }

    fn apply_destination(
        &self,
        index: usize,
        destination: &ScannedDestination,
        resolution: &Resolution,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<()> {
        let mut changed: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut rejected: BTreeSet<&str> = BTreeSet::new();
        for entry in &destination.entries {
            if entry.placeholders.is_empty() {
                continue;
            }
            match substitute_entry(entry, resolution) {
                Ok(Some(bytes)) => {
                    changed.insert(entry.relative_path.clone(), bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(uri = %entry.descriptor.uri(), error = %e, "descriptor left untouched");
                    rejected.insert(&entry.relative_path);
                    outcome.failures.push(DestinationFailure::new(
                        &destination.location,
                        Some(entry.relative_path.clone()),
                        FailureStage::Write,
                        e,
                    ));
                }
            }
        }

        let out_root = match &self.options.output {
            OutputMode::Directory(dir) => Some(dir.join(output_name(index, destination))),
            _ => None,
        };

        match destination.kind {
            DestinationKind::Directory | DestinationKind::File => {
                for entry in &destination.entries {
                    if rejected.contains(entry.relative_path.as_str()) {
                        continue;
                    }
                    // An output tree holds every descriptor; in place only
                    // changed ones are rewritten.
                    let (target, bytes) = match (&out_root, changed.get(&entry.relative_path)) {
                        (None, None) => continue,
                        (None, Some(bytes)) => (entry.descriptor.clone(), bytes.as_slice()),
                        (Some(root), substituted) => {
                            let target = self.local_target(&root.join(&entry.relative_path))?;
                            let bytes = match substituted {
                                Some(bytes) => bytes.as_slice(),
                                None => entry.descriptor.content()?,
                            };
                            (target, bytes)
                        }
                    };
                    match write_bytes(target.as_ref(), bytes) {
                        Ok(()) => {
                            info!(uri = %target.uri(), "wrote descriptor");
                            outcome.written.push(target.uri().to_string());
                        }
                        Err(e) => {
                            warn!(uri = %target.uri(), error = %e, "cannot write descriptor");
                            outcome.failures.push(DestinationFailure::new(
                                &destination.location,
                                Some(entry.relative_path.clone()),
                                FailureStage::Write,
                                e,
                            ));
                        }
                    }
                }
            }
            DestinationKind::Archive(package) => {
                for entry in &destination.entries {
                    if let Some(bytes) = changed.get(&entry.relative_path) {
                        write_bytes(entry.descriptor.as_ref(), bytes)?;
                    }
                }
                let workdir = destination
                    .workdir
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("archive was not unpacked"))?;

                if self.options.explode {
                    let target = match &out_root {
                        Some(root) => package::explode_target(root),
                        None => {
                            let resource = &destination.resource;
                            if resource.uri().scheme() != Scheme::File {
                                anyhow::bail!("exploding requires a local archive, got {}", resource.uri());
                            }
                            package::explode_target(&resource.uri().to_path())
                        }
                    };
                    package::explode(workdir.path(), &target, package)?;
                    outcome.written.push(target.display().to_string());
                } else if !changed.is_empty() || out_root.is_some() {
                    let repacked = package::repack(destination.resource.content()?, &changed)?;
                    let target = match &out_root {
                        Some(root) => self.local_target(root)?,
                        None => destination.resource.clone(),
                    };
                    write_bytes(target.as_ref(), &repacked)?;
                    info!(uri = %target.uri(), replaced = changed.len(), "repacked archive");
                    outcome.written.push(target.uri().to_string());
                }
            }
        }
        Ok(())
    }

    fn local_target(&self, path: &Path) -> Result<ResourceRef, ResourceError> {
        self.manager.resource(ResourceUri::from_path(path))
    }
}

/// Substituted bytes for one descriptor, `None` when nothing changed.
///
/// The descriptor is decoded strictly and re-encoded in its own charset, so
/// bytes outside the replaced placeholders come back unchanged or the entry
/// is refused.
fn substitute_entry(
    entry: &ConfigEntry,
    resolution: &Resolution,
) -> Result<Option<Vec<u8>>, ResourceError> {
    let descriptor = &entry.descriptor;
    let text = descriptor.text()?;
    let substituted = placeholder::substitute(&text, |name| resolution.value(name));
    if substituted == text {
        return Ok(None);
    }
    descriptor
        .charset()
        .encode(&substituted)
        .map(Some)
        .map_err(|e| ResourceError::encoding(descriptor.uri(), e))
}

/// Directory name used for a destination below an output directory.
fn output_name(index: usize, destination: &ScannedDestination) -> String {
    match destination.resource.name() {
        "" => format!("destination-{index}"),
        name => name.to_string(),
    }
}

fn write_bytes(resource: &dyn Resource, bytes: &[u8]) -> Result<(), ResourceError> {
    let mut out = resource.output_stream()?;
    out.write_all(bytes)
        .and_then(|()| out.flush())
        .map_err(|e| ResourceError::io(resource.uri(), e))
}
