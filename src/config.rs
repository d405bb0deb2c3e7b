//! Sync type configuration and the YAML-backed runner configuration.
//!
//! A [`SyncTypeConfig`] is an immutable value describing one kind of synced
//! record: the ordered canonical keys, the subset used for matching, and the
//! per-module field maps in both directions. Integrations build one with
//! [`SyncTypeConfig::builder`] (arbitrary closures) or declaratively from a
//! [`SyncDefinition`] when extraction is plain field lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Result, SyncError};

/// Canonical record shape: canonical key -> JSON value.
pub type CanonicalData = BTreeMap<String, Value>;

/// Extracts one canonical field from a module's native record. `None` means
/// the native record has no value for the field.
pub type Extractor = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Projects a canonical record into a module-shaped payload. Allowed to be
/// partial: only the fields the target module accepts.
pub type Projector = Arc<dyn Fn(&CanonicalData) -> Value + Send + Sync>;

/// Field map for one module: an extractor per canonical key plus a reverse
/// projector.
#[derive(Clone)]
pub struct ModuleMapping {
    extractors: HashMap<String, Extractor>,
    projector: Projector,
}

impl ModuleMapping {
    pub fn new<F>(projector: F) -> Self
    where
        F: Fn(&CanonicalData) -> Value + Send + Sync + 'static,
    {
        Self {
            extractors: HashMap::new(),
            projector: Arc::new(projector),
        }
    }

    /// Register an extractor for a canonical key.
    pub fn extract<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.extractors.insert(key.into(), Arc::new(f));
        self
    }

    /// Build a mapping where every canonical key is a plain field lookup:
    /// `fields` maps canonical key -> native field name. The projector emits
    /// the native field names for every non-null canonical value.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let pairs: Vec<(String, String)> = fields
            .iter()
            .map(|(canonical, native)| (canonical.clone(), native.clone()))
            .collect();
        let mut mapping = Self::new(move |data: &CanonicalData| {
            let mut out = serde_json::Map::new();
            for (canonical, native) in &pairs {
                if let Some(value) = data.get(canonical) {
                    if !value.is_null() {
                        out.insert(native.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        });
        for (canonical, native) in fields {
            let native = native.clone();
            mapping = mapping.extract(canonical.clone(), move |record: &Value| {
                record.get(&native).cloned()
            });
        }
        mapping
    }

    fn extractor(&self, key: &str) -> Option<&Extractor> {
        self.extractors.get(key)
    }
}

/// Immutable configuration for one sync type (e.g. `AccountSync`).
///
/// `keys` order is semantically significant: it is the hash input order for
/// change detection.
pub struct SyncTypeConfig {
    name: String,
    keys: Vec<String>,
    match_on: Vec<String>,
    modules: HashMap<String, ModuleMapping>,
}

impl fmt::Debug for SyncTypeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTypeConfig")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("match_on", &self.match_on)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SyncTypeConfig {
    pub fn builder(name: impl Into<String>) -> SyncTypeConfigBuilder {
        SyncTypeConfigBuilder {
            name: name.into(),
            keys: Vec::new(),
            match_on: Vec::new(),
            modules: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn match_on(&self) -> &[String] {
        &self.match_on
    }

    /// Apply the module's extractors over a native record, in `keys` order.
    /// Keys the native record has no value for are left absent.
    pub fn extract(&self, module: &str, native: &Value) -> Result<CanonicalData> {
        let mapping = self.mapping(module)?;
        let mut data = CanonicalData::new();
        for key in &self.keys {
            let extractor = mapping.extractor(key).ok_or_else(|| {
                SyncError::Configuration(format!(
                    "module {module} has no extractor for key {key} in {}",
                    self.name
                ))
            })?;
            if let Some(value) = extractor(native) {
                data.insert(key.clone(), value);
            }
        }
        Ok(data)
    }

    /// Project a canonical record into the module's native payload shape.
    pub fn project(&self, module: &str, data: &CanonicalData) -> Result<Value> {
        let mapping = self.mapping(module)?;
        Ok((mapping.projector)(data))
    }

    fn mapping(&self, module: &str) -> Result<&ModuleMapping> {
        self.modules.get(module).ok_or_else(|| {
            SyncError::Configuration(format!(
                "module {module} is not registered for sync type {}",
                self.name
            ))
        })
    }
}

pub struct SyncTypeConfigBuilder {
    name: String,
    keys: Vec<String>,
    match_on: Vec<String>,
    modules: HashMap<String, ModuleMapping>,
}

impl SyncTypeConfigBuilder {
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn match_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.match_on = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn module(mut self, name: impl Into<String>, mapping: ModuleMapping) -> Self {
        self.modules.insert(name.into(), mapping);
        self
    }

    /// Validate completeness and freeze the configuration. Every registered
    /// module must supply an extractor for every key; `match_on` must be a
    /// non-empty subset of `keys`.
    pub fn build(self) -> Result<Arc<SyncTypeConfig>> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Configuration("sync type name is empty".into()));
        }
        if self.keys.is_empty() {
            return Err(SyncError::Configuration(format!(
                "sync type {} has no keys",
                self.name
            )));
        }
        if self.match_on.is_empty() {
            return Err(SyncError::Configuration(format!(
                "sync type {} has no match_on keys",
                self.name
            )));
        }
        for key in &self.match_on {
            if !self.keys.contains(key) {
                return Err(SyncError::Configuration(format!(
                    "match_on key {key} is not in keys for sync type {}",
                    self.name
                )));
            }
        }
        for (module, mapping) in &self.modules {
            for key in &self.keys {
                if mapping.extractor(key).is_none() {
                    return Err(SyncError::Configuration(format!(
                        "module {module} is missing an extractor for key {key} in sync type {}",
                        self.name
                    )));
                }
            }
        }
        Ok(Arc::new(SyncTypeConfig {
            name: self.name,
            keys: self.keys,
            match_on: self.match_on,
            modules: self.modules,
        }))
    }
}

/// Declarative sync type definition, deserialized from YAML. Covers the
/// common case where extraction is plain field lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncDefinition {
    pub name: String,
    pub keys: Vec<String>,
    pub match_on: Vec<String>,
    pub modules: HashMap<String, FieldMap>,
}

/// Canonical key -> native field name for one module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMap {
    pub fields: HashMap<String, String>,
}

impl SyncDefinition {
    /// Lower the definition into a full [`SyncTypeConfig`] with generated
    /// field-lookup extractors and projectors.
    pub fn to_config(&self) -> Result<Arc<SyncTypeConfig>> {
        let mut builder = SyncTypeConfig::builder(&self.name)
            .keys(self.keys.clone())
            .match_on(self.match_on.clone());
        for (module, map) in &self.modules {
            builder = builder.module(module, ModuleMapping::from_fields(&map.fields));
        }
        builder.build()
    }
}

/// Orchestrator behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    /// Records missing match data never match. When true they are routed
    /// through the create path; when false they are skipped for the pass.
    pub ignore_empty_match_values: bool,
    /// Suppress the secondary -> primary direction entirely.
    pub is_unidirectional: bool,
    /// When one side holds several records with the same match hash, keep the
    /// first and drop the rest. When false, duplicates fail the run.
    pub use_first_matching_duplicate: bool,
    /// Treat empty-string fields as absent when hashing, so "never set" and
    /// "set to empty" compare equal for change detection.
    pub omit_empty_strings_from_data: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ignore_empty_match_values: true,
            is_unidirectional: false,
            use_first_matching_duplicate: true,
            omit_empty_strings_from_data: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Runner configuration mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    pub database_url: String,
    #[serde(default)]
    pub settings: SyncSettings,
    pub sync: SyncDefinition,
    pub primary: ModuleSource,
    pub secondary: ModuleSource,
}

/// One side of the runner's sync: which module map to use, the entity id of
/// the connection, and the JSON file holding native records by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleSource {
    pub module: String,
    pub entity: String,
    pub records: String,
}

/// Load runner configuration from a YAML file and validate it.
/// - If `path` is None, uses `sync.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> std::result::Result<RunnerConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("sync.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: RunnerConfig = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &RunnerConfig) -> std::result::Result<(), ConfigError> {
    if cfg.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("database_url must be non-empty"));
    }
    if cfg.sync.name.trim().is_empty() {
        return Err(ConfigError::Invalid("sync.name must be non-empty"));
    }
    if cfg.sync.keys.is_empty() {
        return Err(ConfigError::Invalid("sync.keys must be non-empty"));
    }
    if cfg.sync.match_on.is_empty() {
        return Err(ConfigError::Invalid("sync.match_on must be non-empty"));
    }
    for key in &cfg.sync.match_on {
        if !cfg.sync.keys.contains(key) {
            return Err(ConfigError::Invalid(
                "sync.match_on entries must appear in sync.keys",
            ));
        }
    }
    for side in [&cfg.primary, &cfg.secondary] {
        if side.entity.trim().is_empty() {
            return Err(ConfigError::Invalid("module entity must be non-empty"));
        }
        if side.records.trim().is_empty() {
            return Err(ConfigError::Invalid("module records path must be non-empty"));
        }
        if !cfg.sync.modules.contains_key(&side.module) {
            return Err(ConfigError::Invalid(
                "primary/secondary module must be defined under sync.modules",
            ));
        }
    }
    if cfg.primary.entity == cfg.secondary.entity {
        return Err(ConfigError::Invalid(
            "primary and secondary entities must differ",
        ));
    }
    Ok(())
}

/// Example runner configuration for an account sync between a Crossbeam
/// workspace and a Monday.com board.
pub fn example() -> &'static str {
    r#"database_url: "sqlite://./data/frigg-sync.db"

settings:
  is_unidirectional: false

sync:
  name: AccountSync
  keys: [accountName, domain, partner, partnerPopulation, population]
  match_on: [domain]
  modules:
    crossbeam:
      fields:
        accountName: accountName
        domain: domain
        partner: partner
        partnerPopulation: partnerPopulation
        population: population
    monday:
      fields:
        accountName: "Account Name"
        domain: "Domain"
        partner: "Partner"
        partnerPopulation: "Partner Population"
        population: "Population"

primary:
  module: crossbeam
  entity: "crossbeam-workspace-1"
  records: "./data/crossbeam.json"

secondary:
  module: monday
  entity: "monday-board-1"
  records: "./data/monday.json"
"#
}
