//! Configuration manager: typed per-module schemas, layered loading, runtime
//! reads/writes and change notification.
//!
//! The manager is the sole writer to the resolved configuration. Schemas are
//! registered at wire time (`load_project`), loaders run once at the
//! `PostConfig` boundary (`initialize`), and afterwards values change only
//! through [`ConfigManager::set`], which dispatches watchers synchronously.

pub mod loaders;
mod value;

pub use value::{ConfigKind, ConfigSpec, ConfigValue, coerce, parse_config};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::errors::{BootstrapError, ConfigError};
use loaders::{LoaderOptions, RawPartial, SchemaIndex};

/// Ordered schema of one module.
pub type Schema = Vec<(String, ConfigSpec)>;

type UpdateCallback = Arc<dyn Fn(&str, &str, &ConfigValue) + Send + Sync>;

struct Watcher {
    module: Option<String>,
    key: Option<String>,
    callback: UpdateCallback,
}

impl Watcher {
    fn matches(&self, module: &str, key: &str) -> bool {
        let module_ok = self
            .module
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(module));
        let key_ok = self
            .key
            .as_deref()
            .is_none_or(|k| k.eq_ignore_ascii_case(key));
        module_ok && key_ok
    }
}

/// Owner of the resolved configuration.
pub struct ConfigManager {
    schemas: RwLock<HashMap<String, Schema>>,
    values: RwLock<HashMap<String, HashMap<String, ConfigValue>>>,
    watchers: RwLock<Vec<Watcher>>,
    /// Bootstrap-options partial, re-applied after loaders so it always wins.
    overrides: RwLock<JsonValue>,
    initialized: AtomicBool,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
            overrides: RwLock::new(JsonValue::Null),
            initialized: AtomicBool::new(false),
        }
    }

    /// Register a module schema and seed its defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::LateConfigure`] once loaders have already run;
    /// schemas must be declared during wiring.
    pub fn load_project(&self, module: &str, schema: Schema) -> Result<(), ConfigError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(ConfigError::LateConfigure {
                module: module.to_owned(),
            });
        }
        self.register_schema(module, schema);
        Ok(())
    }

    pub(crate) fn register_schema(&self, module: &str, schema: Schema) {
        let mut values = self.values.write();
        let slot = values.entry(module.to_owned()).or_default();
        for (key, spec) in &schema {
            if let Some(default) = &spec.default {
                slot.entry(key.clone()).or_insert_with(|| default.clone());
            }
        }
        drop(values);
        self.schemas.write().insert(module.to_owned(), schema);
    }

    /// Typed read of a resolved value.
    #[must_use]
    pub fn get(&self, module: &str, key: &str) -> Option<ConfigValue> {
        let canonical = self.canonical_key(module, key)?;
        self.values.read().get(module)?.get(&canonical).cloned()
    }

    /// Write a single value.
    ///
    /// The `(module, key)` pair must have been declared at wire time; keys
    /// are matched case-insensitively. Watchers whose filter matches fire
    /// synchronously, in registration order, after the value is written.
    ///
    /// # Errors
    /// Rejects unknown modules/keys and whole-module assignment (an empty
    /// key).
    pub fn set(
        &self,
        module: &str,
        key: &str,
        value: impl Into<ConfigValue>,
    ) -> Result<(), ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::NonLeafAssignment {
                module: module.to_owned(),
            });
        }
        let schemas = self.schemas.read();
        let schema = schemas.get(module).ok_or_else(|| ConfigError::UnknownModule {
            module: module.to_owned(),
        })?;
        let (canonical, spec) = schema
            .iter()
            .find(|(declared, _)| declared.eq_ignore_ascii_case(key))
            .ok_or_else(|| ConfigError::UnknownKey {
                module: module.to_owned(),
                key: key.to_owned(),
            })?;
        let canonical = canonical.clone();
        let coerced = value::coerce(spec.kind, value.into());
        drop(schemas);

        self.values
            .write()
            .entry(module.to_owned())
            .or_default()
            .insert(canonical.clone(), coerced.clone());

        // Snapshot watchers before dispatch so callbacks may register new
        // watchers or touch config without deadlocking.
        let callbacks: Vec<UpdateCallback> = self
            .watchers
            .read()
            .iter()
            .filter(|w| w.matches(module, &canonical))
            .map(|w| w.callback.clone())
            .collect();
        for callback in callbacks {
            callback(module, &canonical, &coerced);
        }
        Ok(())
    }

    /// Names of every registered module.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared keys of one module, in declaration order.
    #[must_use]
    pub fn module_keys(&self, module: &str) -> Vec<String> {
        self.schemas
            .read()
            .get(module)
            .map(|schema| schema.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has(&self, module: &str) -> bool {
        self.schemas.read().contains_key(module)
    }

    /// Declared spec for a key, including the advisory `enum_values`.
    #[must_use]
    pub fn spec(&self, module: &str, key: &str) -> Option<ConfigSpec> {
        let schemas = self.schemas.read();
        let schema = schemas.get(module)?;
        schema
            .iter()
            .find(|(declared, _)| declared.eq_ignore_ascii_case(key))
            .map(|(_, spec)| spec.clone())
    }

    /// Deep-merge a partial configuration (`module → key → value`).
    ///
    /// Applied immediately and recorded so it is re-applied after loaders
    /// run; bootstrap options therefore win over every loader source.
    /// Undeclared keys are skipped with a warning. Merging does not fire
    /// watchers; only [`ConfigManager::set`] does.
    pub fn merge(&self, partial: &JsonValue) {
        if partial.is_null() {
            return;
        }
        {
            let mut overrides = self.overrides.write();
            merge_json(&mut overrides, partial);
        }
        self.apply_json_partial(partial);
    }

    /// Register a change watcher with optional case-insensitive filters.
    pub fn on_update<F>(&self, module: Option<&str>, key: Option<&str>, callback: F)
    where
        F: Fn(&str, &str, &ConfigValue) + Send + Sync + 'static,
    {
        self.watchers.write().push(Watcher {
            module: module.map(ToOwned::to_owned),
            key: key.map(ToOwned::to_owned),
            callback: Arc::new(callback),
        });
    }

    /// Run the loader sequence and enforce required values.
    ///
    /// Order: dotenv preload, file loader, environment loader, CLI loader
    /// (later sources override earlier per key), then the recorded merge
    /// partial on top of everything.
    ///
    /// # Errors
    /// [`BootstrapError::MissingRequiredConfig`] when a `required` spec is
    /// still unset after every source ran; each missing key is also printed
    /// to standard error.
    pub(crate) fn initialize(
        &self,
        app: &str,
        options: &LoaderOptions,
    ) -> Result<(), BootstrapError> {
        let argv = options.argv();
        let index = self.schema_index();

        loaders::preload_env_file(options, &argv);
        if options.file {
            self.apply_raw_partial(loaders::load_files(app, &index, options, &argv));
        }
        if options.env {
            self.apply_raw_partial(loaders::load_env(&index));
        }
        if options.cli {
            self.apply_raw_partial(loaders::load_cli(&index, &argv));
        }

        let overrides = self.overrides.read().clone();
        self.apply_json_partial(&overrides);

        self.initialized.store(true, Ordering::SeqCst);

        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            for name in &missing {
                eprintln!("missing required config value: {name}");
            }
            Err(BootstrapError::MissingRequiredConfig { missing })
        }
    }

    fn schema_index(&self) -> SchemaIndex {
        self.schemas
            .read()
            .iter()
            .map(|(module, schema)| {
                (
                    module.clone(),
                    schema.iter().map(|(key, _)| key.clone()).collect(),
                )
            })
            .collect()
    }

    fn canonical_key(&self, module: &str, key: &str) -> Option<String> {
        let schemas = self.schemas.read();
        let schema = schemas.get(module)?;
        schema
            .iter()
            .find(|(declared, _)| declared.eq_ignore_ascii_case(key))
            .map(|(declared, _)| declared.clone())
    }

    /// Write loader output. Keys are already canonical; values coerce per
    /// the declared spec. No watcher dispatch.
    fn apply_raw_partial(&self, partial: RawPartial) {
        let schemas = self.schemas.read();
        let mut values = self.values.write();
        for (module, entries) in partial {
            let Some(schema) = schemas.get(&module) else {
                continue;
            };
            let slot = values.entry(module.clone()).or_default();
            for (key, raw) in entries {
                let Some((_, spec)) = schema.iter().find(|(declared, _)| declared == &key)
                else {
                    continue;
                };
                slot.insert(key, value::from_raw(spec.kind, &raw));
            }
        }
    }

    /// Write a bootstrap partial (`{module: {key: value}}`), resolving key
    /// names case-insensitively against the declared schema.
    fn apply_json_partial(&self, partial: &JsonValue) {
        let Some(modules) = partial.as_object() else {
            if !partial.is_null() {
                tracing::warn!("bootstrap configuration must be an object of modules, ignoring");
            }
            return;
        };
        let schemas = self.schemas.read();
        let mut values = self.values.write();
        for (module, entries) in modules {
            let Some(schema) = schemas.get(module) else {
                tracing::warn!(module = %module, "bootstrap configuration for undeclared module, ignoring");
                continue;
            };
            let Some(entries) = entries.as_object() else {
                tracing::warn!(module = %module, "bootstrap configuration entry is not an object, ignoring");
                continue;
            };
            let slot = values.entry(module.clone()).or_default();
            for (key, raw) in entries {
                match schema
                    .iter()
                    .find(|(declared, _)| declared.eq_ignore_ascii_case(key))
                {
                    Some((canonical, spec)) => {
                        slot.insert(canonical.clone(), value::from_raw(spec.kind, raw));
                    }
                    None => {
                        tracing::warn!(module = %module, key = %key, "bootstrap configuration for undeclared key, ignoring");
                    }
                }
            }
        }
    }

    fn missing_required(&self) -> Vec<String> {
        let schemas = self.schemas.read();
        let values = self.values.read();
        let mut missing = Vec::new();
        for (module, schema) in schemas.iter() {
            for (key, spec) in schema {
                if spec.required
                    && values
                        .get(module)
                        .and_then(|slot| slot.get(key))
                        .is_none()
                {
                    missing.push(format!("{module}.{key}"));
                }
            }
        }
        missing.sort();
        missing
    }

    /// Effective configuration as JSON (`module → key → value`), for dumps
    /// and diagnostics. Unrepresentable numbers (`NaN`) render as null.
    #[must_use]
    pub fn resolved(&self) -> JsonValue {
        let values = self.values.read();
        let mut modules = serde_json::Map::new();
        for (module, slot) in values.iter() {
            let mut keys = serde_json::Map::new();
            for (key, value) in slot {
                keys.insert(key.clone(), value.to_json());
            }
            modules.insert(module.clone(), JsonValue::Object(keys));
        }
        JsonValue::Object(modules)
    }
}

fn merge_json(target: &mut JsonValue, incoming: &JsonValue) {
    match (target, incoming) {
        (JsonValue::Object(t), JsonValue::Object(i)) => {
            for (key, value) in i {
                merge_json(t.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}
