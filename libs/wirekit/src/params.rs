//! The fixed parameter bundle injected into every service factory, plus the
//! typed hub peers resolve each other through.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::{ConfigManager, ConfigValue};
use crate::errors::{ConfigError, PeerError};
use crate::events::EventBus;
use crate::lifecycle::Lifecycle;
use crate::logging::Logger;
use crate::registry::ServiceApi;
use crate::scheduler::Scheduler;

/// Type-safe registry of exported service APIs keyed by `(module, service)`.
///
/// Providers store their API once during wiring; consumers fetch by concrete
/// type and downcast. Wiring order makes exactly the earlier-wired services
/// visible to a factory.
#[derive(Default)]
pub struct ServiceHub {
    map: DashMap<(String, String), ServiceApi>,
}

impl ServiceHub {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, module: &str, service: &str) -> bool {
        self.map
            .contains_key(&(module.to_owned(), service.to_owned()))
    }

    pub(crate) fn insert(&self, module: &str, service: &str, api: ServiceApi) {
        self.map
            .insert((module.to_owned(), service.to_owned()), api);
    }
}

/// Read view over the [`ServiceHub`] handed to factories.
#[derive(Clone)]
pub struct Peers {
    hub: Arc<ServiceHub>,
}

impl Peers {
    pub(crate) fn new(hub: Arc<ServiceHub>) -> Self {
        Self { hub }
    }

    /// Resolve a peer API by `(module, service)` and concrete type.
    ///
    /// # Errors
    /// [`PeerError::NotFound`] when nothing is bound (the peer is not wired
    /// yet, or never will be); [`PeerError::TypeMismatch`] when the bound
    /// API is a different type.
    pub fn get<T>(&self, module: &str, service: &str) -> Result<Arc<T>, PeerError>
    where
        T: Send + Sync + 'static,
    {
        let api = self
            .hub
            .map
            .get(&(module.to_owned(), service.to_owned()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeerError::NotFound {
                module: module.to_owned(),
                service: service.to_owned(),
            })?;
        api.downcast::<T>().map_err(|_| PeerError::TypeMismatch {
            module: module.to_owned(),
            service: service.to_owned(),
        })
    }
}

/// Module-bound configuration view plus the global read/write API.
#[derive(Clone)]
pub struct ConfigAccessor {
    module: Arc<str>,
    manager: Arc<ConfigManager>,
}

impl ConfigAccessor {
    pub(crate) fn new(module: Arc<str>, manager: Arc<ConfigManager>) -> Self {
        Self { module, manager }
    }

    /// Read a key of the owning module.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.manager.get(&self.module, key)
    }

    /// Read any module's key.
    #[must_use]
    pub fn get_from(&self, module: &str, key: &str) -> Option<ConfigValue> {
        self.manager.get(module, key)
    }

    /// Write a value; watchers fire synchronously.
    ///
    /// # Errors
    /// See [`ConfigManager::set`].
    pub fn set(
        &self,
        module: &str,
        key: &str,
        value: impl Into<ConfigValue>,
    ) -> Result<(), ConfigError> {
        self.manager.set(module, key, value)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.manager.keys()
    }

    #[must_use]
    pub fn has(&self, module: &str) -> bool {
        self.manager.has(module)
    }

    /// Register a change watcher with optional case-insensitive filters.
    pub fn on_update<F>(&self, module: Option<&str>, key: Option<&str>, callback: F)
    where
        F: Fn(&str, &str, &ConfigValue) + Send + Sync + 'static,
    {
        self.manager.on_update(module, key, callback);
    }

    /// The underlying manager, for merge/introspection use.
    #[must_use]
    pub fn manager(&self) -> &Arc<ConfigManager> {
        &self.manager
    }
}

/// Shared internals extracted from the boilerplate module: the process-wide
/// collaborators a service may need outside its own bundle.
pub struct Internal {
    instance_id: Uuid,
    config: Arc<ConfigManager>,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
}

impl Internal {
    pub(crate) fn new(
        instance_id: Uuid,
        config: Arc<ConfigManager>,
        cache: Arc<Cache>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            instance_id,
            config,
            cache,
            events,
        }
    }

    /// Process-level instance id of the current boot.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

/// The bundle every service factory receives. Fixed shape: cross-module
/// lookups go through [`Peers`], not dynamic properties.
#[derive(Clone)]
pub struct ServiceParams {
    context: Arc<str>,
    logger: Logger,
    config: ConfigAccessor,
    lifecycle: Arc<Lifecycle>,
    scheduler: Scheduler,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
    internal: Arc<Internal>,
    peers: Peers,
}

impl ServiceParams {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        context: Arc<str>,
        logger: Logger,
        config: ConfigAccessor,
        lifecycle: Arc<Lifecycle>,
        scheduler: Scheduler,
        cache: Arc<Cache>,
        events: Arc<EventBus>,
        internal: Arc<Internal>,
        peers: Peers,
    ) -> Self {
        Self {
            context,
            logger,
            config,
            lifecycle,
            scheduler,
            cache,
            events,
            internal,
            peers,
        }
    }

    /// `"<module>:<service>"`, used in logs and metric labels.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Logger pre-tagged with this service's context.
    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    #[must_use]
    pub fn config(&self) -> &ConfigAccessor {
        &self.config
    }

    /// The owning module's lifecycle handle.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Scheduler pre-bound to this service's context.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn internal(&self) -> &Arc<Internal> {
        &self.internal
    }

    /// Resolved APIs of every service wired before this one.
    #[must_use]
    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Convenience emit on the shared bus.
    pub fn emit(&self, event: &str, payload: &JsonValue) {
        self.events.emit(event, payload);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct WeatherApi {
        forecast: &'static str,
    }

    #[test]
    fn peers_downcast_by_concrete_type() {
        let hub = Arc::new(ServiceHub::new());
        hub.insert(
            "testing",
            "weather",
            Arc::new(WeatherApi { forecast: "hail" }),
        );
        let peers = Peers::new(hub);

        let api = peers.get::<WeatherApi>("testing", "weather").unwrap();
        assert_eq!(api.forecast, "hail");

        assert!(matches!(
            peers.get::<WeatherApi>("testing", "nope"),
            Err(PeerError::NotFound { .. })
        ));
        assert!(matches!(
            peers.get::<String>("testing", "weather"),
            Err(PeerError::TypeMismatch { .. })
        ));
    }
}
