//! The kernel: service container, bootstrap sequencing and teardown.
//!
//! A [`Kernel`] value owns every mutable map of a running application — the
//! service hub, the configuration manager, the scheduler core, the lifecycle
//! runtime and the cancellation token. "At most one application per process"
//! is a single process-global slot; everything else lives on the kernel so a
//! torn-down application can boot again from a clean slate.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{Cache, CacheProvider};
use crate::config::loaders::LoaderOptions;
use crate::config::{ConfigManager, ConfigSpec};
use crate::errors::BootstrapError;
use crate::events::EventBus;
use crate::lifecycle::{self, Lifecycle, LifecycleRuntime, LifecycleStage};
use crate::logging::{self, Logger};
use crate::params::{ConfigAccessor, Internal, Peers, ServiceHub, ServiceParams};
use crate::planner;
use crate::registry::{Application, Library, ModuleSpec, ServiceApi, erase_factory};
use crate::scheduler::{Scheduler, SchedulerCore};
use crate::shutdown;

/// Name of the built-in module providing configuration, logging, cache and
/// scheduling.
pub const BOILERPLATE_MODULE: &str = "boilerplate";

static ACTIVE_APPLICATION: Mutex<Option<String>> = Mutex::new(None);

/// Options for `Application::bootstrap`.
pub struct BootstrapOptions {
    /// Partial configuration (`{module: {key: value}}`) merged after every
    /// loader, so it wins over CLI, env, files and defaults.
    pub configuration: JsonValue,
    /// Loader toggles and source overrides.
    pub loaders: LoaderOptions,
    /// Install SIGTERM/SIGINT handlers that cancel the kernel. Disable in
    /// tests and embedded hosts.
    pub handle_signals: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            configuration: JsonValue::Null,
            loaders: LoaderOptions::default(),
            handle_signals: true,
        }
    }
}

/// Runtime state of one booted application.
pub(crate) struct Kernel {
    app_name: Arc<str>,
    instance_id: Uuid,
    config: Arc<ConfigManager>,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
    hub: Arc<ServiceHub>,
    scheduler_core: Arc<SchedulerCore>,
    lifecycle_runtime: Arc<LifecycleRuntime>,
    internal: Arc<Internal>,
    boilerplate: Arc<ModuleSpec>,
    libraries: Vec<Library>,
    app_spec: Arc<ModuleSpec>,
    /// Stage processing order: boilerplate, libraries in plan order, app.
    module_lifecycles: Vec<Arc<Lifecycle>>,
    cancel: CancellationToken,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    /// Plan the boot: order libraries and assemble runtime components.
    /// Nothing is mounted or wired yet.
    fn plan(app: &Application) -> Result<Self, BootstrapError> {
        let libraries = planner::order_libraries(app.libraries())?;

        let config = Arc::new(ConfigManager::new());
        let cache = Arc::new(Cache::new());
        let events = Arc::new(EventBus::new());
        let hub = Arc::new(ServiceHub::new());
        let scheduler_core = Arc::new(SchedulerCore::new());
        let lifecycle_runtime = Arc::new(LifecycleRuntime::new());
        let instance_id = Uuid::now_v7();

        let internal = Arc::new(Internal::new(
            instance_id,
            config.clone(),
            cache.clone(),
            events.clone(),
        ));

        let boilerplate = Arc::new(boilerplate_spec(&cache, &scheduler_core));

        let mut module_lifecycles = Vec::with_capacity(libraries.len() + 2);
        module_lifecycles.push(boilerplate.lifecycle.clone());
        for library in &libraries {
            module_lifecycles.push(library.spec().lifecycle.clone());
        }
        module_lifecycles.push(app.spec().lifecycle.clone());

        Ok(Self {
            app_name: app.spec().name.clone(),
            instance_id,
            config,
            cache,
            events,
            hub,
            scheduler_core,
            lifecycle_runtime,
            internal,
            boilerplate,
            libraries,
            app_spec: app.spec().clone(),
            module_lifecycles,
            cancel: CancellationToken::new(),
            signal_task: Mutex::new(None),
        })
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn boot(&self, options: BootstrapOptions) -> Result<(), BootstrapError> {
        let started = Instant::now();
        tracing::info!(
            application = %self.app_name,
            instance_id = %self.instance_id,
            "bootstrapping application"
        );

        // The built-in module first, in isolation: its services provide the
        // facilities everything else is wired with.
        self.mount_and_wire(&self.boilerplate).await?;

        if options.handle_signals {
            self.install_signal_handlers();
        }

        for library in &self.libraries {
            self.mount_and_wire(library.spec()).await?;
        }
        self.mount_and_wire(&self.app_spec).await?;

        // Bootstrap overrides are recorded now and re-applied after loaders.
        self.config.merge(&options.configuration);

        self.run_stage(LifecycleStage::PreInit, true).await?;
        self.config.initialize(&self.app_name, &options.loaders)?;
        self.run_stage(LifecycleStage::PostConfig, true).await?;
        self.run_stage(LifecycleStage::Bootstrap, true).await?;
        self.run_stage(LifecycleStage::Ready, false).await?;

        tracing::info!(
            application = %self.app_name,
            elapsed = ?started.elapsed(),
            "application ready"
        );
        Ok(())
    }

    async fn mount_and_wire(&self, spec: &Arc<ModuleSpec>) -> Result<(), BootstrapError> {
        spec.lifecycle.mount(self.lifecycle_runtime.clone());
        spec.mount(&self.config);
        self.config.register_schema(&spec.name, spec.schema.clone());

        for service in planner::wire_order(&spec.priority_init, &spec.services) {
            self.wire_service(spec, service).await?;
        }
        Ok(())
    }

    async fn wire_service(
        &self,
        spec: &Arc<ModuleSpec>,
        service: &str,
    ) -> Result<(), BootstrapError> {
        let module = &spec.name;
        if self.hub.contains(module, service) {
            return Err(BootstrapError::DuplicateService {
                module: module.to_string(),
                service: service.to_owned(),
            });
        }
        let Some((_, factory)) = spec.services.iter().find(|(name, _)| name == service) else {
            // wire_order only yields declared services.
            return Ok(());
        };

        let context: Arc<str> = format!("{module}:{service}").into();
        tracing::debug!(context = %context, "wiring service");

        let params = ServiceParams::new(
            context.clone(),
            Logger::new(context.clone()),
            ConfigAccessor::new(spec.name.clone(), self.config.clone()),
            spec.lifecycle.clone(),
            Scheduler::new(context.clone(), self.scheduler_core.clone()),
            self.cache.clone(),
            self.events.clone(),
            self.internal.clone(),
            Peers::new(self.hub.clone()),
        );

        match factory(params).await {
            Ok(Some(api)) => {
                self.hub.insert(module, service, api);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(source) => {
                tracing::error!(
                    context = %context,
                    error = %source,
                    fatal = true,
                    "service factory failed, aborting bootstrap"
                );
                Err(BootstrapError::ServiceFactoryFailure {
                    context: context.to_string(),
                    source,
                })
            }
        }
    }

    async fn run_stage(
        &self,
        stage: LifecycleStage,
        fail_fast: bool,
    ) -> Result<(), BootstrapError> {
        match lifecycle::run_stage(
            &self.lifecycle_runtime,
            stage,
            &self.module_lifecycles,
            fail_fast,
        )
        .await
        {
            Ok(elapsed) => {
                tracing::debug!(stage = %stage, elapsed = ?elapsed, "lifecycle stage complete");
                Ok(())
            }
            Err(failure) => {
                tracing::error!(
                    module = %failure.module,
                    stage = %stage,
                    error = %failure.error,
                    fatal = true,
                    "lifecycle callback failed before Ready, aborting bootstrap"
                );
                Err(BootstrapError::ServiceFactoryFailure {
                    context: format!("{}:{stage}", failure.module),
                    source: failure.error,
                })
            }
        }
    }

    fn install_signal_handlers(&self) {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            match shutdown::wait_for_shutdown().await {
                Ok(()) => tracing::info!("shutdown: signal received"),
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        "shutdown: primary waiter failed; falling back to ctrl_c()"
                    );
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
            cancel.cancel();
        });
        *self.signal_task.lock() = Some(task);
    }

    pub(crate) async fn shutdown(&self) {
        tracing::info!(application = %self.app_name, "tearing down application");
        let _ = self.run_stage(LifecycleStage::PreShutdown, false).await;
        // Boilerplate's own PreShutdown hook quiesces the scheduler; repeat
        // here so a failed boot (whose hook never registered) still drains.
        self.scheduler_core.quiesce();
        let _ = self.run_stage(LifecycleStage::ShutdownStart, false).await;
        let _ = self.run_stage(LifecycleStage::ShutdownComplete, false).await;
        self.dismantle();
    }

    pub(crate) fn dismantle(&self) {
        self.cancel.cancel();
        if let Some(task) = self.signal_task.lock().take() {
            task.abort();
        }
        self.scheduler_core.quiesce();
        self.lifecycle_runtime.clear();
        self.boilerplate.unmount();
        for library in &self.libraries {
            library.spec().unmount();
        }
        self.app_spec.unmount();
    }
}

/// Schema and services of the built-in boilerplate module.
fn boilerplate_spec(cache: &Arc<Cache>, scheduler_core: &Arc<SchedulerCore>) -> ModuleSpec {
    let schema = vec![
        (
            "LOG_LEVEL".to_owned(),
            ConfigSpec::string()
                .with_default("info")
                .enumerated(["trace", "debug", "info", "warn", "error", "silent"])
                .describe("minimum severity emitted by the logger"),
        ),
        (
            "CONFIG".to_owned(),
            ConfigSpec::string()
                .describe("path to a single configuration file, replacing the search list"),
        ),
        (
            "CACHE_PROVIDER".to_owned(),
            ConfigSpec::string()
                .with_default("memory")
                .enumerated(["memory", "redis"])
                .describe("cache backend"),
        ),
        (
            "CACHE_PREFIX".to_owned(),
            ConfigSpec::string()
                .with_default("")
                .describe("namespace prepended to every cache key"),
        ),
        (
            "CACHE_TTL".to_owned(),
            ConfigSpec::number()
                .with_default(86_400.0)
                .describe("default cache TTL in seconds"),
        ),
    ];

    let configuration_factory = erase_factory(move |params: ServiceParams| async move {
        let manager = params.config().manager().clone();
        Ok(Some(manager as ServiceApi))
    });

    let logger_factory = erase_factory(move |params: ServiceParams| async move {
        let manager = params.config().manager().clone();
        params.lifecycle().on_post_config(move || {
            let manager = manager.clone();
            async move {
                if let Some(value) = manager.get(BOILERPLATE_MODULE, "LOG_LEVEL") {
                    if let Some(level) = value.as_str() {
                        logging::set_level(level);
                    }
                }
                Ok(())
            }
        });
        params
            .config()
            .on_update(Some(BOILERPLATE_MODULE), Some("LOG_LEVEL"), |_, _, value| {
                if let Some(level) = value.as_str() {
                    logging::set_level(level);
                }
            });
        Ok(Some(Arc::new(Logger::new(BOILERPLATE_MODULE)) as ServiceApi))
    });

    let shared_cache = cache.clone();
    let cache_factory = erase_factory(move |params: ServiceParams| {
        let cache = shared_cache.clone();
        async move {
            let manager = params.config().manager().clone();
            {
                let cache = cache.clone();
                let manager = manager.clone();
                params.lifecycle().on_post_config(move || {
                    let cache = cache.clone();
                    let manager = manager.clone();
                    async move {
                        apply_cache_settings(&cache, &manager);
                        Ok(())
                    }
                });
            }
            {
                let cache = cache.clone();
                params.config().on_update(
                    Some(BOILERPLATE_MODULE),
                    Some("CACHE_PREFIX"),
                    move |_, _, value| {
                        if let Some(prefix) = value.as_str() {
                            cache.set_prefix(prefix);
                        }
                    },
                );
            }
            {
                let cache = cache.clone();
                params.config().on_update(
                    Some(BOILERPLATE_MODULE),
                    Some("CACHE_TTL"),
                    move |_, _, value| {
                        if let Some(seconds) = value.as_number() {
                            if seconds.is_finite() && seconds >= 0.0 {
                                cache.set_default_ttl(seconds as u64);
                            }
                        }
                    },
                );
            }
            Ok(Some(cache as ServiceApi))
        }
    });

    let core = scheduler_core.clone();
    let scheduler_factory = erase_factory(move |params: ServiceParams| {
        let core = core.clone();
        async move {
            {
                let core = core.clone();
                params.lifecycle().on_ready(move || {
                    let core = core.clone();
                    async move {
                        core.activate();
                        Ok(())
                    }
                });
            }
            params.lifecycle().on_pre_shutdown(move || {
                let core = core.clone();
                async move {
                    core.quiesce();
                    Ok(())
                }
            });
            Ok(None)
        }
    });

    ModuleSpec::new(
        BOILERPLATE_MODULE.to_owned(),
        schema,
        vec![
            ("configuration".to_owned(), configuration_factory),
            ("logger".to_owned(), logger_factory),
            ("cache".to_owned(), cache_factory),
            ("scheduler".to_owned(), scheduler_factory),
        ],
        vec!["configuration".to_owned(), "logger".to_owned()],
    )
}

fn apply_cache_settings(cache: &Arc<Cache>, manager: &Arc<ConfigManager>) {
    if let Some(value) = manager.get(BOILERPLATE_MODULE, "CACHE_PROVIDER") {
        if let Some(name) = value.as_str() {
            let _provider = CacheProvider::resolve(name);
        }
    }
    if let Some(value) = manager.get(BOILERPLATE_MODULE, "CACHE_PREFIX") {
        if let Some(prefix) = value.as_str() {
            cache.set_prefix(prefix);
        }
    }
    if let Some(value) = manager.get(BOILERPLATE_MODULE, "CACHE_TTL") {
        if let Some(seconds) = value.as_number() {
            if seconds.is_finite() && seconds >= 0.0 {
                cache.set_default_ttl(seconds as u64);
            }
        }
    }
}

// ============================================================================
// Application bootstrap / teardown surface
// ============================================================================

impl Application {
    /// Boot the application: wire the boilerplate module, libraries in plan
    /// order, then the application's services; load configuration; run
    /// `PreInit → PostConfig → Bootstrap → Ready`. Resolves once `Ready`
    /// completes; the application stays alive until [`Application::teardown`].
    ///
    /// # Errors
    /// - [`BootstrapError::DoubleBoot`] when this application is already
    ///   booted.
    /// - [`BootstrapError::NoDualBoot`] when another application is active
    ///   in this process.
    /// - Plan errors, [`BootstrapError::MissingRequiredConfig`] and
    ///   [`BootstrapError::ServiceFactoryFailure`] as documented on each
    ///   variant. A failed bootstrap leaves the process bootable again.
    pub async fn bootstrap(&self, options: BootstrapOptions) -> Result<(), BootstrapError> {
        if self.inner.booted.swap(true, Ordering::SeqCst) {
            return Err(BootstrapError::DoubleBoot {
                application: self.name().to_owned(),
            });
        }
        {
            let mut active = ACTIVE_APPLICATION.lock();
            if let Some(existing) = active.clone() {
                self.inner.booted.store(false, Ordering::SeqCst);
                return Err(BootstrapError::NoDualBoot { active: existing });
            }
            *active = Some(self.name().to_owned());
        }

        logging::init("info");

        let kernel = match Kernel::plan(self) {
            Ok(kernel) => Arc::new(kernel),
            Err(error) => {
                self.release_boot_guards();
                return Err(error);
            }
        };

        match kernel.boot(options).await {
            Ok(()) => {
                *self.inner.active.lock() = Some(kernel);
                Ok(())
            }
            Err(error) => {
                kernel.dismantle();
                self.release_boot_guards();
                Err(error)
            }
        }
    }

    /// Wind the application down: `PreShutdown` (scheduler quiesce) →
    /// `ShutdownStart` → `ShutdownComplete`, then detach signal handlers and
    /// clear all boot state. Calling this with no active application logs
    /// and returns.
    pub async fn teardown(&self) {
        let kernel = self.inner.active.lock().take();
        let Some(kernel) = kernel else {
            tracing::info!(
                application = %self.name(),
                "teardown requested with no active application"
            );
            return;
        };
        kernel.shutdown().await;
        self.release_boot_guards();
        tracing::info!(application = %self.name(), "teardown complete");
    }

    /// Block until the kernel's cancellation token fires (termination signal
    /// or an explicit cancel). Returns immediately when not booted.
    pub async fn wait(&self) {
        let cancel = self
            .inner
            .active
            .lock()
            .as_ref()
            .map(|kernel| kernel.cancel_token());
        if let Some(cancel) = cancel {
            cancel.cancelled().await;
        }
    }

    /// Convenience runner: bootstrap, wait for a termination signal, tear
    /// down.
    ///
    /// # Errors
    /// Propagates bootstrap failures; teardown itself is infallible.
    pub async fn run(&self, options: BootstrapOptions) -> Result<(), BootstrapError> {
        self.bootstrap(options).await?;
        self.wait().await;
        self.teardown().await;
        Ok(())
    }

    fn release_boot_guards(&self) {
        self.inner.booted.store(false, Ordering::SeqCst);
        let mut active = ACTIVE_APPLICATION.lock();
        if active.as_deref() == Some(self.name()) {
            *active = None;
        }
    }
}
