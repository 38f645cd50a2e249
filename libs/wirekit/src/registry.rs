//! Library and application definitions.
//!
//! Definitions are pure values: building one validates it but mounts
//! nothing. Mounting happens during bootstrap, when the kernel registers the
//! module's schema with the configuration manager and wires its services.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::{ConfigManager, ConfigSpec, ConfigValue, Schema};
use crate::errors::DefinitionError;
use crate::kernel::Kernel;
use crate::lifecycle::Lifecycle;
use crate::params::ServiceParams;

/// Type-erased exported operations of a service. Peers downcast to the
/// concrete API type via `Peers::get`.
pub type ServiceApi = Arc<dyn Any + Send + Sync>;

/// What a factory produces: an API for peers, or nothing.
pub type ServiceResult = anyhow::Result<Option<ServiceApi>>;

pub type ServiceFuture = BoxFuture<'static, ServiceResult>;

/// A service factory. Called exactly once per boot, with the injected
/// parameter bundle.
pub type ServiceFactory = Arc<dyn Fn(ServiceParams) -> ServiceFuture + Send + Sync>;

pub(crate) fn erase_factory<F, Fut>(factory: F) -> ServiceFactory
where
    F: Fn(ServiceParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServiceResult> + Send + 'static,
{
    Arc::new(move |params| {
        let fut: ServiceFuture = Box::pin(factory(params));
        fut
    })
}

/// The parts of a module the kernel needs to mount and wire it. Shared
/// between the definition handle and the kernel of the active boot.
pub(crate) struct ModuleSpec {
    pub name: Arc<str>,
    pub schema: Schema,
    pub services: Vec<(String, ServiceFactory)>,
    pub priority_init: Vec<String>,
    pub lifecycle: Arc<Lifecycle>,
    /// Configuration manager of the active boot, if any.
    pub mounted: ArcSwapOption<ConfigManager>,
}

impl ModuleSpec {
    pub(crate) fn new(
        name: String,
        schema: Schema,
        services: Vec<(String, ServiceFactory)>,
        priority_init: Vec<String>,
    ) -> Self {
        let name: Arc<str> = name.into();
        Self {
            lifecycle: Arc::new(Lifecycle::new(name.clone())),
            name,
            schema,
            services,
            priority_init,
            mounted: ArcSwapOption::from(None),
        }
    }

    pub(crate) fn mount(&self, manager: &Arc<ConfigManager>) {
        self.mounted.store(Some(manager.clone()));
    }

    pub(crate) fn unmount(&self) {
        self.mounted.store(None);
        self.lifecycle.unmount();
    }

    fn get_config(&self, key: &str) -> Option<ConfigValue> {
        self.mounted.load_full()?.get(&self.name, key)
    }
}

fn validate(
    name: &str,
    services: &[(String, ServiceFactory)],
    priority_init: &[String],
) -> Result<(), DefinitionError> {
    if name.trim().is_empty() {
        return Err(DefinitionError::MissingLibraryName);
    }
    for (index, (service, _)) in services.iter().enumerate() {
        if service.trim().is_empty() {
            return Err(DefinitionError::InvalidServiceDefinition {
                module: name.to_owned(),
                service: service.clone(),
                reason: "service name must not be empty".to_owned(),
            });
        }
        if services[..index].iter().any(|(other, _)| other == service) {
            return Err(DefinitionError::DuplicateService {
                module: name.to_owned(),
                service: service.clone(),
            });
        }
    }
    for (index, entry) in priority_init.iter().enumerate() {
        if priority_init[..index].contains(entry) {
            return Err(DefinitionError::DoublePriority {
                module: name.to_owned(),
                service: entry.clone(),
            });
        }
        if !services.iter().any(|(service, _)| service == entry) {
            return Err(DefinitionError::InvalidServiceDefinition {
                module: name.to_owned(),
                service: entry.clone(),
                reason: "priority init names a service that does not exist".to_owned(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Library
// ============================================================================

pub(crate) struct LibraryInner {
    pub spec: Arc<ModuleSpec>,
    pub depends: Vec<Library>,
}

/// A validated library definition.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl Library {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> LibraryBuilder {
        LibraryBuilder {
            name: name.into(),
            schema: Vec::new(),
            services: Vec::new(),
            priority_init: Vec::new(),
            depends: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Lifecycle handle for attaching stage callbacks.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.spec.lifecycle
    }

    /// Resolved configuration value for this library, once it is mounted in
    /// an active application.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<ConfigValue> {
        self.inner.spec.get_config(key)
    }

    pub(crate) fn spec(&self) -> &Arc<ModuleSpec> {
        &self.inner.spec
    }

    pub(crate) fn depends(&self) -> &[Library] {
        &self.inner.depends
    }

    pub(crate) fn ptr_eq(&self, other: &Library) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name())
            .field(
                "services",
                &self
                    .inner
                    .spec
                    .services
                    .iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>(),
            )
            .field(
                "depends",
                &self.inner.depends.iter().map(Library::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`Library`].
pub struct LibraryBuilder {
    name: String,
    schema: Schema,
    services: Vec<(String, ServiceFactory)>,
    priority_init: Vec<String>,
    depends: Vec<Library>,
}

impl LibraryBuilder {
    /// Declare a configuration key.
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, spec: ConfigSpec) -> Self {
        self.schema.push((key.into(), spec));
        self
    }

    /// Declare a service factory.
    #[must_use]
    pub fn service<F, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ServiceParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        self.services.push((name.into(), erase_factory(factory)));
        self
    }

    /// Services constructed before the rest of the module, in this order.
    #[must_use]
    pub fn priority_init<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_init.extend(names.into_iter().map(Into::into));
        self
    }

    /// Require another library to be attached to the application and wired
    /// earlier.
    #[must_use]
    pub fn depends_on(mut self, library: &Library) -> Self {
        self.depends.push(library.clone());
        self
    }

    /// Validate and produce the definition.
    ///
    /// # Errors
    /// Any breach of the definition invariants (empty names, duplicate
    /// services, duplicate priority entries).
    pub fn build(self) -> Result<Library, DefinitionError> {
        validate(&self.name, &self.services, &self.priority_init)?;
        Ok(Library {
            inner: Arc::new(LibraryInner {
                spec: Arc::new(ModuleSpec::new(
                    self.name,
                    self.schema,
                    self.services,
                    self.priority_init,
                )),
                depends: self.depends,
            }),
        })
    }
}

/// Validating constructor form of [`Library::builder`].
///
/// # Errors
/// See [`LibraryBuilder::build`].
pub fn create_library(builder: LibraryBuilder) -> Result<Library, DefinitionError> {
    builder.build()
}

// ============================================================================
// Application
// ============================================================================

pub(crate) struct ApplicationInner {
    pub spec: Arc<ModuleSpec>,
    pub libraries: Vec<Library>,
    pub booted: AtomicBool,
    pub active: Mutex<Option<Arc<Kernel>>>,
}

/// A validated application definition: libraries plus the application's own
/// services.
#[derive(Clone)]
pub struct Application {
    pub(crate) inner: Arc<ApplicationInner>,
}

impl Application {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            schema: Vec::new(),
            services: Vec::new(),
            priority_init: Vec::new(),
            libraries: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.spec.lifecycle
    }

    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<ConfigValue> {
        self.inner.spec.get_config(key)
    }

    #[must_use]
    pub fn libraries(&self) -> &[Library] {
        &self.inner.libraries
    }

    #[must_use]
    pub fn is_booted(&self) -> bool {
        self.inner.booted.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn spec(&self) -> &Arc<ModuleSpec> {
        &self.inner.spec
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name())
            .field(
                "libraries",
                &self.inner.libraries.iter().map(Library::name).collect::<Vec<_>>(),
            )
            .field("booted", &self.is_booted())
            .finish()
    }
}

/// Builder for [`Application`].
pub struct ApplicationBuilder {
    name: String,
    schema: Schema,
    services: Vec<(String, ServiceFactory)>,
    priority_init: Vec<String>,
    libraries: Vec<Library>,
}

impl ApplicationBuilder {
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, spec: ConfigSpec) -> Self {
        self.schema.push((key.into(), spec));
        self
    }

    #[must_use]
    pub fn service<F, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ServiceParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        self.services.push((name.into(), erase_factory(factory)));
        self
    }

    #[must_use]
    pub fn priority_init<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_init.extend(names.into_iter().map(Into::into));
        self
    }

    /// Attach a library. Order is preserved and acts as the tie-breaker for
    /// the dependency sort.
    #[must_use]
    pub fn library(mut self, library: &Library) -> Self {
        self.libraries.push(library.clone());
        self
    }

    /// Validate and produce the definition.
    ///
    /// # Errors
    /// Same invariants as [`LibraryBuilder::build`].
    pub fn build(self) -> Result<Application, DefinitionError> {
        validate(&self.name, &self.services, &self.priority_init)?;
        Ok(Application {
            inner: Arc::new(ApplicationInner {
                spec: Arc::new(ModuleSpec::new(
                    self.name,
                    self.schema,
                    self.services,
                    self.priority_init,
                )),
                libraries: self.libraries,
                booted: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        })
    }
}

/// Validating constructor form of [`Application::builder`].
///
/// # Errors
/// See [`ApplicationBuilder::build`].
pub fn create_application(builder: ApplicationBuilder) -> Result<Application, DefinitionError> {
    builder.build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn noop_service(_params: ServiceParams) -> ServiceResult {
        Ok(None)
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Library::builder("  ").build().unwrap_err();
        assert!(matches!(err, DefinitionError::MissingLibraryName));
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let err = Library::builder("lib")
            .service("api", noop_service)
            .service("api", noop_service)
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateService { .. }));
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let err = Library::builder("lib")
            .service("", noop_service)
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidServiceDefinition { .. }));
    }

    #[test]
    fn duplicate_priority_entry_is_rejected() {
        let err = Library::builder("lib")
            .service("api", noop_service)
            .priority_init(["api", "api"])
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DoublePriority { .. }));
    }

    #[test]
    fn priority_entry_must_name_a_service() {
        let err = Library::builder("lib")
            .service("api", noop_service)
            .priority_init(["ghost"])
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidServiceDefinition { .. }));
    }

    #[test]
    fn get_config_is_none_until_mounted() {
        let lib = Library::builder("lib")
            .config("KEY", ConfigSpec::string().with_default("v"))
            .build()
            .unwrap();
        assert!(lib.get_config("KEY").is_none());
    }

    #[test]
    fn application_collects_libraries_in_order() {
        let a = Library::builder("a").build().unwrap();
        let b = Library::builder("b").build().unwrap();
        let app = Application::builder("app")
            .library(&a)
            .library(&b)
            .build()
            .unwrap();
        let names: Vec<_> = app.libraries().iter().map(Library::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!app.is_booted());
    }
}
