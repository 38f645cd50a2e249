//! wirekit — an application runtime kernel for modular services.
//!
//! The kernel composes *libraries* and an *application* out of named
//! *services*, resolves library dependency order, threads layered
//! configuration through every module (files, environment, CLI switches,
//! bootstrap overrides), drives a six-stage lifecycle
//! (`PreInit → PostConfig → Bootstrap → Ready → ShutdownStart →
//! ShutdownComplete`, with a `PreShutdown` quiescing hook), and provides the
//! shared facilities services rely on: a lifecycle-tied scheduler, a
//! context-tagged logger, an async cache and an event bus.
//!
//! ```no_run
//! use wirekit::{Application, BootstrapOptions, ConfigSpec, Library};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let weather = Library::builder("weather")
//!     .config("CURRENT_WEATHER", ConfigSpec::string().with_default("raining"))
//!     .service("report", |params: wirekit::ServiceParams| async move {
//!         params.lifecycle().on_ready(move || async { Ok(()) });
//!         Ok(None)
//!     })
//!     .build()?;
//!
//! let app = Application::builder("demo").library(&weather).build()?;
//! app.run(BootstrapOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod kernel;
pub mod lifecycle;
pub mod logging;
pub mod params;
mod planner;
pub mod registry;
pub mod scheduler;
pub mod shutdown;

pub use cache::{Cache, CacheProvider, CacheStore};
pub use config::loaders::{LoaderOptions, SearchPaths};
pub use config::{ConfigKind, ConfigManager, ConfigSpec, ConfigValue, parse_config};
pub use errors::{
    BootstrapError, ConfigError, DefinitionError, PeerError, ScheduleError,
};
pub use events::{EventBus, ListenerId};
pub use kernel::{BOILERPLATE_MODULE, BootstrapOptions};
pub use lifecycle::{Lifecycle, LifecycleStage};
pub use logging::Logger;
pub use params::{ConfigAccessor, Internal, Peers, ServiceParams};
pub use registry::{
    Application, ApplicationBuilder, Library, LibraryBuilder, ServiceApi, ServiceFactory,
    ServiceResult, create_application, create_library,
};
pub use scheduler::{Scheduler, SchedulerHandle};
