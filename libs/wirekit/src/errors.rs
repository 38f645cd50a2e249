//! Structured errors for the wirekit kernel.
//!
//! Every variant maps to a stable string code (see [`DefinitionError::code`]
//! and friends) so operators can grep logs for a known failure class without
//! depending on display formatting.

use thiserror::Error;

/// Construction-time errors, raised synchronously by the library and
/// application builders. These are programming errors and are expected to be
/// caught by tests.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("module name must not be empty")]
    MissingLibraryName,

    #[error("invalid service '{service}' in module '{module}': {reason}")]
    InvalidServiceDefinition {
        module: String,
        service: String,
        reason: String,
    },

    #[error("duplicate service '{service}' in module '{module}'")]
    DuplicateService { module: String, service: String },

    #[error("service '{service}' listed more than once in priority init of module '{module}'")]
    DoublePriority { module: String, service: String },
}

impl DefinitionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingLibraryName => "MissingLibraryName",
            Self::InvalidServiceDefinition { .. } => "InvalidServiceDefinition",
            Self::DuplicateService { .. } => "DuplicateService",
            Self::DoublePriority { .. } => "DoublePriority",
        }
    }
}

/// Plan-time and wire-time errors surfaced by `Application::bootstrap`.
///
/// The kernel never terminates the process itself; the host binary decides
/// what a failed bootstrap means for the exit code.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("library '{library}' depends on '{dependency}', which is not attached to the application")]
    MissingDependency { library: String, dependency: String },

    #[error("library sort cannot make progress; placed so far: [{}]", placed.join(", "))]
    BadSort { placed: Vec<String> },

    #[error("library '{library}' is attached to the application more than once")]
    DuplicateLibrary { library: String },

    #[error("another application ('{active}') is already active in this process")]
    NoDualBoot { active: String },

    #[error("application '{application}' is already booted")]
    DoubleBoot { application: String },

    #[error("service '{service}' is already bound in module '{module}'")]
    DuplicateService { module: String, service: String },

    #[error("missing required config value(s): {}", missing.join(", "))]
    MissingRequiredConfig { missing: Vec<String> },

    #[error("service factory '{context}' failed")]
    ServiceFactoryFailure {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BootstrapError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "MissingDependency",
            Self::BadSort { .. } => "BadSort",
            Self::DuplicateLibrary { .. } => "DuplicateLibrary",
            Self::NoDualBoot { .. } => "NoDualBoot",
            Self::DoubleBoot { .. } => "DoubleBoot",
            Self::DuplicateService { .. } => "DuplicateService",
            Self::MissingRequiredConfig { .. } => "MissingRequiredConfig",
            Self::ServiceFactoryFailure { .. } => "ServiceFactoryFailure",
        }
    }
}

/// Runtime errors from the configuration access API.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config module '{module}'")]
    UnknownModule { module: String },

    #[error("unknown config key '{module}.{key}'")]
    UnknownKey { module: String, key: String },

    #[error("whole-module assignment is not allowed for '{module}'; set a single key instead")]
    NonLeafAssignment { module: String },

    #[error("schema for '{module}' was registered after loaders already ran")]
    LateConfigure { module: String },
}

impl ConfigError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownModule { .. } => "UnknownConfigModule",
            Self::UnknownKey { .. } => "UnknownConfigKey",
            Self::NonLeafAssignment { .. } => "NonLeafAssignment",
            Self::LateConfigure { .. } => "LateConfigure",
        }
    }
}

/// Errors from cross-module API resolution.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer not found: module='{module}', service='{service}'")]
    NotFound { module: String, service: String },

    #[error("peer type mismatch: module='{module}', service='{service}'")]
    TypeMismatch { module: String, service: String },
}

/// Errors from the scheduler constructors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}'")]
    InvalidCronExpression {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
}
