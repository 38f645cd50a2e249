//! Structured logging: process-wide subscriber installation plus the
//! context-tagged logger facade handed to every service.
//!
//! The subscriber is installed once per process with `try_init`, so tests
//! and embedded hosts that already installed one keep theirs. The effective
//! filter sits behind a reload handle; `boilerplate.LOG_LEVEL` drives it at
//! `PostConfig` and on every later `set`.

use std::sync::{Arc, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the process-wide subscriber. `RUST_LOG` wins over the default
/// directive when set. Safe to call repeatedly.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    if subscriber.try_init().is_ok() {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Swap the effective level. `silent` maps to `off`. Returns whether the
/// reload was applied (false when another subscriber owns the process).
pub fn set_level(level: &str) -> bool {
    let directive = match level.to_ascii_lowercase().as_str() {
        "silent" | "none" => "off".to_owned(),
        other => other.to_owned(),
    };
    let Some(handle) = RELOAD_HANDLE.get() else {
        return false;
    };
    match EnvFilter::try_new(&directive) {
        Ok(filter) => handle.reload(filter).is_ok(),
        Err(error) => {
            tracing::warn!(level = %level, error = %error, "ignoring invalid log level");
            false
        }
    }
}

/// Context-tagged logger facade. Every service receives one pre-tagged with
/// `"<module>:<service>"`; `fatal` is reserved by the kernel for
/// unrecoverable wiring errors.
#[derive(Clone)]
pub struct Logger {
    context: Arc<str>,
}

impl Logger {
    #[must_use]
    pub fn new(context: impl Into<Arc<str>>) -> Self {
        Self {
            context: context.into(),
        }
    }

    /// A logger tagged with a sub-context, e.g. a worker inside a service.
    #[must_use]
    pub fn child(&self, suffix: &str) -> Self {
        Self {
            context: format!("{}:{suffix}", self.context).into(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(context = %self.context, "{message}");
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(context = %self.context, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(context = %self.context, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(context = %self.context, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(context = %self.context, "{message}");
    }

    pub fn fatal(&self, message: &str) {
        tracing::error!(context = %self.context, fatal = true, "{message}");
    }

    pub fn trace_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::trace!(context = %self.context, fields = %fields, "{message}");
    }

    pub fn debug_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::debug!(context = %self.context, fields = %fields, "{message}");
    }

    pub fn info_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::info!(context = %self.context, fields = %fields, "{message}");
    }

    pub fn warn_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::warn!(context = %self.context, fields = %fields, "{message}");
    }

    pub fn error_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::error!(context = %self.context, fields = %fields, "{message}");
    }

    pub fn fatal_kv(&self, fields: &serde_json::Value, message: &str) {
        tracing::error!(context = %self.context, fields = %fields, fatal = true, "{message}");
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("context", &self.context)
            .finish()
    }
}
