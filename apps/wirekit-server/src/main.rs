//! Demo wirekit host: a heartbeat library plus a small status service.
//!
//! The kernel consumes its own CLI switches (`--config`, `--env-file`,
//! `--<MODULE>_<KEY>`), so the binary forwards the argument vector untouched
//! and only decides the exit code: signals tear the application down and
//! exit 0, a failed bootstrap exits non-zero.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use wirekit::{
    Application, BootstrapOptions, ConfigSpec, Library, ServiceApi, ServiceParams,
};

/// API the heartbeat library exports to peers.
struct HeartbeatApi {
    cache_key: &'static str,
}

impl HeartbeatApi {
    fn cache_key(&self) -> &'static str {
        self.cache_key
    }
}

fn heartbeat_library() -> anyhow::Result<Library> {
    let library = Library::builder("heartbeat")
        .config(
            "INTERVAL_SECONDS",
            ConfigSpec::number()
                .with_default(30.0)
                .describe("seconds between heartbeats"),
        )
        .config(
            "MESSAGE",
            ConfigSpec::string()
                .with_default("alive")
                .describe("message logged on every beat"),
        )
        .service("pulse", |params: ServiceParams| async move {
            let period = params
                .config()
                .get("INTERVAL_SECONDS")
                .and_then(|v| v.as_number())
                .filter(|n| n.is_finite() && *n >= 1.0)
                .unwrap_or(30.0);

            let logger = params.logger().clone();
            let config = params.config().clone();
            let cache = params.cache().clone();
            params
                .scheduler()
                .interval(Duration::from_secs(period as u64), move || {
                    let logger = logger.clone();
                    let config = config.clone();
                    let cache = cache.clone();
                    async move {
                        let message = config
                            .get("MESSAGE")
                            .and_then(|v| v.as_str().map(ToOwned::to_owned))
                            .unwrap_or_else(|| "alive".to_owned());
                        cache
                            .set("heartbeat:last", serde_json::json!(message), None)
                            .await;
                        logger.info(&message);
                        Ok(())
                    }
                });

            Ok(Some(
                Arc::new(HeartbeatApi {
                    cache_key: "heartbeat:last",
                }) as ServiceApi,
            ))
        })
        .priority_init(["pulse"])
        .build()?;
    Ok(library)
}

fn build_application() -> anyhow::Result<Application> {
    let heartbeat = heartbeat_library()?;

    let app = Application::builder("wirekit-server")
        .library(&heartbeat)
        .service("status", |params: ServiceParams| async move {
            let api = params.peers().get::<HeartbeatApi>("heartbeat", "pulse")?;
            let logger = params.logger().clone();
            let cache = params.cache().clone();
            let key = api.cache_key();
            params.lifecycle().on_ready(move || {
                let logger = logger.clone();
                let cache = cache.clone();
                async move {
                    let last = cache.get(key).await;
                    logger.info(&format!("ready; last heartbeat: {last:?}"));
                    Ok(())
                }
            });
            Ok(None)
        })
        .build()?;
    Ok(app)
}

#[tokio::main]
async fn main() -> ExitCode {
    let app = match build_application() {
        Ok(app) => app,
        Err(error) => {
            eprintln!("invalid application definition: {error}");
            return ExitCode::FAILURE;
        }
    };

    match app.run(BootstrapOptions::default()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, code = error.code(), "bootstrap failed");
            ExitCode::FAILURE
        }
    }
}
