//! OS termination signal plumbing.

/// Wait for SIGTERM or SIGINT (Ctrl+C on non-Unix platforms).
///
/// # Errors
/// Returns an error when the signal listeners cannot be installed; callers
/// usually fall back to `ctrl_c()`.
pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = terminate.recv() => tracing::debug!("received SIGTERM"),
            _ = interrupt.recv() => tracing::debug!("received SIGINT"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
