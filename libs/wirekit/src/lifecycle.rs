//! Lifecycle stages and the callback engine that drives them.
//!
//! Each module owns a [`Lifecycle`] holding its per-stage hook lists. During
//! a boot the kernel mounts a shared [`LifecycleRuntime`] into every module
//! so late attaches can be detected: attaching to a completed run stage
//! defers the hook onto a queue drained between stages (or immediately once
//! the engine is idle), attaching to a completed shutdown stage drops the
//! hook with a fatal-severity log.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;

/// The ordered lifecycle stages.
///
/// `PreShutdown` is the quiescing hook between `Ready` and `ShutdownStart`;
/// the scheduler stops all entries there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    PreInit,
    PostConfig,
    Bootstrap,
    Ready,
    PreShutdown,
    ShutdownStart,
    ShutdownComplete,
}

impl LifecycleStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreInit => "PreInit",
            Self::PostConfig => "PostConfig",
            Self::Bootstrap => "Bootstrap",
            Self::Ready => "Ready",
            Self::PreShutdown => "PreShutdown",
            Self::ShutdownStart => "ShutdownStart",
            Self::ShutdownComplete => "ShutdownComplete",
        }
    }

    /// Shutdown stages refuse late attaches instead of deferring them.
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            Self::PreShutdown | Self::ShutdownStart | Self::ShutdownComplete
        )
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type HookFuture = BoxFuture<'static, anyhow::Result<()>>;
pub(crate) type Hook = Arc<dyn Fn() -> HookFuture + Send + Sync>;

#[derive(Clone)]
struct HookEntry {
    priority: Option<i32>,
    seq: u64,
    hook: Hook,
}

/// Boot-scoped engine state shared by every module's lifecycle.
pub(crate) struct LifecycleRuntime {
    completed: Mutex<HashSet<LifecycleStage>>,
    deferred: Mutex<Vec<(Arc<str>, Hook)>>,
    engine_active: AtomicBool,
}

impl LifecycleRuntime {
    pub(crate) fn new() -> Self {
        Self {
            completed: Mutex::new(HashSet::new()),
            deferred: Mutex::new(Vec::new()),
            engine_active: AtomicBool::new(false),
        }
    }

    fn is_complete(&self, stage: LifecycleStage) -> bool {
        self.completed.lock().contains(&stage)
    }

    fn mark_complete(&self, stage: LifecycleStage) {
        self.completed.lock().insert(stage);
    }

    pub(crate) fn clear(&self) {
        self.completed.lock().clear();
        self.deferred.lock().clear();
    }

    /// Queue a late-attached hook. Outside a stage run there is no
    /// between-stage drain coming, so schedule one on the executor.
    fn defer(self: &Arc<Self>, module: Arc<str>, hook: Hook) {
        self.deferred.lock().push((module, hook));
        if !self.engine_active.load(Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let runtime = Arc::clone(self);
                handle.spawn(async move {
                    runtime.drain_deferred().await;
                });
            }
        }
    }

    pub(crate) async fn drain_deferred(&self) {
        loop {
            let batch: Vec<(Arc<str>, Hook)> = std::mem::take(&mut *self.deferred.lock());
            if batch.is_empty() {
                return;
            }
            for (module, hook) in batch {
                if let Err(error) = hook().await {
                    tracing::error!(module = %module, error = %error, "deferred lifecycle callback failed");
                }
            }
        }
    }
}

/// Per-module lifecycle: hook registration and stage bookkeeping.
pub struct Lifecycle {
    module: Arc<str>,
    hooks: Mutex<HashMap<LifecycleStage, Vec<HookEntry>>>,
    seq: AtomicU64,
    runtime: ArcSwapOption<LifecycleRuntime>,
}

impl Lifecycle {
    pub(crate) fn new(module: impl Into<Arc<str>>) -> Self {
        Self {
            module: module.into(),
            hooks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            runtime: ArcSwapOption::from(None),
        }
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Register a hook for a stage. `priority` of `None` means unordered:
    /// such hooks run after every prioritized hook, concurrently with each
    /// other. Lower priorities run earlier; ties break by registration
    /// order.
    pub fn attach<F, Fut>(&self, stage: LifecycleStage, priority: Option<i32>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook: Hook = Arc::new(move || {
            let fut: HookFuture = Box::pin(hook());
            fut
        });
        if let Some(runtime) = self.runtime.load_full() {
            if runtime.is_complete(stage) {
                if stage.is_shutdown() {
                    tracing::error!(
                        module = %self.module,
                        stage = %stage,
                        fatal = true,
                        "cannot attach a callback to a completed shutdown stage; dropping it"
                    );
                } else {
                    tracing::debug!(
                        module = %self.module,
                        stage = %stage,
                        "stage already completed, deferring callback"
                    );
                    runtime.defer(self.module.clone(), hook);
                }
                return;
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().entry(stage).or_default().push(HookEntry {
            priority,
            seq,
            hook,
        });
    }

    pub fn on_pre_init<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::PreInit, None, hook);
    }

    pub fn on_post_config<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::PostConfig, None, hook);
    }

    pub fn on_bootstrap<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::Bootstrap, None, hook);
    }

    pub fn on_ready<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::Ready, None, hook);
    }

    pub fn on_pre_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::PreShutdown, None, hook);
    }

    pub fn on_shutdown_start<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::ShutdownStart, None, hook);
    }

    pub fn on_shutdown_complete<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(LifecycleStage::ShutdownComplete, None, hook);
    }

    pub(crate) fn mount(&self, runtime: Arc<LifecycleRuntime>) {
        self.runtime.store(Some(runtime));
    }

    /// Drop runtime state and every registered hook; services re-register
    /// on the next boot when their factories run again.
    pub(crate) fn unmount(&self) {
        self.runtime.store(None);
        self.hooks.lock().clear();
        self.seq.store(0, Ordering::SeqCst);
    }

    fn entries_for(&self, stage: LifecycleStage, executed: &HashSet<u64>) -> Vec<HookEntry> {
        self.hooks
            .lock()
            .get(&stage)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !executed.contains(&e.seq))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub(crate) struct StageFailure {
    pub module: String,
    pub error: anyhow::Error,
}

/// Run one stage across all modules in the given order.
///
/// Hooks registered while the stage is running (by earlier hooks of the same
/// stage) are picked up before the stage is declared complete. With
/// `fail_fast` the first hook error aborts the stage; otherwise errors are
/// logged and the stage continues.
pub(crate) async fn run_stage(
    runtime: &Arc<LifecycleRuntime>,
    stage: LifecycleStage,
    modules: &[Arc<Lifecycle>],
    fail_fast: bool,
) -> Result<Duration, StageFailure> {
    let started = Instant::now();
    runtime.engine_active.store(true, Ordering::SeqCst);
    let result = run_stage_inner(stage, modules, fail_fast).await;
    match result {
        Ok(()) => {
            runtime.mark_complete(stage);
            runtime.drain_deferred().await;
            runtime.engine_active.store(false, Ordering::SeqCst);
            Ok(started.elapsed())
        }
        Err(failure) => {
            runtime.engine_active.store(false, Ordering::SeqCst);
            Err(failure)
        }
    }
}

async fn run_stage_inner(
    stage: LifecycleStage,
    modules: &[Arc<Lifecycle>],
    fail_fast: bool,
) -> Result<(), StageFailure> {
    for lifecycle in modules {
        let mut executed: HashSet<u64> = HashSet::new();
        loop {
            let mut pending = lifecycle.entries_for(stage, &executed);
            if pending.is_empty() {
                break;
            }
            for entry in &pending {
                executed.insert(entry.seq);
            }

            let unordered: Vec<HookEntry> =
                pending.iter().filter(|e| e.priority.is_none()).cloned().collect();
            pending.retain(|e| e.priority.is_some());
            pending.sort_by_key(|e| (e.priority, e.seq));

            for entry in pending {
                if let Err(error) = (entry.hook)().await {
                    handle_hook_error(lifecycle.module(), stage, error, fail_fast)?;
                }
            }

            let futures: Vec<HookFuture> =
                unordered.iter().map(|entry| (entry.hook)()).collect();
            for result in join_all(futures).await {
                if let Err(error) = result {
                    handle_hook_error(lifecycle.module(), stage, error, fail_fast)?;
                }
            }
        }
    }
    Ok(())
}

fn handle_hook_error(
    module: &str,
    stage: LifecycleStage,
    error: anyhow::Error,
    fail_fast: bool,
) -> Result<(), StageFailure> {
    if fail_fast {
        return Err(StageFailure {
            module: module.to_owned(),
            error,
        });
    }
    tracing::error!(module = %module, stage = %stage, error = %error, "lifecycle callback failed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn record(log: &Arc<StdMutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_owned());
    }

    #[tokio::test]
    async fn prioritized_hooks_run_in_order_before_unordered() {
        let log = recorder();
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        for (name, priority) in [("second", Some(10)), ("first", Some(-1)), ("free", None)] {
            let log = log.clone();
            let name = name.to_owned();
            lifecycle.attach(LifecycleStage::Ready, priority, move || {
                let log = log.clone();
                let name = name.clone();
                async move {
                    record(&log, &name);
                    Ok(())
                }
            });
        }

        let duration = run_stage(&runtime, LifecycleStage::Ready, &[lifecycle], false)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert!(duration >= Duration::ZERO);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["first".to_owned(), "second".to_owned(), "free".to_owned()]
        );
    }

    #[tokio::test]
    async fn priority_ties_break_by_registration_order() {
        let log = recorder();
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        for name in ["a", "b", "c"] {
            let log = log.clone();
            let name = name.to_owned();
            lifecycle.attach(LifecycleStage::Bootstrap, Some(5), move || {
                let log = log.clone();
                let name = name.clone();
                async move {
                    record(&log, &name);
                    Ok(())
                }
            });
        }

        run_stage(&runtime, LifecycleStage::Bootstrap, &[lifecycle], false)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["a".to_owned(), "b".to_owned(), "c".to_owned()]
        );
    }

    #[tokio::test]
    async fn hooks_registered_mid_stage_still_run_during_it() {
        let log = recorder();
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        let inner_log = log.clone();
        let inner_lifecycle = lifecycle.clone();
        lifecycle.attach(LifecycleStage::Ready, Some(0), move || {
            let log = inner_log.clone();
            let lifecycle = inner_lifecycle.clone();
            async move {
                record(&log, "outer");
                let log2 = log.clone();
                lifecycle.attach(LifecycleStage::Ready, None, move || {
                    let log = log2.clone();
                    async move {
                        record(&log, "inner");
                        Ok(())
                    }
                });
                Ok(())
            }
        });

        run_stage(&runtime, LifecycleStage::Ready, &[lifecycle], false)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["outer".to_owned(), "inner".to_owned()]
        );
    }

    #[tokio::test]
    async fn late_attach_to_run_stage_defers() {
        let log = recorder();
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        run_stage(&runtime, LifecycleStage::Ready, std::slice::from_ref(&lifecycle), false)
            .await
            .map_err(|f| f.error)
            .unwrap();

        let late_log = log.clone();
        lifecycle.on_ready(move || {
            let log = late_log.clone();
            async move {
                record(&log, "late");
                Ok(())
            }
        });

        // The deferred drain is spawned onto the executor.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(log.lock().unwrap().as_slice(), &["late".to_owned()]);
    }

    #[tokio::test]
    async fn late_attach_to_shutdown_stage_is_dropped() {
        let log = recorder();
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        run_stage(
            &runtime,
            LifecycleStage::ShutdownStart,
            std::slice::from_ref(&lifecycle),
            false,
        )
        .await
        .map_err(|f| f.error)
        .unwrap();

        let late_log = log.clone();
        lifecycle.on_shutdown_start(move || {
            let log = late_log.clone();
            async move {
                record(&log, "never");
                Ok(())
            }
        });

        runtime.drain_deferred().await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_fast_propagates_and_lenient_continues() {
        let lifecycle = Arc::new(Lifecycle::new("m"));
        let runtime = Arc::new(LifecycleRuntime::new());
        lifecycle.mount(runtime.clone());

        lifecycle.attach(LifecycleStage::Bootstrap, Some(0), || async {
            anyhow::bail!("boom")
        });

        let err = run_stage(
            &runtime,
            LifecycleStage::Bootstrap,
            std::slice::from_ref(&lifecycle),
            true,
        )
        .await
        .err()
        .expect("stage should fail");
        assert_eq!(err.module, "m");

        // Lenient mode logs and completes the stage.
        run_stage(&runtime, LifecycleStage::Bootstrap, &[lifecycle], false)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert!(runtime.is_complete(LifecycleStage::Bootstrap));
    }

    #[tokio::test]
    async fn modules_run_in_given_order() {
        let log = recorder();
        let runtime = Arc::new(LifecycleRuntime::new());

        let mut modules = Vec::new();
        for name in ["boilerplate", "lib-a", "app"] {
            let lifecycle = Arc::new(Lifecycle::new(name));
            lifecycle.mount(runtime.clone());
            let log = log.clone();
            let tag = name.to_owned();
            lifecycle.on_ready(move || {
                let log = log.clone();
                let tag = tag.clone();
                async move {
                    record(&log, &tag);
                    Ok(())
                }
            });
            modules.push(lifecycle);
        }

        run_stage(&runtime, LifecycleStage::Ready, &modules, false)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["boilerplate".to_owned(), "lib-a".to_owned(), "app".to_owned()]
        );
    }
}
