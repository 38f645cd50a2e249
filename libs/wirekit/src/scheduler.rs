//! Lifecycle-tied scheduling: cron entries, fixed intervals and sliding
//! one-shot timers.
//!
//! Entries created before `Ready` are queued and started when the core
//! activates; entries created afterwards start immediately. Every handle is
//! registered in the kernel-owned core so `PreShutdown` can drain them all.
//! Cancellation is idempotent and never interrupts an in-flight run; it only
//! prevents future ones.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::ScheduleError;

type Job = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn erase_job<F, Fut>(job: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || {
        let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(job());
        fut
    })
}

/// Opaque cancellation token for a scheduled entry (or group of entries
/// created by one call). Cancelling is idempotent.
#[derive(Clone)]
pub struct SchedulerHandle {
    token: CancellationToken,
}

impl SchedulerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum CorePhase {
    /// Collecting entries; nothing runs until activation at `Ready`.
    Idle,
    Active,
}

struct CoreState {
    phase: CorePhase,
    pending: Vec<Box<dyn FnOnce() + Send>>,
    handles: Vec<CancellationToken>,
}

/// Kernel-owned scheduler state shared by every per-context [`Scheduler`].
pub struct SchedulerCore {
    state: Mutex<CoreState>,
}

impl SchedulerCore {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoreState {
                phase: CorePhase::Idle,
                pending: Vec::new(),
                handles: Vec::new(),
            }),
        }
    }

    /// Register an entry. Starts it immediately when active, otherwise at
    /// activation.
    fn submit(&self, token: CancellationToken, start: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        state.handles.push(token);
        match state.phase {
            CorePhase::Active => {
                drop(state);
                start();
            }
            CorePhase::Idle => state.pending.push(start),
        }
    }

    /// Start every queued entry. Runs at `Ready`.
    pub(crate) fn activate(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.phase = CorePhase::Active;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "starting queued scheduler entries");
        }
        for start in pending {
            start();
        }
    }

    /// Cancel every registered handle and return to the idle phase. Runs at
    /// `PreShutdown`; in-flight jobs are allowed to finish.
    pub(crate) fn quiesce(&self) {
        let handles = {
            let mut state = self.state.lock();
            state.phase = CorePhase::Idle;
            state.pending.clear();
            std::mem::take(&mut state.handles)
        };
        if !handles.is_empty() {
            tracing::debug!(count = handles.len(), "stopping scheduler entries");
        }
        for token in handles {
            token.cancel();
        }
    }
}

/// Per-context scheduler view handed to services via `ServiceParams`.
#[derive(Clone)]
pub struct Scheduler {
    context: Arc<str>,
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    pub(crate) fn new(context: Arc<str>, core: Arc<SchedulerCore>) -> Self {
        Self { context, core }
    }

    /// Register one cron entry per expression. Entries start at `Ready`;
    /// the returned handle cancels the entries this call created.
    ///
    /// # Errors
    /// [`ScheduleError::InvalidCronExpression`] if any expression fails to
    /// parse.
    pub fn cron<I, S, F, Fut>(&self, expressions: I, job: F) -> Result<SchedulerHandle, ScheduleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let schedules = expressions
            .into_iter()
            .map(|expr| parse_cron(expr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let job = erase_job(job);
        let token = CancellationToken::new();
        let context = self.context.clone();
        let spawn_token = token.clone();
        self.core.submit(
            token.clone(),
            Box::new(move || {
                for schedule in schedules {
                    let context = context.clone();
                    let job = job.clone();
                    let entry_token = spawn_token.child_token();
                    tokio::spawn(run_cron_entry(context, schedule, job, entry_token));
                }
            }),
        );
        Ok(SchedulerHandle { token })
    }

    /// Run a job on a fixed period, first run one period after `Ready`.
    pub fn interval<F, Fut>(&self, period: Duration, job: F) -> SchedulerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = erase_job(job);
        let token = CancellationToken::new();
        let context = self.context.clone();
        let entry_token = token.clone();
        self.core.submit(
            token.clone(),
            Box::new(move || {
                tokio::spawn(run_interval_entry(context, period, job, entry_token));
            }),
        );
        SchedulerHandle { token }
    }

    /// On each tick of `reset_expression`, ask `next` for the next execution
    /// instant and arm a one-shot timer for it. A past instant skips; a
    /// still-pending one-shot is cancelled with a warning.
    ///
    /// # Errors
    /// [`ScheduleError::InvalidCronExpression`] if the reset expression
    /// fails to parse.
    pub fn sliding<N, F, Fut>(
        &self,
        reset_expression: &str,
        next: N,
        job: F,
    ) -> Result<SchedulerHandle, ScheduleError>
    where
        N: Fn() -> Option<DateTime<Local>> + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let reset = parse_cron(reset_expression)?;
        let job = erase_job(job);
        let next = Arc::new(next);
        let token = CancellationToken::new();
        let context = self.context.clone();
        let entry_token = token.clone();
        self.core.submit(
            token.clone(),
            Box::new(move || {
                tokio::spawn(run_sliding_entry(context, reset, next, job, entry_token));
            }),
        );
        Ok(SchedulerHandle { token })
    }
}

/// Parse a cron expression, accepting classic 5-field expressions by
/// prepending a seconds column.
fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    };
    Schedule::from_str(&normalized).map_err(|source| ScheduleError::InvalidCronExpression {
        expression: expression.to_owned(),
        source,
    })
}

fn until(instant: DateTime<Local>) -> Duration {
    (instant - Local::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Error-swallowing envelope around every job run: failures are logged with
/// the owning context and never reach the scheduler runtime.
pub(crate) async fn safe_exec(context: &str, job: &Job) {
    let started = std::time::Instant::now();
    match job().await {
        Ok(()) => {
            tracing::trace!(context, elapsed = ?started.elapsed(), "scheduled task finished");
        }
        Err(error) => {
            tracing::error!(
                context,
                error = %error,
                elapsed = ?started.elapsed(),
                "scheduled task failed"
            );
        }
    }
}

async fn run_cron_entry(
    context: Arc<str>,
    schedule: Schedule,
    job: Job,
    token: CancellationToken,
) {
    loop {
        let Some(next_fire) = schedule.upcoming(Local).next() else {
            tracing::debug!(context = %context, "cron schedule has no upcoming fire, stopping entry");
            return;
        };
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(until(next_fire)) => safe_exec(&context, &job).await,
        }
    }
}

async fn run_interval_entry(
    context: Arc<str>,
    period: Duration,
    job: Job,
    token: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => safe_exec(&context, &job).await,
        }
    }
}

/// Decision taken on a reset tick. Factored out so the policy is testable
/// without wall-clock cron fires.
#[derive(Debug, PartialEq, Eq)]
enum SlideAction {
    Arm,
    SkipPast,
    Nothing,
}

fn slide_action(now: DateTime<Local>, target: Option<DateTime<Local>>) -> SlideAction {
    match target {
        Some(t) if t > now => SlideAction::Arm,
        Some(_) => SlideAction::SkipPast,
        None => SlideAction::Nothing,
    }
}

async fn run_sliding_entry(
    context: Arc<str>,
    reset: Schedule,
    next: Arc<dyn Fn() -> Option<DateTime<Local>> + Send + Sync>,
    job: Job,
    token: CancellationToken,
) {
    let mut target: Option<DateTime<Local>> = None;
    loop {
        let Some(reset_at) = reset.upcoming(Local).next() else {
            tracing::debug!(context = %context, "sliding reset schedule exhausted, stopping entry");
            return;
        };
        let armed = target;
        let one_shot = async move {
            match armed {
                Some(t) => tokio::time::sleep(until(t)).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(until(reset_at)) => {
                if target.take().is_some() {
                    tracing::warn!(context = %context, "reset tick arrived with a one-shot still pending, dropping it");
                }
                let computed = next();
                match slide_action(Local::now(), computed) {
                    SlideAction::Arm => target = computed,
                    SlideAction::SkipPast => {
                        tracing::debug!(context = %context, "computed execution time is in the past, skipping");
                    }
                    SlideAction::Nothing => {}
                }
            }
            () = one_shot => {
                target = None;
                safe_exec(&context, &job).await;
            }
        }
    }
}
