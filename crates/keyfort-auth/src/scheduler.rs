//! Recurring maintenance task runner.
//!
//! Tasks are registered as data — a [`TaskSpec`] naming the interval,
//! initial wait, and fan-out scope — plus a [`MaintenanceTask`]
//! implementation. Each registered task gets its own timer loop; within one
//! loop an invocation runs to completion before the next tick is honored,
//! and ticks that fire mid-run are dropped, never queued, so slow storage
//! cannot build a backlog.
//!
//! Fan-out re-reads the live registry at tick time, so tenants provisioned
//! after registration are covered without restarting anything. A failure on
//! one target is recorded in the tick's [`TickReport`] and the remaining
//! targets still run.
//!
//! Test harnesses inject [`TaskTiming`] overrides through
//! [`Scheduler::set_timing_override`] before registering, making
//! time-dependent behavior deterministic without wall-clock waits.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use keyfort_core::{AppKey, TenantKey};
use keyfort_storage::SessionStore;

use crate::error::{AuthError, AuthResult};
use crate::registry::TenantRegistry;

/// Interval and initial wait of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    /// Time between tick starts.
    pub interval: Duration,

    /// Delay before the first tick after registration.
    pub initial_wait: Duration,
}

/// Fan-out scope of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    /// Run once per tick for the whole process.
    Global,
    /// Run once per app with at least one registered tenant.
    PerApp,
    /// Run once per distinct storage instance; tenants sharing a backend
    /// are de-duplicated.
    PerStorage,
}

/// Declaration of a recurring task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Unique task name; the key for overrides and force-runs.
    pub name: &'static str,

    /// Default timing (overridable per name).
    pub timing: TaskTiming,

    /// Fan-out scope.
    pub scope: TaskScope,
}

/// One fan-out target of a tick.
pub enum TaskTarget {
    /// The process-global target.
    Global,
    /// One app.
    App(AppKey),
    /// One distinct storage instance, labeled by one of its tenants.
    Storage {
        /// A tenant served by this storage instance.
        tenant: TenantKey,
        /// The storage handle.
        storage: Arc<dyn SessionStore>,
    },
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::App(app) => write!(f, "app:{app}"),
            Self::Storage { tenant, .. } => write!(f, "storage:{tenant}"),
        }
    }
}

/// A maintenance task body, invoked once per target per tick.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    /// Runs the task against one target.
    async fn run(&self, target: &TaskTarget) -> AuthResult<()>;
}

/// Failure of one target within a tick.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Display form of the failed target.
    pub target: String,

    /// Display form of the error.
    pub error: String,
}

/// Outcome of one tick of one task.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// The task that ran.
    pub task: String,

    /// How many targets were attempted.
    pub targets: usize,

    /// The targets that failed, with their errors.
    pub failures: Vec<TaskFailure>,
}

impl TickReport {
    /// Returns `true` if every target completed.
    #[must_use]
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

struct RegisteredTask {
    spec: TaskSpec,
    task: Arc<dyn MaintenanceTask>,
    running: AtomicBool,
}

/// The recurring-task scheduler.
pub struct Scheduler {
    registry: Arc<TenantRegistry>,
    tasks: DashMap<&'static str, Arc<RegisteredTask>>,
    overrides: DashMap<&'static str, TaskTiming>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Creates a scheduler over the registry it will fan out across.
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            tasks: DashMap::new(),
            overrides: DashMap::new(),
            shutdown_tx,
        }
    }

    /// Installs a timing override for a task name.
    ///
    /// Must be installed before [`Scheduler::register`] is called for that
    /// name; the loop reads its timing once at startup.
    pub fn set_timing_override(&self, name: &'static str, timing: TaskTiming) {
        self.overrides.insert(name, timing);
    }

    fn effective_timing(&self, spec: &TaskSpec) -> TaskTiming {
        self.overrides
            .get(spec.name)
            .map(|t| *t)
            .unwrap_or(spec.timing)
    }

    /// Registers a task and starts its timer loop.
    pub fn register(self: &Arc<Self>, spec: TaskSpec, task: Arc<dyn MaintenanceTask>) {
        let timing = self.effective_timing(&spec);
        let registered = Arc::new(RegisteredTask {
            spec: spec.clone(),
            task,
            running: AtomicBool::new(false),
        });
        self.tasks.insert(spec.name, registered.clone());

        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!(
                task = spec.name,
                interval_secs = timing.interval.as_secs_f64(),
                initial_wait_secs = timing.initial_wait.as_secs_f64(),
                "maintenance task started"
            );

            tokio::select! {
                _ = tokio::time::sleep(timing.initial_wait) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }

            let mut ticker = tokio::time::interval(timing.interval);
            // An invocation still running when the next tick fires means
            // that tick is dropped, not queued.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_guarded(&registered).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(task = spec.name, "maintenance task shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn run_guarded(&self, registered: &RegisteredTask) -> Option<TickReport> {
        if registered
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(task = registered.spec.name, "tick skipped, task still running");
            return None;
        }
        let report = self.execute(registered).await;
        registered.running.store(false, Ordering::SeqCst);
        Some(report)
    }

    /// Runs a task immediately, outside its schedule, and returns the
    /// report.
    ///
    /// # Errors
    ///
    /// Fails if the task name is unknown or an invocation is already in
    /// flight (overlap is never allowed, forced or scheduled).
    pub async fn run_once(&self, name: &str) -> AuthResult<TickReport> {
        let registered = self
            .tasks
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| AuthError::internal(format!("unknown maintenance task: {name}")))?;

        self.run_guarded(&registered)
            .await
            .ok_or_else(|| AuthError::internal(format!("task {name} is already running")))
    }

    async fn execute(&self, registered: &RegisteredTask) -> TickReport {
        let targets: Vec<TaskTarget> = match registered.spec.scope {
            TaskScope::Global => vec![TaskTarget::Global],
            TaskScope::PerApp => self
                .registry
                .list_apps()
                .into_iter()
                .map(TaskTarget::App)
                .collect(),
            TaskScope::PerStorage => self
                .registry
                .distinct_storages(None)
                .into_iter()
                .map(|(tenant, storage)| TaskTarget::Storage { tenant, storage })
                .collect(),
        };

        let mut report = TickReport {
            task: registered.spec.name.to_string(),
            targets: targets.len(),
            failures: Vec::new(),
        };
        for target in &targets {
            if let Err(e) = registered.task.run(target).await {
                warn!(
                    task = registered.spec.name,
                    target = %target,
                    error = %e,
                    "maintenance task failed for target"
                );
                report.failures.push(TaskFailure {
                    target: target.to_string(),
                    error: e.to_string(),
                });
            }
        }
        report
    }

    /// Names of the registered tasks.
    #[must_use]
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|e| *e.key()).collect()
    }

    /// Stops every task loop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
