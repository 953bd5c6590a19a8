//! The polling scheduler loop.
//!
//! One cooperative loop per process: every tick walks the registered
//! tasks in order, decides for each whether a cron fire or a pending
//! retry is due, runs the callback, records the outcome, and persists all
//! of the tick's updates in a single state transaction. Callbacks never
//! run concurrently and a failed callback never unwinds the loop.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vd_domain::Clock;
use vd_gitstore::StoreError;

use crate::cron::CronExpression;
use crate::state::{RuntimeState, StateStorage};
use crate::task::{Registration, RegistrationMap, TaskRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options & errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How often the loop re-evaluates the task set.
    pub poll_interval: std::time::Duration,
    /// Zone the cron expressions are evaluated in.
    pub timezone: Tz,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(30),
            timezone: chrono_tz::UTC,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Due selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DueKind {
    Cron,
    Retry,
}

/// Decide whether a task is due and for which anchor time.
///
/// The cron side is the most recent fire at or before `now` that the loop
/// has not handled yet; missed boundaries in between are intentionally
/// discarded, so a long gap produces exactly one execution. A pending
/// retry competes once its time has come; the earlier anchor wins and a
/// tie goes to the retry.
fn choose_due(
    cron: &CronExpression,
    tz: Tz,
    last_evaluated_fire: DateTime<Utc>,
    pending_retry_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DueKind)> {
    let cron_due = cron
        .prev_at_or_before_tz(&now, tz)
        .filter(|fire| *fire > last_evaluated_fire);
    let retry_due = pending_retry_until.filter(|until| *until <= now);

    match (cron_due, retry_due) {
        (None, None) => None,
        (Some(fire), None) => Some((fire, DueKind::Cron)),
        (None, Some(until)) => Some((until, DueKind::Retry)),
        (Some(fire), Some(until)) => {
            if until <= fire {
                Some((until, DueKind::Retry))
            } else {
                Some((fire, DueKind::Cron))
            }
        }
    }
}

fn floor_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum LoopState {
    Idle,
    Starting,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

/// The polling scheduler. One instance per process; `initialize` starts
/// the loop, `stop` winds it down and waits for the in-flight tick.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    storage: Arc<StateStorage>,
    state: Mutex<LoopState>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, storage: Arc<StateStorage>) -> Self {
        Self {
            clock,
            storage,
            state: Mutex::new(LoopState::Idle),
        }
    }

    /// Validate the registrations, reconcile them with the persisted
    /// state, and start the polling loop.
    pub async fn initialize(
        &self,
        registrations: Vec<Registration>,
        options: SchedulerOptions,
    ) -> Result<(), SchedulerError> {
        let mut map = RegistrationMap::new();
        for registration in &registrations {
            if map
                .insert(registration.name.clone(), registration.clone())
                .is_some()
            {
                return Err(SchedulerError::DuplicateTask(registration.name.clone()));
            }
        }

        {
            let mut state = self.state.lock();
            if !matches!(*state, LoopState::Idle) {
                return Err(SchedulerError::AlreadyRunning);
            }
            *state = LoopState::Starting;
        }

        match self.start_loop(registrations, map, options).await {
            Ok(running) => {
                let mut state = self.state.lock();
                if matches!(*state, LoopState::Starting) {
                    *state = running;
                } else if let LoopState::Running { cancel, .. } = &running {
                    // Stopped while still starting up; wind the loop down.
                    cancel.cancel();
                }
                Ok(())
            }
            Err(error) => {
                *self.state.lock() = LoopState::Idle;
                Err(error)
            }
        }
    }

    async fn start_loop(
        &self,
        registrations: Vec<Registration>,
        map: RegistrationMap,
        options: SchedulerOptions,
    ) -> Result<LoopState, SchedulerError> {
        let boot = self.clock.now();
        let (start_time, records) = reconcile(&self.storage, &registrations, &map).await?;

        // Never-run tasks anchor one minute back so a boundary exactly at
        // startup still fires.
        let default_anchor = floor_minute(boot) - Duration::minutes(1);
        let tasks: Vec<TaskRuntime> = registrations
            .into_iter()
            .zip(records)
            .map(|(registration, record)| {
                let last_evaluated_fire = record
                    .last_attempt_time
                    .map(floor_minute)
                    .unwrap_or(default_anchor);
                TaskRuntime {
                    registration,
                    record,
                    last_evaluated_fire,
                }
            })
            .collect();

        let cancel = CancellationToken::new();
        let scheduler_loop = SchedulerLoop {
            clock: self.clock.clone(),
            storage: self.storage.clone(),
            registrations: map,
            tasks,
            start_time,
            options,
            cancel: cancel.clone(),
        };
        tracing::info!(
            tasks = scheduler_loop.tasks.len(),
            poll_interval_ms = scheduler_loop.options.poll_interval.as_millis() as u64,
            "scheduler started"
        );
        let handle = tokio::spawn(scheduler_loop.run());
        Ok(LoopState::Running { cancel, handle })
    }

    /// Stop the loop and wait for the current tick (and any in-flight
    /// callback) to finish. The scheduler can be initialized again after.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, LoopState::Idle)
        };
        if let LoopState::Running { cancel, handle } = running {
            cancel.cancel();
            if let Err(error) = handle.await {
                tracing::warn!(%error, "scheduler loop ended abnormally");
            }
            tracing::info!("scheduler stopped");
        }
    }
}

/// Fuse the persisted records with the live registrations: adopt
/// timestamps for surviving tasks, create fresh records for new ones,
/// drop the rest, and persist the result.
async fn reconcile(
    storage: &StateStorage,
    registrations: &[Registration],
    map: &RegistrationMap,
) -> Result<(DateTime<Utc>, Vec<TaskRecord>), SchedulerError> {
    let order: Vec<Registration> = registrations.to_vec();
    let fused = storage
        .update(map, move |txn| {
            let current = txn.current_state();
            let mut by_name: std::collections::HashMap<String, TaskRecord> = current
                .tasks
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect();
            // Decoding already made the registration authoritative for the
            // schedule and retry delay; what survives here is timestamps.
            let tasks: Vec<TaskRecord> = order
                .iter()
                .map(|registration| {
                    by_name
                        .remove(&registration.name)
                        .unwrap_or_else(|| TaskRecord::for_registration(registration))
                })
                .collect();
            let state = RuntimeState {
                start_time: current.start_time,
                tasks: tasks.clone(),
            };
            txn.set_state(state.clone());
            (state.start_time, tasks)
        })
        .await?;
    Ok(fused)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TaskRuntime {
    registration: Registration,
    record: TaskRecord,
    /// Most recent cron boundary this loop has handled; fires at or
    /// before it are never executed again.
    last_evaluated_fire: DateTime<Utc>,
}

struct SchedulerLoop {
    clock: Arc<dyn Clock>,
    storage: Arc<StateStorage>,
    registrations: RegistrationMap,
    tasks: Vec<TaskRuntime>,
    start_time: DateTime<Utc>,
    options: SchedulerOptions,
    cancel: CancellationToken,
}

impl SchedulerLoop {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
            Box::pin(self.tick()).await;
        }
    }

    async fn tick(&mut self) {
        let tz = self.options.timezone;
        let mut dirty = false;

        for index in 0..self.tasks.len() {
            if self.cancel.is_cancelled() {
                break;
            }
            let task = &mut self.tasks[index];
            let now = self.clock.now();
            let Some((due_time, kind)) = choose_due(
                &task.registration.cron,
                tz,
                task.last_evaluated_fire,
                task.record.pending_retry_until,
                now,
            ) else {
                continue;
            };

            tracing::debug!(
                task_name = %task.registration.name,
                due = %due_time,
                kind = ?kind,
                "running task"
            );
            let result = task.registration.action.run().await;
            let finished = self.clock.now();
            match result {
                Ok(()) => {
                    task.record.last_success_time = Some(finished);
                    task.record.last_attempt_time = Some(finished);
                    task.record.pending_retry_until = None;
                }
                Err(failure) => {
                    let retry_at = finished + task.registration.retry_delay;
                    task.record.last_failure_time = Some(finished);
                    task.record.last_attempt_time = Some(finished);
                    task.record.pending_retry_until = Some(retry_at);
                    tracing::error!(
                        task_name = %task.registration.name,
                        error_message = %failure,
                        retry_delay = task.registration.retry_delay.num_milliseconds(),
                        retry_at = %retry_at,
                        "task failed; retry queued"
                    );
                }
            }
            task.last_evaluated_fire = task.last_evaluated_fire.max(due_time);
            dirty = true;
        }

        if dirty {
            let state = RuntimeState {
                start_time: self.start_time,
                tasks: self.tasks.iter().map(|t| t.record.clone()).collect(),
            };
            if let Err(error) = Box::pin(
                self.storage
                    .update(&self.registrations, move |txn| txn.set_state(state.clone())),
            )
            .await
            {
                // Survive to the next tick; the records stay in memory.
                tracing::error!(%error, "failed to persist runtime state");
            }
        }
    }
}
