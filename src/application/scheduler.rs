//! Recurring job emission from static schedule entries.

use std::{collections::HashMap, sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    application::{
        jobs::enqueue_job,
        repos::{JobQueue, RepoError, ScheduleStore},
    },
    domain::{
        entities::JobId,
        schedule::{ScheduleEntry, ScheduleRule},
    },
    infra::telemetry::METRIC_SCHEDULER_FIRED,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown schedule `{0}`")]
    UnknownSchedule(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// One firing produced by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredSchedule {
    pub schedule_id: String,
    pub job_id: JobId,
    pub fired_at: OffsetDateTime,
}

pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ScheduleStore>,
    started_at: OffsetDateTime,
    /// Firings whose `last_fired_at` has not reached the store yet.
    unpersisted: HashMap<String, OffsetDateTime>,
}

impl Scheduler {
    /// Build the scheduler from configured entries, restoring persisted
    /// `last_fired_at` and enable overrides.
    pub async fn load(
        mut entries: Vec<ScheduleEntry>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ScheduleStore>,
        started_at: OffsetDateTime,
    ) -> Result<Self, SchedulerError> {
        for entry in &mut entries {
            let state = store.load_state(&entry.schedule_id).await?;
            if state.last_fired_at.is_some() {
                entry.last_fired_at = state.last_fired_at;
            }
            if let Some(enabled) = state.enabled {
                entry.enabled = enabled;
            }
        }

        Ok(Self {
            entries,
            queue,
            store,
            started_at,
            unpersisted: HashMap::new(),
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn entry(&self, schedule_id: &str) -> Option<&ScheduleEntry> {
        self.entries
            .iter()
            .find(|entry| entry.schedule_id == schedule_id)
    }

    /// Next time the entry would fire if ticks ran continuously.
    pub fn next_fire_at(&self, entry: &ScheduleEntry) -> Option<OffsetDateTime> {
        match entry.last_fired_at {
            Some(last) => entry.rule.next_after(last),
            None => match entry.rule {
                ScheduleRule::Interval(_) => Some(self.started_at),
                ScheduleRule::Cron(_) => entry.rule.next_after(self.started_at),
            },
        }
    }

    pub async fn set_enabled(
        &mut self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<(), SchedulerError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.schedule_id == schedule_id)
            .ok_or_else(|| SchedulerError::UnknownSchedule(schedule_id.to_string()))?;

        self.store.set_enabled(schedule_id, enabled).await?;
        entry.enabled = enabled;

        info!(
            target = "application::scheduler",
            schedule_id, enabled, "schedule toggled"
        );
        Ok(())
    }

    /// Fire every enabled entry that is due at `now`. Each entry fires at most
    /// once per tick; missed occurrences are not replayed.
    pub async fn tick_at(&mut self, now: OffsetDateTime) -> Vec<FiredSchedule> {
        self.persist_pending().await;
        let mut fired = Vec::new();

        for entry in self.entries.iter_mut() {
            if !entry.enabled || !entry.rule.is_due(entry.last_fired_at, self.started_at, now) {
                continue;
            }

            let template = &entry.task_template;
            let job_id = match enqueue_job(
                self.queue.as_ref(),
                template.task_type,
                &template.payload,
                template.max_attempts,
            )
            .await
            {
                Ok(job_id) => job_id,
                Err(err) => {
                    warn!(
                        target = "application::scheduler",
                        schedule_id = entry.schedule_id,
                        error = %err,
                        "failed to enqueue scheduled job; will retry next tick"
                    );
                    continue;
                }
            };

            entry.last_fired_at = Some(now);
            match self.store.record_fired(&entry.schedule_id, now).await {
                Ok(()) => {
                    self.unpersisted.remove(&entry.schedule_id);
                }
                Err(err) => {
                    warn!(
                        target = "application::scheduler",
                        schedule_id = entry.schedule_id,
                        job_id = %job_id,
                        error = %err,
                        "failed to persist last_fired_at; will retry next tick"
                    );
                    self.unpersisted.insert(entry.schedule_id.clone(), now);
                }
            }

            counter!(METRIC_SCHEDULER_FIRED, "schedule_id" => entry.schedule_id.clone())
                .increment(1);
            info!(
                target = "application::scheduler",
                schedule_id = entry.schedule_id,
                job_id = %job_id,
                "schedule fired"
            );

            fired.push(FiredSchedule {
                schedule_id: entry.schedule_id.clone(),
                job_id,
                fired_at: now,
            });
        }

        fired
    }

    /// Number of firings still waiting to be written to the schedule store.
    pub fn unpersisted(&self) -> usize {
        self.unpersisted.len()
    }

    async fn persist_pending(&mut self) {
        for (schedule_id, fired_at) in std::mem::take(&mut self.unpersisted) {
            if let Err(err) = self.store.record_fired(&schedule_id, fired_at).await {
                warn!(
                    target = "application::scheduler",
                    schedule_id,
                    error = %err,
                    "still unable to persist last_fired_at"
                );
                self.unpersisted.insert(schedule_id, fired_at);
            }
        }
    }

    /// Tick on a fixed cadence until shutdown is signalled.
    pub async fn run(mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            target = "application::scheduler",
            entries = self.entries.len(),
            tick_ms = tick.as_millis() as u64,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let fired = self.tick_at(OffsetDateTime::now_utc()).await;
                    debug!(
                        target = "application::scheduler",
                        fired = fired.len(),
                        "scheduler tick"
                    );
                }
            }
        }

        self.persist_pending().await;
        info!(
            target = "application::scheduler",
            unpersisted = self.unpersisted.len(),
            "scheduler stopped"
        );
    }
}
