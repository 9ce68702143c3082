use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use crate::application::repos::{RepoError, ScheduleState, ScheduleStore};

#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    states: DashMap<String, ScheduleState>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load_state(&self, schedule_id: &str) -> Result<ScheduleState, RepoError> {
        Ok(self
            .states
            .get(schedule_id)
            .map(|state| state.value().clone())
            .unwrap_or_default())
    }

    async fn record_fired(
        &self,
        schedule_id: &str,
        fired_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        self.states
            .entry(schedule_id.to_string())
            .or_default()
            .last_fired_at = Some(fired_at);
        Ok(())
    }

    async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<(), RepoError> {
        self.states
            .entry(schedule_id.to_string())
            .or_default()
            .enabled = Some(enabled);
        Ok(())
    }
}
