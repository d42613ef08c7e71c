use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::store::{DailyBucket, EventStore, GroupedEvent, Repetition, StoreError};

#[derive(Default)]
struct ProjectData {
    /// `events:<projectId>`, keyed by group hash.
    events: HashMap<String, GroupedEvent>,
    /// Group hashes in creation order, for `recent_events`.
    event_order: Vec<String>,
    /// `repetitions:<projectId>`, append-only.
    repetitions: Vec<Repetition>,
    /// `dailyEvents:<projectId>`, keyed by (group hash, date).
    daily: HashMap<(String, NaiveDate), DailyBucket>,
}

#[derive(Default)]
struct State {
    projects: HashMap<String, ProjectData>,
    unavailable: bool,
}

/// In-process event store for tests and local runs. `set_unavailable` makes
/// every operation fail, to exercise critical-failure classification.
#[derive(Default)]
pub struct MemoryEventStore {
    state: Mutex<State>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Stored grouped event, if any.
    pub fn event(&self, project_id: &str, group_hash: &str) -> Option<GroupedEvent> {
        self.lock()
            .projects
            .get(project_id)
            .and_then(|p| p.events.get(group_hash))
            .cloned()
    }

    /// Stored repetitions for a group hash, in insertion order.
    pub fn repetitions(&self, project_id: &str, group_hash: &str) -> Vec<Repetition> {
        self.lock().projects.get(project_id).map_or(Vec::new(), |p| {
            p.repetitions
                .iter()
                .filter(|r| r.group_hash == group_hash)
                .cloned()
                .collect()
        })
    }

    /// Stored daily buckets for a group hash, in date order.
    pub fn daily_buckets(&self, project_id: &str, group_hash: &str) -> Vec<DailyBucket> {
        let mut buckets = self.lock().projects.get(project_id).map_or(Vec::new(), |p| {
            p.daily
                .values()
                .filter(|b| b.group_hash == group_hash)
                .cloned()
                .collect()
        });
        buckets.sort_by_key(|b| b.date);
        buckets
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn checked(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_event(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<Option<GroupedEvent>, StoreError> {
        let state = self.checked()?;
        Ok(state
            .projects
            .get(project_id)
            .and_then(|p| p.events.get(group_hash))
            .cloned())
    }

    async fn insert_event(
        &self,
        project_id: &str,
        event: GroupedEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.checked()?;
        let project = state.projects.entry(project_id.to_string()).or_default();
        if project.events.contains_key(&event.group_hash) {
            return Ok(false);
        }
        project.event_order.push(event.group_hash.clone());
        project.events.insert(event.group_hash.clone(), event);
        Ok(true)
    }

    async fn recent_events(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<GroupedEvent>, StoreError> {
        let state = self.checked()?;
        Ok(state.projects.get(project_id).map_or(Vec::new(), |p| {
            p.event_order
                .iter()
                .take(limit)
                .filter_map(|hash| p.events.get(hash))
                .cloned()
                .collect()
        }))
    }

    async fn increment_total_count(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.checked()?;
        if let Some(event) = state
            .projects
            .get_mut(project_id)
            .and_then(|p| p.events.get_mut(group_hash))
        {
            event.total_count += 1;
        }
        Ok(())
    }

    async fn visited_users(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.checked()?;
        Ok(state
            .projects
            .get(project_id)
            .and_then(|p| p.events.get(group_hash))
            .map(|e| e.visited_users.clone())
            .unwrap_or_default())
    }

    async fn add_visited_user(
        &self,
        project_id: &str,
        group_hash: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.checked()?;
        if let Some(event) = state
            .projects
            .get_mut(project_id)
            .and_then(|p| p.events.get_mut(group_hash))
        {
            event.visited_users.insert(user_id.to_string());
        }
        Ok(())
    }

    async fn insert_repetition(
        &self,
        project_id: &str,
        repetition: Repetition,
    ) -> Result<(), StoreError> {
        let mut state = self.checked()?;
        state
            .projects
            .entry(project_id.to_string())
            .or_default()
            .repetitions
            .push(repetition);
        Ok(())
    }

    async fn upsert_daily_bucket(
        &self,
        project_id: &str,
        group_hash: &str,
        date: NaiveDate,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.checked()?;
        let project = state.projects.entry(project_id.to_string()).or_default();
        project
            .daily
            .entry((group_hash.to_string(), date))
            .and_modify(|bucket| {
                bucket.count += 1;
                bucket.last_timestamp = timestamp;
            })
            .or_insert_with(|| DailyBucket {
                group_hash: group_hash.to_string(),
                date,
                count: 1,
                last_timestamp: timestamp,
            });
        Ok(())
    }
}
