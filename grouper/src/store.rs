use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::diff::Delta;

/// The canonical, deduplicated record for one logical recurring error.
/// One per (project, group hash); `total_count` and `visited_users` only
/// ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedEvent {
    pub id: Uuid,
    pub group_hash: String,
    pub catcher_type: String,
    pub total_count: u64,
    pub payload: Value,
    pub visited_users: HashSet<String>,
}

/// A compact record of one additional occurrence: the structural delta
/// against the grouped event's original payload. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repetition {
    pub id: Uuid,
    pub group_hash: String,
    pub delta: Delta,
    pub timestamp: i64,
}

/// Per-day occurrence counter for a group hash, upserted with
/// create-or-increment semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBucket {
    pub group_hash: String,
    pub date: NaiveDate,
    pub count: u64,
    pub last_timestamp: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Collection-oriented persistence for grouped events, namespaced per
/// project (`events:<projectId>`, `repetitions:<projectId>`,
/// `dailyEvents:<projectId>`).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_event(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<Option<GroupedEvent>, StoreError>;

    /// Insert-if-absent on (project, group hash). Returns false when another
    /// writer inserted the group first; the caller must re-run its lookup.
    async fn insert_event(&self, project_id: &str, event: GroupedEvent)
        -> Result<bool, StoreError>;

    /// Up to `limit` of the project's grouped events in creation order,
    /// scanned by the similar-title fallback.
    async fn recent_events(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<GroupedEvent>, StoreError>;

    /// Atomically add 1 to the group's total count.
    async fn increment_total_count(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<(), StoreError>;

    /// Current visited-user set, re-read under the lock to prevent double
    /// counting.
    async fn visited_users(
        &self,
        project_id: &str,
        group_hash: &str,
    ) -> Result<HashSet<String>, StoreError>;

    async fn add_visited_user(
        &self,
        project_id: &str,
        group_hash: &str,
        user_id: &str,
    ) -> Result<(), StoreError>;

    async fn insert_repetition(
        &self,
        project_id: &str,
        repetition: Repetition,
    ) -> Result<(), StoreError>;

    /// Create the (group hash, date) bucket with count 1, or increment it
    /// and refresh the last-seen timestamp.
    async fn upsert_daily_bucket(
        &self,
        project_id: &str,
        group_hash: &str,
        date: NaiveDate,
        timestamp: i64,
    ) -> Result<(), StoreError>;
}
