use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use common_locks::{LockError, LockStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;
use worker_core::{Publisher, TaskHandler, WorkerError};

use crate::config::GrouperConfig;
use crate::data_filter::DataFilter;
use crate::diff::diff;
use crate::hashing::group_hash;
use crate::metric_consts::{
    GROUPS_CREATED, INSERT_RACES_LOST, NOTIFICATIONS_PUBLISHED, REPETITIONS_SAVED, USERS_AFFECTED,
};
use crate::store::{EventStore, GroupedEvent, Repetition, StoreError};
use crate::types::{worker_names, GroupTask, NotifierTask};
use crate::unsafe_fields::{decode_unsafe_fields, encode_unsafe_delta, encode_unsafe_fields};

/// Store-native identifiers are 24 hex characters.
static PROJECT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("project id regex is valid"));

/// How many of a project's groups the similar-title fallback scans.
const SIMILAR_EVENTS_TO_COMPARE: usize = 60;

/// Maximum Levenshtein distance for a similar-title match, as a fraction of
/// the incoming title's length.
const SIMILAR_TITLE_THRESHOLD: f64 = 0.35;

/// The deduplication/grouping engine: folds a stream of raw occurrences into
/// grouped events, repetitions and daily buckets, then hands off to the
/// notifier.
pub struct Grouper {
    store: Arc<dyn EventStore>,
    locks: Arc<dyn LockStore>,
    publisher: Publisher,
    filter: DataFilter,
    event_secret: String,
    lock_ttl: Duration,
    notifier_enabled: bool,
}

impl Grouper {
    pub fn new(
        store: Arc<dyn EventStore>,
        locks: Arc<dyn LockStore>,
        publisher: Publisher,
        config: &GrouperConfig,
    ) -> Self {
        Self {
            store,
            locks,
            publisher,
            filter: DataFilter::new(),
            event_secret: config.event_secret.clone(),
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
            notifier_enabled: config.notifier_enabled,
        }
    }

    /// Fallback when the hash lookup misses: scan the project's groups for
    /// one whose title is within the edit-distance threshold, so retitled
    /// variants of a known error fold into its group instead of spawning a
    /// new one. Returns the last match, if any.
    async fn find_similar_event(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Option<GroupedEvent>, WorkerError> {
        let candidates = self
            .store
            .recent_events(project_id, SIMILAR_EVENTS_TO_COMPARE)
            .await
            .map_err(store_failure)?;
        let threshold = title.len() as f64 * SIMILAR_TITLE_THRESHOLD;

        Ok(candidates
            .into_iter()
            .filter(|candidate| {
                let candidate_title = candidate.payload["title"].as_str().unwrap_or_default();
                (strsim::levenshtein(title, candidate_title) as f64) < threshold
            })
            .last())
    }

    /// Add the occurrence's user to the group's visited set, exactly once
    /// across concurrent deliveries. The lock closes the window between the
    /// membership check and the insert; the re-check under the lock is what
    /// actually prevents double counting, the TTL only covers crashed
    /// holders.
    async fn mark_user_visited(
        &self,
        project_id: &str,
        group_hash: &str,
        user_id: &str,
        known_users: &HashSet<String>,
    ) -> Result<(), WorkerError> {
        if known_users.contains(user_id) {
            return Ok(());
        }

        let key = format!("{group_hash}:{user_id}");
        if !self
            .locks
            .try_lock(&key, self.lock_ttl)
            .await
            .map_err(lock_failure)?
        {
            debug!(key, "visited-user lock held, concurrent handler owns this update");
            return Ok(());
        }

        // The set may have changed between the event lookup and lock
        // acquisition; re-read it before inserting.
        let result = async {
            let current = self
                .store
                .visited_users(project_id, group_hash)
                .await
                .map_err(store_failure)?;
            if !current.contains(user_id) {
                self.store
                    .add_visited_user(project_id, group_hash, user_id)
                    .await
                    .map_err(store_failure)?;
                metrics::counter!(USERS_AFFECTED).increment(1);
            }
            Ok(())
        }
        .await;

        if let Err(unlock_error) = self.locks.unlock(&key).await {
            warn!(%unlock_error, key, "failed to release visited-user lock, TTL will reclaim it");
        }
        result
    }
}

#[async_trait]
impl TaskHandler for Grouper {
    type Task = GroupTask;

    async fn handle(&self, task: GroupTask) -> Result<(), WorkerError> {
        if !PROJECT_ID.is_match(&task.project_id) {
            return Err(WorkerError::non_critical("project id is invalid or missing")
                .with_context(json!({ "projectId": task.project_id })));
        }
        // Validated before anything is written: a bad timestamp must not
        // leave a counted occurrence without its daily bucket.
        let date = DateTime::from_timestamp(task.event.timestamp, 0)
            .ok_or_else(|| {
                WorkerError::non_critical("event timestamp is out of range")
                    .with_context(json!({ "timestamp": task.event.timestamp }))
            })?
            .date_naive();

        let mut hash = group_hash(&self.event_secret, &task.catcher_type, &task.event.title);
        let mut payload = serde_json::to_value(&task.event)
            .map_err(|e| WorkerError::non_critical(format!("unserializable event payload: {e}")))?;
        self.filter.scrub_event(&mut payload);
        let user_id = task.event.user.as_ref().map(|u| u.id.clone());

        let (is_new, stored_payload) = loop {
            let found = match self
                .store
                .find_event(&task.project_id, &hash)
                .await
                .map_err(store_failure)?
            {
                Some(event) => Some(event),
                None => {
                    self.find_similar_event(&task.project_id, &task.event.title)
                        .await?
                }
            };
            match found {
                None => {
                    let mut encoded = payload.clone();
                    encode_unsafe_fields(&mut encoded);
                    let event = GroupedEvent {
                        id: Uuid::now_v7(),
                        group_hash: hash.clone(),
                        catcher_type: task.catcher_type.clone(),
                        total_count: 1,
                        payload: encoded,
                        visited_users: user_id.iter().cloned().collect(),
                    };
                    if self
                        .store
                        .insert_event(&task.project_id, event)
                        .await
                        .map_err(store_failure)?
                    {
                        metrics::counter!(GROUPS_CREATED).increment(1);
                        break (true, payload.clone());
                    }
                    // Another delivery created the group between our lookup
                    // and insert; take the repeat path instead.
                    debug!(group_hash = %hash, "lost first-occurrence insert race");
                    metrics::counter!(INSERT_RACES_LOST).increment(1);
                }
                Some(existing) => {
                    // A similar-title match adopts the existing group's hash.
                    hash.clone_from(&existing.group_hash);
                    self.store
                        .increment_total_count(&task.project_id, &hash)
                        .await
                        .map_err(store_failure)?;

                    let mut original = existing.payload.clone();
                    decode_unsafe_fields(&mut original);
                    let mut delta = diff(&original, &payload);
                    encode_unsafe_delta(&mut delta);
                    let repetition = Repetition {
                        id: Uuid::now_v7(),
                        group_hash: hash.clone(),
                        delta,
                        timestamp: task.event.timestamp,
                    };
                    self.store
                        .insert_repetition(&task.project_id, repetition)
                        .await
                        .map_err(store_failure)?;
                    metrics::counter!(REPETITIONS_SAVED).increment(1);

                    if let Some(user_id) = &user_id {
                        self.mark_user_visited(
                            &task.project_id,
                            &hash,
                            user_id,
                            &existing.visited_users,
                        )
                        .await?;
                    }
                    break (false, original);
                }
            }
        };

        self.store
            .upsert_daily_bucket(&task.project_id, &hash, date, task.event.timestamp)
            .await
            .map_err(store_failure)?;

        if self.notifier_enabled {
            let notification = NotifierTask {
                project_id: task.project_id.clone(),
                is_new,
                catcher_type: task.catcher_type.clone(),
                payload: stored_payload,
            };
            self.publisher
                .add_task(worker_names::NOTIFIER, &notification)
                .await
                .map_err(|e| {
                    WorkerError::critical(format!("failed to hand off to notifier: {e}"))
                })?;
            metrics::counter!(NOTIFICATIONS_PUBLISHED).increment(1);
        }

        Ok(())
    }
}

fn store_failure(error: StoreError) -> WorkerError {
    WorkerError::critical(format!("event store failure: {error}"))
}

fn lock_failure(error: LockError) -> WorkerError {
    WorkerError::critical(format!("lock store failure: {error}"))
}
