use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Worker type strings, doubling as default queue names.
pub mod worker_names {
    pub const GROUPER: &str = "grouper";
    pub const NOTIFIER: &str = "notifier";
}

/// Incoming occurrence task, as published by collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTask {
    pub project_id: String,
    pub catcher_type: String,
    pub event: EventPayload,
}

/// One raw error occurrence. Only `title` participates in grouping; the rest
/// rides along into the stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub title: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EventUser>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUser {
    pub id: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Follow-up task handed to the notifier worker after bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierTask {
    pub project_id: String,
    #[serde(rename = "new")]
    pub is_new: bool,
    pub catcher_type: String,
    pub payload: Value,
}
