//! # Topics
//!
//! Named event channels and their payload shapes. Payload field names are
//! camelCase on the wire.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// A pub/sub topic with a statically known payload type.
pub trait Topic {
    /// Wire name of the topic.
    const NAME: &'static str;
    /// Payload carried by events on this topic.
    type Payload: Serialize + DeserializeOwned + Send + 'static;
}

/// Cached data for the carried query key is stale.
pub struct InvalidateQuery;

impl Topic for InvalidateQuery {
    const NAME: &'static str = "invalidate-query";
    type Payload = String;
}

/// A long-running task was requested.
pub struct TaskStart;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartPayload {
    pub task_id: String,
}

impl Topic for TaskStart {
    const NAME: &'static str = "task-start";
    type Payload = TaskStartPayload;
}

/// Progress reported by a running task.
pub struct TaskProgress;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressPayload {
    pub task_id: String,
    pub message: Value,
}

impl Topic for TaskProgress {
    const NAME: &'static str = "task-progress";
    type Payload = TaskProgressPayload;
}

/// A host-owned reference changed.
pub struct RefChanged;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefChangedPayload {
    pub ref_key: String,
    pub value: Value,
    pub version: u64,
}

impl Topic for RefChanged {
    const NAME: &'static str = "ref-changed";
    type Payload = RefChangedPayload;
}

/// Bounded label for per-topic metrics: the built-in topic name, or
/// `"other"` for anything else.
pub fn topic_label(topic: &str) -> &'static str {
    [
        InvalidateQuery::NAME,
        TaskStart::NAME,
        TaskProgress::NAME,
        RefChanged::NAME,
    ]
    .into_iter()
    .find(|known| *known == topic)
    .unwrap_or("other")
}
