//! Entity structs carried only to the depth the merge algorithms require.

use serde::{Deserialize, Serialize};

use crate::sync::vector_clock::VectorClock;

/// LWW metadata stored alongside the application fields of every entity
/// that participates in merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwMeta {
    #[serde(default)]
    pub vector_clock: VectorClock,
    /// Wall-clock of the last accepted write (epoch ms).
    #[serde(default)]
    pub last_update: i64,
    /// Client that produced the last accepted write; concurrent-edit
    /// tiebreaker of last resort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_writer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sub_task_ids: Vec<String>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub done_on: Option<i64>,
    #[serde(default)]
    pub time_spent_ms: i64,
    #[serde(default)]
    pub time_estimate_ms: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub backlog_task_ids: Vec<String>,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleCounter {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Day string (`YYYY-MM-DD`) to count.
    #[serde(default)]
    pub count_on_day: std::collections::BTreeMap<String, u32>,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Day string (`YYYY-MM-DD`); doubles as the entity id.
    pub id: String,
    #[serde(default)]
    pub mood: Option<u8>,
    #[serde(default)]
    pub productivity: Option<u8>,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCfg {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    /// Repeat period in days.
    #[serde(default)]
    pub repeat_every: u32,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueProvider {
    pub id: String,
    /// Provider discriminator, e.g. `"GITHUB"` or `"JIRA"`.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(flatten)]
    pub meta: LwwMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    /// Task or note this reminder points at.
    #[serde(default)]
    pub related_id: String,
    #[serde(default)]
    pub due_at: i64,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub meta: LwwMeta,
}
