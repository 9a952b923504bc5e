//! Application state container: live entities, ordered lists, archives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{Result, SyncError};
use crate::sync::op::EntityKind;
use crate::sync::vector_clock::VectorClock;

use super::model::*;

/// Archived tasks, split by age for cheaper incremental writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArchive {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

/// Full per-user application state. Entities are owned by their maps;
/// all cross-entity relations are id references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
    #[serde(default)]
    pub notes: BTreeMap<String, Note>,
    #[serde(default)]
    pub simple_counters: BTreeMap<String, SimpleCounter>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub repeat_cfgs: BTreeMap<String, RepeatCfg>,
    #[serde(default)]
    pub issue_providers: BTreeMap<String, IssueProvider>,
    #[serde(default)]
    pub reminders: BTreeMap<String, Reminder>,
    /// Ordered id list backing the Today view.
    #[serde(default)]
    pub today_task_ids: Vec<String>,
    #[serde(default)]
    pub archive_young: TaskArchive,
    #[serde(default)]
    pub archive_old: TaskArchive,
}

fn remove_id(list: &mut Vec<String>, id: &str) {
    list.retain(|entry| entry != id);
}

impl AppState {
    /// LWW metadata of a live entity, if present.
    pub fn entity_meta(&self, kind: EntityKind, id: &str) -> Option<&LwwMeta> {
        match kind {
            EntityKind::Task => self.tasks.get(id).map(|e| &e.meta),
            EntityKind::Project => self.projects.get(id).map(|e| &e.meta),
            EntityKind::Tag => self.tags.get(id).map(|e| &e.meta),
            EntityKind::Note => self.notes.get(id).map(|e| &e.meta),
            EntityKind::SimpleCounter => self.simple_counters.get(id).map(|e| &e.meta),
            EntityKind::Metric => self.metrics.get(id).map(|e| &e.meta),
            EntityKind::RepeatCfg => self.repeat_cfgs.get(id).map(|e| &e.meta),
            EntityKind::IssueProvider => self.issue_providers.get(id).map(|e| &e.meta),
            EntityKind::Reminder => self.reminders.get(id).map(|e| &e.meta),
            EntityKind::All => None,
        }
    }

    pub fn entity_exists(&self, kind: EntityKind, id: &str) -> bool {
        self.entity_meta(kind, id).is_some()
    }

    /// Replace (or create) an entity from an op payload. Whole-entity
    /// semantics: the payload is the post-change state of the entity.
    pub fn upsert_entity(
        &mut self,
        kind: EntityKind,
        id: &str,
        payload: &serde_json::Value,
        clock: &VectorClock,
        timestamp: i64,
        writer: &str,
    ) -> Result<()> {
        let meta = LwwMeta {
            vector_clock: clock.clone(),
            last_update: timestamp,
            last_writer: Some(writer.to_string()),
        };

        macro_rules! upsert {
            ($map:expr, $ty:ty) => {{
                let mut entity: $ty = serde_json::from_value(payload.clone())?;
                if entity.id.is_empty() {
                    entity.id = id.to_string();
                }
                entity.meta = meta;
                $map.insert(id.to_string(), entity);
            }};
        }

        match kind {
            EntityKind::Task => upsert!(self.tasks, Task),
            EntityKind::Project => upsert!(self.projects, Project),
            EntityKind::Tag => upsert!(self.tags, Tag),
            EntityKind::Note => upsert!(self.notes, Note),
            EntityKind::SimpleCounter => upsert!(self.simple_counters, SimpleCounter),
            EntityKind::Metric => upsert!(self.metrics, Metric),
            EntityKind::RepeatCfg => upsert!(self.repeat_cfgs, RepeatCfg),
            EntityKind::IssueProvider => upsert!(self.issue_providers, IssueProvider),
            EntityKind::Reminder => upsert!(self.reminders, Reminder),
            EntityKind::All => {
                return Err(SyncError::storage(
                    "full-state payloads are not entity upserts",
                ))
            }
        }
        Ok(())
    }

    /// Absorb a clock into an entity's metadata without touching its
    /// fields. Losing concurrent ops still contribute their components so
    /// every replica converges on identical metadata.
    pub fn merge_entity_clock(&mut self, kind: EntityKind, id: &str, clock: &VectorClock) {
        macro_rules! absorb {
            ($map:expr) => {
                if let Some(entity) = $map.get_mut(id) {
                    entity.meta.vector_clock.merge(clock);
                }
            };
        }
        match kind {
            EntityKind::Task => absorb!(self.tasks),
            EntityKind::Project => absorb!(self.projects),
            EntityKind::Tag => absorb!(self.tags),
            EntityKind::Note => absorb!(self.notes),
            EntityKind::SimpleCounter => absorb!(self.simple_counters),
            EntityKind::Metric => absorb!(self.metrics),
            EntityKind::RepeatCfg => absorb!(self.repeat_cfgs),
            EntityKind::IssueProvider => absorb!(self.issue_providers),
            EntityKind::Reminder => absorb!(self.reminders),
            EntityKind::All => {}
        }
    }

    /// Remove an entity and its entry in every ordered list. Reference
    /// scrubbing across other entities is the cascades' job.
    pub fn remove_entity(&mut self, kind: EntityKind, id: &str) -> bool {
        let removed = match kind {
            EntityKind::Task => {
                let removed = self.tasks.remove(id).is_some();
                remove_id(&mut self.today_task_ids, id);
                for project in self.projects.values_mut() {
                    remove_id(&mut project.task_ids, id);
                    remove_id(&mut project.backlog_task_ids, id);
                }
                for tag in self.tags.values_mut() {
                    remove_id(&mut tag.task_ids, id);
                }
                removed
            }
            EntityKind::Project => self.projects.remove(id).is_some(),
            EntityKind::Tag => self.tags.remove(id).is_some(),
            EntityKind::Note => self.notes.remove(id).is_some(),
            EntityKind::SimpleCounter => self.simple_counters.remove(id).is_some(),
            EntityKind::Metric => self.metrics.remove(id).is_some(),
            EntityKind::RepeatCfg => self.repeat_cfgs.remove(id).is_some(),
            EntityKind::IssueProvider => self.issue_providers.remove(id).is_some(),
            EntityKind::Reminder => self.reminders.remove(id).is_some(),
            EntityKind::All => false,
        };
        removed
    }

    /// Drop a tag id from every live and archived task. Returns ids of the
    /// tasks that actually referenced it.
    pub fn scrub_tag_references(&mut self, tag_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            if task.tag_ids.iter().any(|t| t == tag_id) {
                remove_id(&mut task.tag_ids, tag_id);
                affected.push(id.clone());
            }
        }
        for archive in [&mut self.archive_young, &mut self.archive_old] {
            for (id, task) in archive.tasks.iter_mut() {
                if task.tag_ids.iter().any(|t| t == tag_id) {
                    remove_id(&mut task.tag_ids, tag_id);
                    affected.push(id.clone());
                }
            }
        }
        affected
    }

    /// Drop a project reference from every live and archived task and from
    /// repeat configs. Returns ids of the tasks that referenced it.
    pub fn scrub_project_references(&mut self, project_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            if task.project_id.as_deref() == Some(project_id) {
                task.project_id = None;
                affected.push(id.clone());
            }
        }
        for archive in [&mut self.archive_young, &mut self.archive_old] {
            for (id, task) in archive.tasks.iter_mut() {
                if task.project_id.as_deref() == Some(project_id) {
                    task.project_id = None;
                    affected.push(id.clone());
                }
            }
        }
        for cfg in self.repeat_cfgs.values_mut() {
            if cfg.project_id.as_deref() == Some(project_id) {
                cfg.project_id = None;
            }
        }
        for note in self.notes.values_mut() {
            if note.project_id.as_deref() == Some(project_id) {
                note.project_id = None;
            }
        }
        affected
    }

    /// Re-home a task: optionally into another project and/or a new Today
    /// position. List surgery only; field LWW is handled by the caller.
    pub fn move_task(
        &mut self,
        task_id: &str,
        target_project_id: Option<&str>,
        today_index: Option<usize>,
    ) {
        if let Some(target) = target_project_id {
            for project in self.projects.values_mut() {
                remove_id(&mut project.task_ids, task_id);
                remove_id(&mut project.backlog_task_ids, task_id);
            }
            if let Some(project) = self.projects.get_mut(target) {
                if !project.task_ids.iter().any(|t| t == task_id) {
                    project.task_ids.push(task_id.to_string());
                }
            }
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.project_id = Some(target.to_string());
            }
        }
        if let Some(index) = today_index {
            remove_id(&mut self.today_task_ids, task_id);
            let index = index.min(self.today_task_ids.len());
            self.today_task_ids.insert(index, task_id.to_string());
        }
    }

    /// Count of live entities across all kinds.
    pub fn entity_count(&self) -> usize {
        self.tasks.len()
            + self.projects.len()
            + self.tags.len()
            + self.notes.len()
            + self.simple_counters.len()
            + self.metrics.len()
            + self.repeat_cfgs.len()
            + self.issue_providers.len()
            + self.reminders.len()
    }
}
