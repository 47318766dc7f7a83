//! Automation store — persists automations and their execution history.
//!
//! Layout, per the daemon's persistence contract:
//! - `automations/<id>.json` — one automation, atomic rewrite.
//! - `automations/index.json` — ordered list of ids, atomic rewrite.
//! - `automations/executions/<id>.jsonl` — append-only execution history.

use std::collections::HashMap;
use std::path::PathBuf;

use ad_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::model::{Automation, ExecutionRecord};
use crate::persistence::{append_jsonl, atomic_write_json, read_jsonl};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    ids: Vec<String>,
}

pub struct AutomationStore {
    root: PathBuf,
    automations: RwLock<HashMap<String, Automation>>,
}

impl AutomationStore {
    /// Load every persisted automation under `root/automations`.
    pub fn new(root: PathBuf) -> Result<Self> {
        let dir = root.join("automations");
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join("index.json");
        let index: Index = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        let mut automations = HashMap::with_capacity(index.ids.len());
        for id in &index.ids {
            let path = dir.join(format!("{id}.json"));
            match std::fs::read_to_string(&path) {
                Ok(data) => match serde_json::from_str::<Automation>(&data) {
                    Ok(automation) => {
                        automations.insert(id.clone(), automation);
                    }
                    Err(e) => tracing::warn!(id, error = %e, "skipping malformed automation file"),
                },
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable automation file"),
            }
        }

        Ok(Self { root, automations: RwLock::new(automations) })
    }

    fn automations_dir(&self) -> PathBuf {
        self.root.join("automations")
    }

    fn automation_path(&self, id: &str) -> PathBuf {
        self.automations_dir().join(format!("{id}.json"))
    }

    fn executions_path(&self, automation_id: &str) -> PathBuf {
        self.automations_dir().join("executions").join(format!("{automation_id}.jsonl"))
    }

    fn write_index(&self) -> Result<()> {
        let ids: Vec<String> = self.automations.read().keys().cloned().collect();
        atomic_write_json(&self.automations_dir().join("index.json"), &Index { ids })
    }

    /// Per-project unique-name invariant, per spec.md §4.
    pub fn name_exists_in_project(&self, project_id: &str, name: &str, exclude_id: Option<&str>) -> bool {
        self.automations.read().values().any(|a| {
            a.project_id == project_id
                && a.name.eq_ignore_ascii_case(name)
                && exclude_id.map(|id| id != a.id).unwrap_or(true)
        })
    }

    pub fn insert(&self, automation: Automation) -> Result<Automation> {
        atomic_write_json(&self.automation_path(&automation.id), &automation)?;
        self.automations.write().insert(automation.id.clone(), automation.clone());
        self.write_index()?;
        Ok(automation)
    }

    pub fn get(&self, id: &str) -> Option<Automation> {
        self.automations.read().get(id).cloned()
    }

    pub fn list(&self, project_id: Option<&str>) -> Vec<Automation> {
        self.automations
            .read()
            .values()
            .filter(|a| project_id.map(|p| a.project_id == p).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut Automation)) -> Result<Option<Automation>> {
        let updated = {
            let mut automations = self.automations.write();
            match automations.get_mut(id) {
                Some(automation) => {
                    f(automation);
                    automation.updated_at = chrono::Utc::now();
                    Some(automation.clone())
                }
                None => None,
            }
        };
        if let Some(automation) = &updated {
            atomic_write_json(&self.automation_path(id), automation)?;
        }
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.automations.write().remove(id).is_some();
        if removed {
            let path = self.automation_path(id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            self.write_index()?;
        }
        Ok(removed)
    }

    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        append_jsonl(&self.executions_path(&record.automation_id), record)
    }

    pub fn executions(&self, automation_id: &str) -> Vec<ExecutionRecord> {
        read_jsonl(&self.executions_path(automation_id))
    }

    pub fn require(&self, id: &str) -> Result<Automation> {
        self.get(id).ok_or_else(|| Error::NotFound(format!("automation '{id}' not found")))
    }
}
