use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::{SimulationConfig, SimulationResult};

/// Labels a run so its result can be stored against a client scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMeta {
    pub subject_id: String,
    pub scenario_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRecord {
    pub config: SimulationConfig,
    pub result: SimulationResult,
    pub subject_id: String,
    pub scenario_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ScenarioRecord {
    pub fn new(config: SimulationConfig, result: SimulationResult, meta: ScenarioMeta) -> Self {
        Self {
            config,
            result,
            subject_id: meta.subject_id,
            scenario_name: meta.scenario_name,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("scenario rejected by store: {0}")]
    Rejected(String),
    #[error("scenario store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for completed runs. Called at most once per completed run, after
/// the completion callback has already seen the result.
pub trait PersistenceAdapter: Send {
    fn save(&mut self, record: &ScenarioRecord) -> Result<String, PersistenceError>;
}

/// Process-local store; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    records: Arc<Mutex<Vec<(String, ScenarioRecord)>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Result<Vec<(String, ScenarioRecord)>, PersistenceError> {
        let records = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Unavailable("store lock poisoned".to_string()))?;
        Ok(records.clone())
    }
}

impl PersistenceAdapter for InMemoryPersistence {
    fn save(&mut self, record: &ScenarioRecord) -> Result<String, PersistenceError> {
        if record.subject_id.trim().is_empty() {
            return Err(PersistenceError::Rejected("subjectId is empty".to_string()));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Unavailable("store lock poisoned".to_string()))?;
        let id = format!("scenario-{}", records.len() + 1);
        records.push((id.clone(), record.clone()));
        Ok(id)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
