//! Schedule persistence: in-memory, or a single JSON document on disk.

use std::collections::BTreeMap;
use std::path::PathBuf;

use audience_core::StoreError;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::schedule::ExportSchedule;

pub trait ScheduleStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<ExportSchedule>, StoreError>;

    /// Inserts or replaces a schedule.
    fn put(&self, schedule: &ExportSchedule) -> Result<(), StoreError>;

    /// Returns whether a schedule was removed.
    fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryScheduleStore {
    schedules: DashMap<Uuid, ExportSchedule>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn load_all(&self) -> Result<Vec<ExportSchedule>, StoreError> {
        Ok(self.schedules.iter().map(|s| s.value().clone()).collect())
    }

    fn put(&self, schedule: &ExportSchedule) -> Result<(), StoreError> {
        self.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.schedules.remove(&id).is_some())
    }
}

/// All schedules in one JSON array. Every change rewrites the document via a
/// temporary file and a rename; the cached copy only changes once that
/// succeeds.
pub struct JsonScheduleStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<Uuid, ExportSchedule>>,
}

impl JsonScheduleStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cache = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let schedules: Vec<ExportSchedule> =
                    serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                        location: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                schedules.into_iter().map(|s| (s.id, s)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), schedules = cache.len(), "Schedule store opened");
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn write(&self, schedules: &BTreeMap<Uuid, ExportSchedule>) -> Result<(), StoreError> {
        let all: Vec<&ExportSchedule> = schedules.values().collect();
        let json =
            serde_json::to_vec_pretty(&all).map_err(|e| StoreError::Encoding(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ScheduleStore for JsonScheduleStore {
    fn load_all(&self) -> Result<Vec<ExportSchedule>, StoreError> {
        Ok(self.cache.lock().values().cloned().collect())
    }

    fn put(&self, schedule: &ExportSchedule) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        next.insert(schedule.id, schedule.clone());
        self.write(&next)?;
        *cache = next;
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock();
        if !cache.contains_key(&id) {
            return Ok(false);
        }
        let mut next = cache.clone();
        next.remove(&id);
        self.write(&next)?;
        *cache = next;
        Ok(true)
    }
}
