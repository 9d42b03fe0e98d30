//! Segment persistence: an in-memory store and a directory of YAML documents.

use std::path::{Path, PathBuf};

use audience_core::StoreError;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::segment::Segment;

pub trait SegmentStore: Send + Sync {
    /// Inserts or replaces the segment with the same name.
    fn put(&self, segment: &Segment) -> Result<(), StoreError>;

    fn get(&self, name: &str) -> Result<Option<Segment>, StoreError>;

    /// All segments, ordered by name.
    fn list(&self) -> Result<Vec<Segment>, StoreError>;

    /// Returns whether a segment was removed.
    fn delete(&self, name: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemorySegmentStore {
    segments: DashMap<String, Segment>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn put(&self, segment: &Segment) -> Result<(), StoreError> {
        self.segments.insert(segment.name.clone(), segment.clone());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Segment>, StoreError> {
        Ok(self.segments.get(name).map(|s| s.clone()))
    }

    fn list(&self) -> Result<Vec<Segment>, StoreError> {
        let mut segments: Vec<Segment> = self.segments.iter().map(|s| s.value().clone()).collect();
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.segments.remove(name).is_some())
    }
}

/// One `<name>.yaml` document per segment. Writes go through a temporary
/// file and a rename so readers never see a partial document.
pub struct YamlSegmentStore {
    dir: PathBuf,
}

impl YamlSegmentStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Segment store opened");
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }

    fn read(path: &Path) -> Result<Segment, StoreError> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| StoreError::Corrupt {
            location: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

impl SegmentStore for YamlSegmentStore {
    fn put(&self, segment: &Segment) -> Result<(), StoreError> {
        let yaml =
            serde_yaml::to_string(segment).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let target = self.path_for(&segment.name);
        let tmp = self.dir.join(format!(".{}.yaml.tmp", segment.name));
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Segment>, StoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<Segment>, StoreError> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_yaml = path.extension().is_some_and(|ext| ext == "yaml");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_yaml || hidden {
                continue;
            }
            match Self::read(&path) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable segment file");
                }
            }
        }
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
