//! Local export storage: the connector behind the `none` destination.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use audience_core::types::Destination;
use audience_core::DeliveryError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::DestinationConnector;
use crate::types::{payload_digest, DeliveryAck, DeliveryMetadata};

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Writes payloads to `<root>/<segment>/<segment>_<YYYYmmddTHHMMSSZ>.<ext>`.
/// A second export in the same second gets a numeric suffix.
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidate(dir: &Path, metadata: &DeliveryMetadata, attempt: u32) -> PathBuf {
        let stamp = metadata.timestamp.format("%Y%m%dT%H%M%SZ");
        let ext = metadata.format.extension();
        let name = if attempt == 0 {
            format!("{}_{stamp}.{ext}", metadata.segment_name)
        } else {
            format!("{}_{stamp}_{attempt}.{ext}", metadata.segment_name)
        };
        dir.join(name)
    }
}

fn create_staging(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Writes `payload` to a hidden staging file, then links it under the first
/// free export name. An export is only ever visible complete, and the staging
/// file is removed whatever the outcome.
fn publish<W, F>(dir: &Path, metadata: &DeliveryMetadata, payload: &[u8], open: F) -> io::Result<PathBuf>
where
    W: Write,
    F: FnOnce(&Path) -> io::Result<W>,
{
    let staging = dir.join(format!(".{}.{}.partial", metadata.segment_name, Uuid::new_v4()));
    let result = open(&staging)
        .and_then(|mut out| {
            out.write_all(payload)?;
            out.flush()
        })
        .and_then(|()| link_free_name(&staging, dir, metadata));

    if let Err(e) = fs::remove_file(&staging) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
        }
    }
    result
}

fn link_free_name(staging: &Path, dir: &Path, metadata: &DeliveryMetadata) -> io::Result<PathBuf> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = LocalConnector::candidate(dir, metadata, attempt);
        match fs::hard_link(staging, &path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!(
            "no free file name for segment {} at {}",
            metadata.segment_name, metadata.timestamp
        ),
    ))
}

#[async_trait]
impl DestinationConnector for LocalConnector {
    fn destination(&self) -> Destination {
        Destination::None
    }

    async fn deliver(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError> {
        let name = &metadata.segment_name;
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(DeliveryError::Io(format!(
                "segment name {name:?} is not a valid directory name"
            )));
        }

        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DeliveryError::Io(format!("{}: {e}", dir.display())))?;

        // Runs to completion even if this future is dropped, so a timed-out
        // delivery never leaves a truncated file behind.
        let path = {
            let target = dir.clone();
            let metadata = metadata.clone();
            let payload = payload.to_vec();
            tokio::task::spawn_blocking(move || publish(&target, &metadata, &payload, create_staging))
                .await
                .map_err(|e| DeliveryError::Io(format!("local write task failed: {e}")))?
                .map_err(|e| DeliveryError::Io(format!("{}: {e}", dir.display())))?
        };

        info!(
            segment = %name,
            path = %path.display(),
            bytes = payload.len(),
            "Export written to local storage"
        );
        Ok(DeliveryAck {
            destination: Destination::None,
            reference: path.display().to_string(),
            bytes: payload.len() as u64,
            digest: payload_digest(payload),
            delivered_at: metadata.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audience_core::types::ExportFormat;
    use chrono::{TimeZone, Utc};

    fn metadata(format: ExportFormat) -> DeliveryMetadata {
        DeliveryMetadata {
            segment_name: "seniors".into(),
            format,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 30, 23, 5, 9).unwrap(),
            row_count: 3,
            schedule_id: None,
        }
    }

    #[tokio::test]
    async fn test_writes_under_segment_directory() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());

        let ack = connector
            .deliver(b"[]", &metadata(ExportFormat::Json))
            .await
            .unwrap();
        let expected = dir.path().join("seniors").join("seniors_20240630T230509Z.json");
        assert_eq!(ack.reference, expected.display().to_string());
        assert_eq!(std::fs::read(&expected).unwrap(), b"[]");
        assert_eq!(ack.bytes, 2);
    }

    #[tokio::test]
    async fn test_same_second_exports_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());
        let meta = metadata(ExportFormat::Csv);

        let first = connector.deliver(b"one", &meta).await.unwrap();
        let second = connector.deliver(b"two", &meta).await.unwrap();
        assert_ne!(first.reference, second.reference);
        assert!(second.reference.ends_with("seniors_20240630T230509Z_1.csv"));
        assert_eq!(std::fs::read(&first.reference).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_rejects_path_like_segment_names() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());
        let mut meta = metadata(ExportFormat::Csv);
        meta.segment_name = "../escape".into();
        let err = connector.deliver(b"x", &meta).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Io(_)));
    }

    /// Accepts `room` bytes, then fails like a full disk.
    struct FullDisk {
        file: File,
        room: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = self.file.write(&buf[..buf.len().min(self.room)])?;
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let segment_dir = dir.path().join("seniors");
        fs::create_dir_all(&segment_dir).unwrap();
        let meta = metadata(ExportFormat::Csv);

        let err = publish(&segment_dir, &meta, b"Id,Name\n1,Ann\n", |path| {
            Ok(FullDisk {
                file: create_staging(path)?,
                room: 4,
            })
        })
        .unwrap_err();
        assert!(err.to_string().contains("no space left"));
        assert_eq!(fs::read_dir(&segment_dir).unwrap().count(), 0);

        // The export name was never taken.
        let ack = LocalConnector::new(dir.path()).deliver(b"ok", &meta).await.unwrap();
        assert!(ack.reference.ends_with("seniors_20240630T230509Z.csv"));
        assert_eq!(fs::read_dir(&segment_dir).unwrap().count(), 1);
    }
}
