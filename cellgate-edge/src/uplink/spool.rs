//! Local disk spool for batches the hub did not acknowledge.
//!
//! One file per batch, `<UTC timestamp>_<batchId>.json`, same JSON as the wire payload.
//! Files are written under a `.tmp` name and renamed into place, so replay tooling
//! only ever sees complete batches. The gateway never rewrites or deletes spool files.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::models::Batch;

pub const SPOOL_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("spool IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("batch serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpoolStats {
    pub files: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SpoolError + '_ {
    move |source| SpoolError::Io { path: path.to_path_buf(), source }
}

impl Spool {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and prove it accepts writes
    pub async fn ensure_writable(&self) -> Result<(), SpoolError> {
        fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;
        let probe = self.dir.join(".write-probe");
        fs::write(&probe, b"ok").await.map_err(io_err(&probe))?;
        fs::remove_file(&probe).await.map_err(io_err(&probe))?;
        Ok(())
    }

    pub fn file_name_for(batch: &Batch) -> String {
        format!(
            "{}_{}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            batch.batch_id,
            SPOOL_EXTENSION
        )
    }

    /// Persist one batch, returns the final path
    pub async fn write_batch(&self, batch: &Batch) -> Result<PathBuf, SpoolError> {
        let payload = batch.to_bytes()?;
        fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;

        let target = self.dir.join(Self::file_name_for(batch));
        let staging = target.with_extension("tmp");
        fs::write(&staging, &payload).await.map_err(io_err(&staging))?;
        fs::rename(&staging, &target).await.map_err(io_err(&target))?;
        Ok(target)
    }

    /// Completed spool files, oldest first
    pub async fn list(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(SPOOL_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let mut stats = SpoolStats::default();
        for path in self.list().await? {
            // a file may vanish under an external replay process
            if let Ok(meta) = fs::metadata(&path).await {
                stats.files += 1;
                stats.total_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    pub async fn read_batch<P: AsRef<Path>>(path: P) -> Result<Batch, SpoolError> {
        let path = path.as_ref();
        let bytes = fs::read(path).await.map_err(io_err(path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MachineEvent, Source};

    fn batch(n: usize) -> Batch {
        let source = Source { vendor: "mazak".into(), protocol: "mtconnect".into(), ip: None };
        let events = (0..n)
            .map(|i| MachineEvent::new(format!("m-{i}"), source.clone(), Utc::now().fixed_offset()))
            .collect();
        Batch::new("site-a", events)
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"));
        spool.ensure_writable().await.unwrap();

        let original = batch(3);
        let path = spool.write_batch(&original).await.unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with(&format!("_{}.json", original.batch_id)));

        let restored = Spool::read_batch(&path).await.unwrap();
        assert_eq!(restored, original);

        let stats = spool.stats().await.unwrap();
        assert_eq!(stats.files, 1);
        assert!(stats.total_bytes > 0);
    }

    #[tokio::test]
    async fn test_missing_dir_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("never-created"));
        assert!(spool.list().await.unwrap().is_empty());
        assert_eq!(spool.stats().await.unwrap(), SpoolStats::default());
    }

    #[tokio::test]
    async fn test_unwritable_location_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let spool = Spool::new(blocker.join("spool"));
        assert!(matches!(spool.ensure_writable().await, Err(SpoolError::Io { .. })));
    }
}
