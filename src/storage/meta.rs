//! Per-node file metadata: versions and transfer ids, snapshotted to JSON
//! on every mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Metadata for one stored file.
///
/// `filename` is the namespaced virtual path `user/<virtual-path>`;
/// `transfer_id` is minted per store operation and breaks ties between
/// concurrent stores of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Namespaced virtual path, the table key.
    pub filename: String,
    /// Monotonic version: one greater than the maximum seen among replicas
    /// at write time.
    pub version: u64,
    /// UUID minted for the store operation that produced this entry.
    pub transfer_id: String,
    /// Wall-clock creation time, seconds since the epoch.
    pub timestamp: i64,
}

impl FileMetadata {
    /// Builds the metadata key for `user`'s file at `virtual_path`.
    pub fn key(user: &str, virtual_path: &str) -> String {
        format!("{user}{virtual_path}")
    }

    /// Splits a metadata key back into `(user, virtual_path)`.
    pub fn split_key(filename: &str) -> Option<(&str, &str)> {
        let slash = filename.find('/')?;
        let (user, path) = filename.split_at(slash);
        if user.is_empty() { None } else { Some((user, path)) }
    }

    /// Whether this entry supersedes `other` for the same name: higher
    /// version wins, equal versions fall back to the lexicographically
    /// greater transfer id.
    pub fn is_newer_than(&self, other: &FileMetadata) -> bool {
        (self.version, self.transfer_id.as_str()) > (other.version, other.transfer_id.as_str())
    }
}

/// The metadata table of one storage node, keyed by filename and persisted
/// through tmp-file + atomic rename on every mutation.
pub(crate) struct MetadataTable {
    path: PathBuf,
    table: Mutex<HashMap<String, FileMetadata>>,
    logger: slog::Logger,
}

impl MetadataTable {
    /// Opens the snapshot at `path`; a corrupt or absent snapshot starts
    /// the table empty.
    pub(crate) async fn open(path: PathBuf, logger: slog::Logger) -> Self {
        let table = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        MetadataTable {
            path,
            table: Mutex::new(table),
            logger,
        }
    }

    pub(crate) async fn get(&self, filename: &str) -> Option<FileMetadata> {
        self.table.lock().await.get(filename).cloned()
    }

    pub(crate) async fn upsert(&self, meta: FileMetadata) {
        let snapshot = {
            let mut table = self.table.lock().await;
            table.insert(meta.filename.clone(), meta);
            table.clone()
        };
        self.persist(snapshot).await;
    }

    pub(crate) async fn remove(&self, filename: &str) -> Option<FileMetadata> {
        let (removed, snapshot) = {
            let mut table = self.table.lock().await;
            let removed = table.remove(filename);
            (removed, table.clone())
        };
        if removed.is_some() {
            self.persist(snapshot).await;
        }
        removed
    }

    /// Moves the entry at `old` to the key `new`, keeping its version and
    /// transfer id; the metadata side of a rename.
    pub(crate) async fn rename(&self, old: &str, new: &str) {
        let snapshot = {
            let mut table = self.table.lock().await;
            let Some(mut meta) = table.remove(old) else {
                return;
            };
            meta.filename = new.to_string();
            table.insert(new.to_string(), meta);
            table.clone()
        };
        self.persist(snapshot).await;
    }

    pub(crate) async fn all(&self) -> Vec<FileMetadata> {
        let table = self.table.lock().await;
        let mut entries: Vec<FileMetadata> = table.values().cloned().collect();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        entries
    }

    pub(crate) async fn export_map(&self) -> HashMap<String, FileMetadata> {
        self.table.lock().await.clone()
    }

    async fn persist(&self, snapshot: HashMap<String, FileMetadata>) {
        if let Err(err) = self.write_snapshot(snapshot).await {
            slog::error!(self.logger, "failed to persist metadata table: {}", err);
        }
    }

    async fn write_snapshot(&self, snapshot: HashMap<String, FileMetadata>) -> std::io::Result<()> {
        let raw = serde_json::to_vec(&snapshot).map_err(|e| std::io::Error::other(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&raw).await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slog::Drain;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog_stdlog::StdLog {}.fuse(), slog::o!())
    }

    fn meta(filename: &str, version: u64, transfer_id: &str) -> FileMetadata {
        FileMetadata {
            filename: filename.to_string(),
            version,
            transfer_id: transfer_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    #[test]
    fn key_round_trip() {
        let key = FileMetadata::key("alice", "/docs/report.txt");
        assert_eq!(key, "alice/docs/report.txt");
        assert_eq!(FileMetadata::split_key(&key), Some(("alice", "/docs/report.txt")));
        assert_eq!(FileMetadata::split_key("/rootless"), None);
    }

    #[test]
    fn newer_is_version_then_transfer_id() {
        let base = meta("alice/a.txt", 1, "bbb");
        assert!(meta("alice/a.txt", 2, "aaa").is_newer_than(&base));
        assert!(meta("alice/a.txt", 1, "ccc").is_newer_than(&base));
        assert!(!meta("alice/a.txt", 1, "aaa").is_newer_than(&base));
        assert!(!base.is_newer_than(&base));
    }

    #[tokio::test]
    async fn table_mutations_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let table = MetadataTable::open(path.clone(), test_logger()).await;
        table.upsert(meta("alice/a.txt", 1, "t1")).await;
        table.upsert(meta("alice/b.txt", 1, "t2")).await;
        table.rename("alice/b.txt", "alice/c.txt").await;
        table.remove("alice/a.txt").await;

        let reloaded = MetadataTable::open(path, test_logger()).await;
        let entries = reloaded.all().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "alice/c.txt");
        assert_eq!(entries[0].transfer_id, "t2");
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let table = MetadataTable::open(path, test_logger()).await;
        assert!(table.all().await.is_empty());
    }
}
