//! The filesystem manager: per-user namespaces, virtual-to-real path
//! resolution with traversal rejection, path-keyed advisory locks, and
//! crash-atomic writes.
//!
//! All external operations quote virtual POSIX paths; real paths are
//! computed here and never leave this module.

use super::error::{FsError, FsErrorKind};
use crate::options::CHUNK_SIZE;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Stat information for one directory entry, as carried in `DATA_STAT` and
/// `DATA_LIST` acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryStat {
    /// Base name of the entry.
    pub name: String,
    /// Virtual path of the entry.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub permissions: u32,
    /// Modification time, `YYYY-MM-DD HH:MM:SS`.
    pub modified: String,
    /// True for directories.
    pub is_dir: bool,
    /// True for regular files.
    pub is_file: bool,
}

/// Normalizes `path` against `cwd` into an absolute virtual path.
///
/// Absolute requests are taken as-is, relative ones against `cwd`; `.` and
/// empty segments vanish and `..` pops, clamped at the virtual root the way
/// POSIX treats `/..`.
pub(crate) fn normalize_virtual(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Mediates all disk I/O for a storage node.
pub(crate) struct FsManager {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FsManager {
    /// Opens (creating if needed) the base directory.
    pub(crate) async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(FsManager {
            root: root.canonicalize()?,
            locks: DashMap::new(),
        })
    }

    /// The namespace root for `user`, created on first use.
    pub(crate) async fn namespace(&self, user: &str) -> Result<PathBuf, FsError> {
        if user.is_empty() || user.contains(['/', '\0']) || user == "." || user == ".." {
            return Err(FsErrorKind::SecurityViolation.into());
        }
        let path = self.root.join(user);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Resolves `(cwd, path)` inside `namespace` to `(virtual, real)`,
    /// rejecting anything that escapes the namespace root.
    pub(crate) fn resolve(&self, namespace: &Path, cwd: &str, path: &str) -> Result<(String, PathBuf), FsError> {
        if path.contains('\0') {
            return Err(FsErrorKind::SecurityViolation.into());
        }
        let virtual_path = normalize_virtual(cwd, path);
        let real = namespace.join(virtual_path.trim_start_matches('/'));

        // normalize_virtual never emits `..`, so the join stays under the
        // namespace root; this check is the final guard.
        if !real.starts_with(namespace) {
            return Err(FsErrorKind::SecurityViolation.into());
        }
        Ok((virtual_path, real))
    }

    fn lock_for(&self, real: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(real.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn stat_real(&self, virtual_path: &str, real: &Path) -> Result<EntryStat, FsError> {
        let meta = tokio::fs::metadata(real).await?;
        let modified = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let name = virtual_path.rsplit('/').next().unwrap_or("").to_string();
        Ok(EntryStat {
            name,
            path: virtual_path.to_string(),
            size: meta.len(),
            permissions: permission_bits(&meta),
            modified,
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
        })
    }

    /// Entry names in the directory at `path`.
    pub(crate) async fn list_dir(&self, namespace: &Path, cwd: &str, path: &str) -> Result<Vec<String>, FsError> {
        let (_, real) = self.resolve(namespace, cwd, path)?;
        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;
        self.require_dir(&real).await?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&real).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(entries)
    }

    /// Directory contents with full stat information.
    pub(crate) async fn list_dir_with_stats(&self, namespace: &Path, cwd: &str, path: &str) -> Result<Vec<EntryStat>, FsError> {
        let (virtual_dir, real) = self.resolve(namespace, cwd, path)?;
        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;
        self.require_dir(&real).await?;

        let mut results = Vec::new();
        let mut dir = tokio::fs::read_dir(&real).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_virtual = normalize_virtual(&virtual_dir, &name);
            results.push(self.stat_real(&child_virtual, &entry.path()).await?);
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    /// Stat for one path.
    pub(crate) async fn stat(&self, namespace: &Path, cwd: &str, path: &str) -> Result<EntryStat, FsError> {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        self.stat_real(&virtual_path, &real).await
    }

    /// Validates that `path` names an existing directory and returns its
    /// virtual form; the `CWD` primitive.
    pub(crate) async fn change_dir(&self, namespace: &Path, cwd: &str, path: &str) -> Result<String, FsError> {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        self.require_dir(&real).await?;
        Ok(virtual_path)
    }

    /// Creates a directory; fails when it exists.
    pub(crate) async fn make_dir(&self, namespace: &Path, cwd: &str, path: &str) -> Result<String, FsError> {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;
        if tokio::fs::try_exists(&real).await? {
            return Err(FsErrorKind::AlreadyExists.into());
        }
        tokio::fs::create_dir_all(&real).await?;
        Ok(virtual_path)
    }

    /// Removes an empty directory.
    pub(crate) async fn remove_dir(&self, namespace: &Path, cwd: &str, path: &str) -> Result<String, FsError> {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;
        self.require_dir(&real).await?;
        let mut dir = tokio::fs::read_dir(&real).await?;
        if dir.next_entry().await?.is_some() {
            return Err(FsErrorKind::NotEmpty.into());
        }
        tokio::fs::remove_dir(&real).await?;
        Ok(virtual_path)
    }

    /// Deletes a regular file.
    pub(crate) async fn delete_file(&self, namespace: &Path, cwd: &str, path: &str) -> Result<String, FsError> {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;
        self.require_file(&real).await?;
        tokio::fs::remove_file(&real).await?;
        Ok(virtual_path)
    }

    /// Renames a file or directory. Both ends are locked in path order so
    /// two concurrent renames cannot deadlock.
    pub(crate) async fn rename_path(&self, namespace: &Path, cwd: &str, old_path: &str, new_path: &str) -> Result<(String, String), FsError> {
        let (old_virtual, old_real) = self.resolve(namespace, cwd, old_path)?;
        let (new_virtual, new_real) = self.resolve(namespace, cwd, new_path)?;

        let (first, second) = if old_real <= new_real {
            (old_real.clone(), new_real.clone())
        } else {
            (new_real.clone(), old_real.clone())
        };
        let first_lock = self.lock_for(&first);
        let second_lock = self.lock_for(&second);
        let _first_guard = first_lock.lock().await;
        let _second_guard = if first == second { None } else { Some(second_lock.lock().await) };

        if !tokio::fs::try_exists(&old_real).await? {
            return Err(FsErrorKind::NotFound.into());
        }
        if tokio::fs::try_exists(&new_real).await? {
            return Err(FsErrorKind::AlreadyExists.into());
        }
        if let Some(parent) = new_real.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_real, &new_real).await?;
        Ok((old_virtual, new_virtual))
    }

    /// Streams `reader` into the file at `path` atomically: a sibling tmp
    /// file takes the bytes, is fsynced, then renamed into place. Returns
    /// the virtual path and the byte count.
    pub(crate) async fn write_stream<R>(&self, namespace: &Path, cwd: &str, path: &str, reader: &mut R) -> Result<(String, u64), FsError>
    where
        R: AsyncRead + Unpin,
    {
        let (virtual_path, real) = self.resolve(namespace, cwd, path)?;
        let parent = real.parent().ok_or(FsErrorKind::SecurityViolation)?.to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let lock = self.lock_for(&real);
        let _guard = lock.lock().await;

        let tmp_name = format!(".{}.{}.tmp", real.file_name().unwrap_or_default().to_string_lossy(), uuid::Uuid::new_v4().simple());
        let tmp = parent.join(tmp_name);

        let result = async {
            let mut out = tokio::fs::File::create(&tmp).await?;
            let mut written: u64 = 0;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            out.sync_all().await?;
            drop(out);
            tokio::fs::rename(&tmp, &real).await?;
            Ok::<u64, FsError>(written)
        }
        .await;

        match result {
            Ok(written) => Ok((virtual_path, written)),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    /// Opens `path` for chunked reading; fails unless it is a regular file.
    pub(crate) async fn open_read(&self, namespace: &Path, cwd: &str, path: &str) -> Result<(tokio::fs::File, u64), FsError> {
        let (_, real) = self.resolve(namespace, cwd, path)?;
        self.require_file(&real).await?;
        let file = tokio::fs::File::open(&real).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// True when `path` exists and is a regular file.
    pub(crate) async fn is_file(&self, namespace: &Path, cwd: &str, path: &str) -> bool {
        match self.resolve(namespace, cwd, path) {
            Ok((_, real)) => tokio::fs::metadata(&real).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// A free `name_copy.ext`-style sibling for `virtual_path`, for parking
    /// the loser of a store conflict.
    pub(crate) async fn copy_name(&self, namespace: &Path, virtual_path: &str) -> String {
        let (dir, file) = match virtual_path.rfind('/') {
            Some(idx) => (&virtual_path[..idx], &virtual_path[idx + 1..]),
            None => ("", virtual_path),
        };
        let (stem, ext) = match file.rfind('.') {
            Some(idx) if idx > 0 => (&file[..idx], &file[idx..]),
            _ => (file, ""),
        };

        let mut counter = 0u32;
        loop {
            let candidate = if counter == 0 {
                format!("{dir}/{stem}_copy{ext}")
            } else {
                format!("{dir}/{stem}_copy{counter}{ext}")
            };
            match self.resolve(namespace, "/", &candidate) {
                Ok((virtual_candidate, real)) => {
                    if !tokio::fs::try_exists(&real).await.unwrap_or(false) {
                        return virtual_candidate;
                    }
                }
                Err(_) => return format!("{dir}/{stem}_copy{ext}"),
            }
            counter += 1;
        }
    }

    /// Walks every namespace and returns each directory as a
    /// `(user, virtual_path)` pair; the exported structure of a merge dump.
    pub(crate) async fn export_tree(&self) -> Result<Vec<(String, String)>, FsError> {
        let mut out = Vec::new();
        let mut users = tokio::fs::read_dir(&self.root).await?;
        while let Some(user_entry) = users.next_entry().await? {
            if !user_entry.metadata().await?.is_dir() {
                continue;
            }
            let user = user_entry.file_name().to_string_lossy().into_owned();
            let mut stack = vec![(user_entry.path(), String::from("/"))];
            while let Some((dir, virtual_dir)) = stack.pop() {
                out.push((user.clone(), virtual_dir.clone()));
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        stack.push((entry.path(), normalize_virtual(&virtual_dir, &name)));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn require_dir(&self, real: &Path) -> Result<(), FsError> {
        let meta = tokio::fs::metadata(real).await?;
        if !meta.is_dir() {
            return Err(FsErrorKind::NotADirectory.into());
        }
        Ok(())
    }

    async fn require_file(&self, real: &Path) -> Result<(), FsError> {
        let meta = tokio::fs::metadata(real).await?;
        if !meta.is_file() {
            return Err(FsErrorKind::NotAFile.into());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn permission_bits(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
