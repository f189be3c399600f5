//! Durable status store backed by a JSON file.
//!
//! Values live in memory and are mirrored to `<data_dir>/<file>` by a background
//! persistence task. Each persist writes the full snapshot to a temp file and
//! renames it over the destination while holding an exclusive `fs2` lock on a
//! sidecar `.lock` file; readers take the shared lock.

use anyhow::{anyhow, Result};
use fs2::FileExt;
use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

use super::{StatusEntry, StatusSink};

type Entries = BTreeMap<String, StatusEntry>;

enum PersistCommand {
    Changed,
    Flush(oneshot::Sender<()>),
}

/// File-backed [`StatusSink`].
#[derive(Clone)]
pub struct StatusStore {
    path: PathBuf,
    entries: Arc<Mutex<Entries>>,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
}

impl StatusStore {
    /// Open (or create) the store at `path`, loading any previously persisted values.
    ///
    /// Must be called inside a Tokio runtime; spawns the persistence task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| anyhow!("Failed to create status dir {}: {}", dir.display(), e))?;
            }
        }

        let initial = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Entries>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Status file {} is unreadable ({}); starting with empty status",
                        path.display(),
                        e
                    );
                    Entries::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::new(),
            Err(e) => return Err(anyhow!("Failed to read status file {}: {}", path.display(), e)),
        };

        let entries = Arc::new(Mutex::new(initial));
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_loop(path.clone(), entries.clone(), persist_rx));

        Ok(Self {
            path,
            entries,
            persist_tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every write issued so far has reached disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> Entries {
        self.lock().clone()
    }

    /// Read a persisted status file without opening a store (used by the `status` command).
    pub fn read_file(path: impl AsRef<Path>) -> Result<Entries> {
        let path = path.as_ref();
        let lock = open_lock_file(path)?;
        lock.lock_shared()?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read status file {}: {}", path.display(), e))?;
        drop(lock);
        let entries = serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse status file {}: {}", path.display(), e))?;
        Ok(entries)
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StatusSink for StatusStore {
    fn set_value(&self, key: &str, value: Value, ack: bool) {
        self.lock()
            .insert(key.to_string(), StatusEntry::new(value, ack));
        let _ = self.persist_tx.send(PersistCommand::Changed);
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().get(key).map(|e| e.value.clone())
    }
}

async fn persist_loop(
    path: PathBuf,
    entries: Arc<Mutex<Entries>>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        // Coalesce bursts: one write covers every change queued so far.
        let mut dirty = matches!(cmd, PersistCommand::Changed);
        let mut waiters = Vec::new();
        if let PersistCommand::Flush(done) = cmd {
            waiters.push(done);
        }
        while let Ok(next) = rx.try_recv() {
            match next {
                PersistCommand::Changed => dirty = true,
                PersistCommand::Flush(done) => waiters.push(done),
            }
        }

        if dirty {
            let content = {
                let guard = match entries.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                serde_json::to_string_pretty(&*guard)
            };
            match content {
                Ok(content) => {
                    let target = path.clone();
                    let res = tokio::task::spawn_blocking(move || write_file_locked(&target, &content)).await;
                    match res {
                        Ok(Ok(())) => debug!("Persisted status to {}", path.display()),
                        Ok(Err(e)) => warn!("Failed to persist status: {}", e),
                        Err(e) => warn!("Status persistence task failed: {}", e),
                    }
                }
                Err(e) => warn!("Failed to serialize status: {}", e),
            }
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "status.json".into());
    name.push(".lock");
    path.with_file_name(name)
}

fn open_lock_file(path: &Path) -> Result<std::fs::File> {
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path(path))?;
    Ok(lock)
}

/// Atomically replace `path` with `content` under the exclusive lock.
fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let lock = open_lock_file(path)?;
    lock.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("status.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::keys;
    use serde_json::json;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");

        let store = StatusStore::open(&path).await.expect("open");
        store.set_value(keys::HOST, json!("10.0.0.5"), true);
        store.set_value(keys::CONNECTION, json!(true), true);
        store.flush().await;

        let reopened = StatusStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.get_value(keys::HOST), Some(json!("10.0.0.5")));
        assert_eq!(reopened.get_value(keys::CONNECTION), Some(json!(true)));

        let on_disk = StatusStore::read_file(&path).expect("read file");
        assert_eq!(on_disk.get(keys::HOST).map(|e| e.value.clone()), Some(json!("10.0.0.5")));
        assert!(on_disk.get(keys::HOST).map(|e| e.ack).unwrap_or(false));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        std::fs::write(&path, "{not json").expect("write");
        let store = StatusStore::open(&path).await.expect("open");
        assert!(store.snapshot().is_empty());
        assert_eq!(store.get_value(keys::HOST), None);
    }
}
