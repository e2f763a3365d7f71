use crate::storage_key::StorageKey;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};
use thiserror::Error;

pub const VISITS_FILE_NAME: &str = "visited_urls.txt";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{op} failed for {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("storage {to} already exists, keeping {from}")]
    Collision { from: StorageKey, to: StorageKey },
}

impl SinkError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        SinkError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Storage moved wholesale to the new key.
    Moved,
    /// Nothing was ever written under the old key.
    NothingToMove,
    /// Old and new key are the same.
    Unchanged,
}

/// Append-only per-key record store.
pub trait EventSink: Send + Sync {
    fn ensure_storage(&self, key: &StorageKey) -> Result<(), SinkError>;

    /// Appends `line` plus a newline. No handle is kept between calls.
    fn append(&self, key: &StorageKey, line: &str) -> Result<(), SinkError>;

    /// Moves everything stored under `from` to `to`. Never overwrites `to`.
    fn rename(&self, from: &StorageKey, to: &StorageKey) -> Result<RenameOutcome, SinkError>;
}

/// One directory per storage key under `root`, each holding
/// [`VISITS_FILE_NAME`].
///
/// Appends and directory creation share a read lock; renames take the write
/// lock, so an append never observes a directory halfway through a move and
/// the existence check before a rename cannot race another rename.
#[derive(Debug)]
pub struct FsEventLog {
    root: PathBuf,
    layout: RwLock<()>,
}

impl FsEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layout: RwLock::new(()),
        }
    }

    pub fn storage_dir(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn visits_path(&self, key: &StorageKey) -> PathBuf {
        self.storage_dir(key).join(VISITS_FILE_NAME)
    }

    fn create_dir(&self, key: &StorageKey) -> Result<PathBuf, SinkError> {
        let dir = self.storage_dir(key);
        fs::create_dir_all(&dir).map_err(|err| SinkError::io("create_dir", &dir, err))?;
        Ok(dir)
    }
}

impl EventSink for FsEventLog {
    fn ensure_storage(&self, key: &StorageKey) -> Result<(), SinkError> {
        let _shared = self.layout.read().unwrap_or_else(PoisonError::into_inner);
        self.create_dir(key).map(|_| ())
    }

    fn append(&self, key: &StorageKey, line: &str) -> Result<(), SinkError> {
        let _shared = self.layout.read().unwrap_or_else(PoisonError::into_inner);
        let path = self.create_dir(key)?.join(VISITS_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| SinkError::io("open", &path, err))?;
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        file.write_all(record.as_bytes())
            .map_err(|err| SinkError::io("write", &path, err))
    }

    fn rename(&self, from: &StorageKey, to: &StorageKey) -> Result<RenameOutcome, SinkError> {
        if from == to {
            return Ok(RenameOutcome::Unchanged);
        }
        {
            let _shared = self.layout.read().unwrap_or_else(PoisonError::into_inner);
            let target = self.storage_dir(to);
            if target
                .try_exists()
                .map_err(|err| SinkError::io("stat", &target, err))?
            {
                return Err(SinkError::Collision {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        let _exclusive = self.layout.write().unwrap_or_else(PoisonError::into_inner);
        let source = self.storage_dir(from);
        let target = self.storage_dir(to);
        if !source
            .try_exists()
            .map_err(|err| SinkError::io("stat", &source, err))?
        {
            return Ok(RenameOutcome::NothingToMove);
        }
        if target
            .try_exists()
            .map_err(|err| SinkError::io("stat", &target, err))?
        {
            return Err(SinkError::Collision {
                from: from.clone(),
                to: to.clone(),
            });
        }
        fs::rename(&source, &target).map_err(|err| SinkError::io("rename", &source, err))?;
        Ok(RenameOutcome::Moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(label: &str) -> StorageKey {
        StorageKey::new(label, "10.0.0.1")
    }

    #[test]
    fn ensure_storage_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let log = FsEventLog::new(dir.path());

        log.ensure_storage(&key("Unknown")).expect("first ensure");
        log.ensure_storage(&key("Unknown")).expect("second ensure");

        assert!(log.storage_dir(&key("Unknown")).is_dir());
        assert!(!log.visits_path(&key("Unknown")).exists());
    }

    #[test]
    fn append_creates_storage_lazily_and_keeps_order() {
        let dir = TempDir::new().expect("temp dir");
        let log = FsEventLog::new(dir.path());

        log.append(&key("chrome"), "http://a").expect("append a");
        log.append(&key("chrome"), "http://b").expect("append b");

        let content = fs::read_to_string(log.visits_path(&key("chrome"))).expect("read");
        assert_eq!(content, "http://a\nhttp://b\n");
    }

    #[test]
    fn rename_moves_existing_content() {
        let dir = TempDir::new().expect("temp dir");
        let log = FsEventLog::new(dir.path());
        log.append(&key("Unknown"), "http://a").expect("append");

        let outcome = log.rename(&key("Unknown"), &key("firefox")).expect("rename");

        assert_eq!(outcome, RenameOutcome::Moved);
        assert!(!log.storage_dir(&key("Unknown")).exists());
        let content = fs::read_to_string(log.visits_path(&key("firefox"))).expect("read");
        assert_eq!(content, "http://a\n");
    }

    #[test]
    fn rename_without_source_is_a_noop() {
        let dir = TempDir::new().expect("temp dir");
        let log = FsEventLog::new(dir.path());

        let outcome = log.rename(&key("Unknown"), &key("chrome")).expect("rename");

        assert_eq!(outcome, RenameOutcome::NothingToMove);
        assert!(!log.storage_dir(&key("chrome")).exists());
        assert_eq!(
            log.rename(&key("chrome"), &key("chrome")).expect("same key"),
            RenameOutcome::Unchanged
        );
    }

    #[test]
    fn rename_refuses_to_replace_existing_storage() {
        let dir = TempDir::new().expect("temp dir");
        let log = FsEventLog::new(dir.path());
        log.append(&key("Unknown"), "http://mine").expect("append source");
        // An empty target directory would be silently replaced by fs::rename.
        log.ensure_storage(&key("chrome")).expect("ensure target");

        let err = log
            .rename(&key("Unknown"), &key("chrome"))
            .expect_err("collision");

        assert!(matches!(err, SinkError::Collision { .. }));
        let content = fs::read_to_string(log.visits_path(&key("Unknown"))).expect("read");
        assert_eq!(content, "http://mine\n");
    }

    #[test]
    fn append_reports_io_errors() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, "not a directory").expect("write blocker");
        let log = FsEventLog::new(&blocker);

        let err = log.append(&key("chrome"), "http://a").expect_err("io error");
        assert!(matches!(err, SinkError::Io { op: "create_dir", .. }));
    }

    #[test]
    fn concurrent_appends_and_renames_lose_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(FsEventLog::new(dir.path()));
        let writer_key = StorageKey::new("steady", "10.0.0.9");

        let writer = {
            let log = log.clone();
            let writer_key = writer_key.clone();
            std::thread::spawn(move || {
                for idx in 0..200 {
                    log.append(&writer_key, &format!("http://steady/{idx}"))
                        .expect("append");
                }
            })
        };
        let mover = {
            let log = log.clone();
            std::thread::spawn(move || {
                for idx in 0..50 {
                    let from = StorageKey::new(&format!("hop{idx}"), "10.0.0.1");
                    let to = StorageKey::new(&format!("hop{}", idx + 1), "10.0.0.1");
                    log.append(&from, "http://hop").expect("append hop");
                    log.rename(&from, &to).expect("rename hop");
                }
            })
        };
        writer.join().expect("join writer");
        mover.join().expect("join mover");

        let steady = fs::read_to_string(log.visits_path(&writer_key)).expect("read steady");
        assert_eq!(steady.lines().count(), 200);
        assert!(steady.lines().all(|line| line.starts_with("http://steady/")));
        let hops = fs::read_to_string(log.visits_path(&StorageKey::new("hop50", "10.0.0.1")))
            .expect("read hops");
        assert_eq!(hops.lines().count(), 50);
    }
}
