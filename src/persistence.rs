//! On-disk caches.
//!
//! Everything the engine and registry persist is a JSON document stored under
//! a file name inside a [`Folder`]. The folder is an opaque text key-value
//! store; [`DiskFolder`] maps it onto a directory and [`MemoryFolder`] keeps
//! it in memory.
//!
//! Writes follow a dirty-flag + time-laziness policy ([`LazyFlush`]): a
//! mutation only marks the cache dirty, and the owner saves it once the
//! laziness window has passed or at a natural flush point (a connection
//! closing, the periodic timer, shutdown).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;

pub const ADDRESSES_FILE: &str = "addresses.json";
pub const TXS_FILE: &str = "txs.json";
pub const HEADERS_FILE: &str = "headers.json";
pub const SERVERS_FILE: &str = "servers.json";
pub const KEYS_FILE: &str = "keys.json";

/// Text key-value storage.
///
/// Implementations store exactly what they are given. A folder that must
/// keep its contents private, such as the engine's keys folder, encrypts
/// inside its own implementation; [`DiskFolder`] and [`MemoryFolder`] do not.
pub trait Folder: Send + Sync {
    /// Returns `Ok(None)` when the file does not exist.
    fn read_text(&self, name: &str) -> io::Result<Option<String>>;

    fn write_text(&self, name: &str, text: &str) -> io::Result<()>;
}

/// A directory on the local file system.
#[derive(Debug, Clone)]
pub struct DiskFolder {
    root: PathBuf,
}

impl DiskFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A folder nested inside this one.
    pub fn folder(&self, name: &str) -> DiskFolder {
        DiskFolder::new(self.root.join(name))
    }
}

impl Folder for DiskFolder {
    fn read_text(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.root.join(name)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_text(&self, name: &str, text: &str) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;

        // Write-then-rename so a crash never leaves a half-written document.
        let tmp = self.root.join(format!("{}.tmp", name));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, self.root.join(name))
    }
}

/// In-memory folder, used by tests and by embedders without a disk.
#[derive(Debug, Default)]
pub struct MemoryFolder {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    pub fn insert(&self, name: &str, text: &str) {
        self.lock().insert(name.to_string(), text.to_string());
    }
}

impl Folder for MemoryFolder {
    fn read_text(&self, name: &str) -> io::Result<Option<String>> {
        Ok(self.get(name))
    }

    fn write_text(&self, name: &str, text: &str) -> io::Result<()> {
        self.insert(name, text);
        Ok(())
    }
}

/// Loads a JSON document.
///
/// A missing file yields `None`. So does a file that cannot be read or
/// parsed: the caller resets that cache and resyncs rather than failing.
pub fn load_document<T: DeserializeOwned>(folder: &dyn Folder, name: &str) -> Option<T> {
    let text = match folder.read_text(name) {
        Ok(Some(text)) => text,
        Ok(None) => {
            log::debug!("[PERSIST] {} not found, starting empty", name);
            return None;
        }
        Err(e) => {
            log::warn!("[PERSIST] cannot read {}: {}", name, e);
            return None;
        }
    };

    match serde_json::from_str(&text) {
        Ok(doc) => Some(doc),
        Err(e) => {
            log::warn!("[PERSIST] {} is corrupt ({}), resetting cache", name, e);
            None
        }
    }
}

pub fn save_document<T: Serialize>(
    folder: &dyn Folder,
    name: &str,
    doc: &T,
) -> Result<(), SyncError> {
    let text = serde_json::to_string(doc)?;
    folder.write_text(name, &text)?;
    log::debug!("[PERSIST] saved {} ({} bytes)", name, text.len());
    Ok(())
}

/// Dirty flag plus the time of the last save.
#[derive(Debug, Clone)]
pub struct LazyFlush {
    dirty: bool,
    saved_at: Instant,
    laziness: Duration,
}

impl LazyFlush {
    pub fn new(laziness: Duration) -> Self {
        Self {
            dirty: false,
            saved_at: Instant::now(),
            laziness,
        }
    }

    /// Marks the cache dirty. Returns true when the laziness window has
    /// already elapsed, i.e. the caller should save right away.
    pub fn mark_dirty(&mut self, now: Instant) -> bool {
        self.dirty = true;
        self.is_due(now)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.dirty && now.saturating_duration_since(self.saved_at) >= self.laziness
    }

    pub fn mark_saved(&mut self, now: Instant) {
        self.dirty = false;
        self.saved_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        values: Vec<u32>,
    }

    #[test]
    fn memory_folder_round_trips_documents() {
        let folder = MemoryFolder::new();
        save_document(&folder, "doc.json", &Doc { values: vec![1, 2] }).unwrap();

        let loaded: Option<Doc> = load_document(&folder, "doc.json");
        assert_eq!(loaded, Some(Doc { values: vec![1, 2] }));
    }

    #[test]
    fn corrupt_document_loads_as_none() {
        let folder = MemoryFolder::new();
        folder.insert("doc.json", "{ not json");

        let loaded: Option<Doc> = load_document(&folder, "doc.json");
        assert!(loaded.is_none());

        folder.insert("doc.json", r#"{ "other": 1 }"#);
        let loaded: Option<Doc> = load_document(&folder, "doc.json");
        assert!(loaded.is_none());
    }

    #[test]
    fn disk_folder_reports_missing_files() {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("stratum_sync_folder_{}", nanos));

        let folder = DiskFolder::new(&dir);
        assert_eq!(folder.read_text("missing.json").unwrap(), None);

        folder.write_text("a.json", "{}").unwrap();
        assert_eq!(folder.read_text("a.json").unwrap().as_deref(), Some("{}"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lazy_flush_waits_for_window() {
        let start = Instant::now();
        let mut flush = LazyFlush::new(Duration::from_secs(10));
        flush.mark_saved(start);

        assert!(!flush.mark_dirty(start + Duration::from_secs(3)));
        assert!(flush.is_dirty());
        assert!(!flush.is_due(start + Duration::from_secs(9)));
        assert!(flush.is_due(start + Duration::from_secs(10)));

        flush.mark_saved(start + Duration::from_secs(10));
        assert!(!flush.is_dirty());
        assert!(!flush.is_due(start + Duration::from_secs(60)));
    }
}
