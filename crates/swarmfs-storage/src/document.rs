//! Atomic read/modify/write of JSON documents.
//!
//! Writers serialize through the document's [`FileLock`] and publish by
//! writing a uniquely named temp file in the same directory, syncing it, and
//! renaming it over the destination. Readers only ever open the final path,
//! so they see either the old document or the new one, never a torn write.
//! A crash before the rename leaves the original untouched; the orphaned
//! temp file never matches the document name and is ignored.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use swarmfs_core::ids::next_seq;
use swarmfs_core::{Config, Error, Result};

use crate::lock::{FileLock, LockOptions, ensure_parent_dir};

/// Suffix used for in-flight temp files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Read raw bytes, mapping "file absent" to `None`.
pub(crate) fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse bytes as `T`, reporting a `CorruptDocument` with a preview on failure.
pub(crate) fn parse_document<T: DeserializeOwned>(path: &Path, raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|_| Error::corrupt(path, raw))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{name}.{}.{}{TEMP_SUFFIX}",
        std::process::id(),
        next_seq()
    ))
}

/// Write bytes to a file atomically via a temp file + rename.
///
/// The temp file is created in the same directory as the target so that
/// `fs::rename` stays on one filesystem.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = temp_path_for(path);
    let written = (|| -> io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_data()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and publish it atomically. The caller is
/// responsible for holding the document lock.
pub fn write_json_unlocked<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &content)
}

/// Lock-guarded JSON document access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentStore {
    options: LockOptions,
}

impl DocumentStore {
    #[must_use]
    pub const fn new(options: LockOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(LockOptions::from_config(config))
    }

    #[must_use]
    pub const fn lock_options(&self) -> LockOptions {
        self.options
    }

    #[must_use]
    pub fn lock_for(&self, path: &Path) -> FileLock {
        FileLock::new(path).with_options(self.options)
    }

    /// Current document, or `None` if the file does not exist.
    ///
    /// Does not take the lock: atomic publication makes a lock-free read safe.
    pub fn read(&self, path: &Path) -> Result<Option<Value>> {
        self.read_as(path)
    }

    /// Typed variant of [`read`](Self::read).
    pub fn read_as<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        read_bytes(path)?
            .map(|raw| parse_document(path, &raw))
            .transpose()
    }

    /// Replace the document under its lock.
    pub fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let mut guard = self.lock_for(path).acquire()?;
        let result = write_json_unlocked(path, value);
        guard.release();
        result
    }

    /// Read, transform, and write back inside one lock acquisition.
    ///
    /// `f` receives `None` when the document does not exist yet. A corrupt
    /// document aborts the update before `f` runs.
    pub fn update<F>(&self, path: &Path, f: F) -> Result<Value>
    where
        F: FnOnce(Option<Value>) -> Result<Value>,
    {
        let mut guard = self.lock_for(path).acquire()?;
        let result = (|| {
            let current = self.read(path)?;
            let next = f(current)?;
            write_json_unlocked(path, &next)?;
            Ok(next)
        })();
        guard.release();
        result
    }

    /// Typed read/modify/write inside one lock acquisition.
    ///
    /// A missing document starts from `T::default()`. The file is rewritten
    /// only when `f` actually changed the value; an `Err` from `f` leaves the
    /// document untouched.
    pub fn update_as<T, R, F>(&self, path: &Path, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default + Clone + PartialEq,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let mut guard = self.lock_for(path).acquire()?;
        let result = (|| {
            let existing: Option<T> = self.read_as(path)?;
            let existed = existing.is_some();
            let before = existing.unwrap_or_default();
            let mut doc = before.clone();
            let out = f(&mut doc)?;
            let changed = if existed {
                doc != before
            } else {
                doc != T::default()
            };
            if changed {
                write_json_unlocked(path, &doc)?;
            }
            Ok(out)
        })();
        guard.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn store() -> DocumentStore {
        DocumentStore::default()
    }

    #[test]
    fn test_read_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(store().read(&tmp.path().join("nope.json")).unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sub/doc.json");
        let value = json!({"b": 1, "a": [true, null, "x"]});
        store().write(&path, &value).unwrap();
        assert_eq!(store().read(&path).unwrap(), Some(value));
    }

    #[test]
    fn test_corrupt_document_is_distinct_from_missing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, b"{\"half\": ").unwrap();
        let err = store().read(&path).unwrap_err();
        match err {
            Error::CorruptDocument { len, preview, .. } => {
                assert_eq!(len, 9);
                assert!(preview.starts_with("{\"half\""));
            }
            other => panic!("expected CorruptDocument, got {other:?}"),
        }
    }

    #[test]
    fn test_update_on_corrupt_document_does_not_run_closure() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, b"not json").unwrap();
        let mut ran = false;
        let err = store()
            .update(&path, |_| {
                ran = true;
                Ok(json!({}))
            })
            .unwrap_err();
        assert!(matches!(err, Error::CorruptDocument { .. }));
        assert!(!ran);
        assert_eq!(fs::read(&path).unwrap(), b"not json");
    }

    #[test]
    fn test_update_sees_none_then_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("counter.json");
        for _ in 0..3 {
            store()
                .update(&path, |cur| {
                    let n = cur.and_then(|v| v.as_u64()).unwrap_or(0);
                    Ok(json!(n + 1))
                })
                .unwrap();
        }
        assert_eq!(store().read(&path).unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_update_as_skips_write_when_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("list.json");
        let n: usize = store().update_as(&path, |v: &mut Vec<u32>| Ok(v.len())).unwrap();
        assert_eq!(n, 0);
        assert!(!path.exists(), "no-op update must not create the file");

        store().update_as(&path, |v: &mut Vec<u32>| {
            v.push(7);
            Ok(())
        })
        .unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store().update_as(&path, |_: &mut Vec<u32>| Ok(())).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_update_as_error_leaves_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("list.json");
        store().write(&path, &vec![1, 2, 3]).unwrap();
        let err = store()
            .update_as(&path, |v: &mut Vec<u32>| -> Result<()> {
                v.clear();
                Err(Error::Validation("rejected".into()))
            })
            .unwrap_err();
        assert_eq!(err.error_type(), "VALIDATION_ERROR");
        assert_eq!(store().read_as::<Vec<u32>>(&path).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_interrupted_write_leaves_original_valid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        store().write(&path, &json!({"v": 1})).unwrap();

        // A writer that died after creating its temp file but before rename.
        let orphan = temp_path_for(&path);
        fs::write(&orphan, b"{\"v\": 2, \"trunc").unwrap();
        assert_eq!(store().read(&path).unwrap(), Some(json!({"v": 1})));

        // Serialization failure happens before any temp file is created.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        assert!(store().write(&path, &bad).is_err());
        assert_eq!(store().read(&path).unwrap(), Some(json!({"v": 1})));

        // And a later writer is unaffected by the orphan.
        store().write(&path, &json!({"v": 3})).unwrap();
        assert_eq!(store().read(&path).unwrap(), Some(json!({"v": 3})));
    }

    #[test]
    fn test_no_temp_files_left_after_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        for i in 0..5 {
            store().write(&path, &json!(i)).unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
