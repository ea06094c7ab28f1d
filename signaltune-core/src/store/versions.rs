//! Version store: append-only directory of promoted snapshots and backups.
//!
//! Layout under the versions directory:
//! - `backup_<stamp>.toml`: production content captured right before an overwrite
//! - `v<stamp>.toml`: the promoted content
//! - `versions.jsonl`: one [`VersionRecord`] per line
//!
//! Files are created with create-new semantics; a name collision gets a
//! `-N` suffix, so nothing in this directory is ever overwritten.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::draft::{content_hash, Draft};
use super::StoreError;

const INDEX_FILE: &str = "versions.jsonl";
const BACKUP_PREFIX: &str = "backup_";
const VERSION_PREFIX: &str = "v";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Timestamp fragment used in snapshot file names.
pub fn version_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// A promoted snapshot of production. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Backup of the content this version replaced (none for the first promotion).
    pub backup: Option<PathBuf>,
    pub content_hash: String,
    #[serde(default)]
    pub provenance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VersionStore {
    dir: PathBuf,
}

impl VersionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_backup(&self, bytes: &[u8], stamp: &str) -> Result<PathBuf, StoreError> {
        self.create_unique(BACKUP_PREFIX, stamp, bytes)
    }

    pub fn write_version(&self, bytes: &[u8], stamp: &str) -> Result<PathBuf, StoreError> {
        self.create_unique(VERSION_PREFIX, stamp, bytes)
    }

    fn create_unique(&self, prefix: &str, stamp: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{prefix}{stamp}.toml")
            } else {
                format!("{prefix}{stamp}-{attempt}.toml")
            };
            let path = self.dir.join(name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            file.write_all(bytes).map_err(|e| StoreError::io(&path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&path, e))?;
            return Ok(path);
        }
    }

    /// Append a record to the index.
    pub fn append_record(&self, record: &VersionRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let json = serde_json::to_string(record)?;
        let path = self.index_path();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        writeln!(file, "{json}").map_err(|e| StoreError::io(&path, e))?;
        file.flush().map_err(|e| StoreError::io(&path, e))
    }

    /// All records in promotion order. Malformed lines are skipped.
    ///
    /// Version files that never made it into the index (an append failed
    /// after production was already replaced) are recovered from the
    /// directory and merged in by creation time.
    pub fn list(&self) -> Result<Vec<VersionRecord>, StoreError> {
        let mut records = self.read_index()?;
        let recovered = self.unindexed_versions(&records)?;
        if !recovered.is_empty() {
            records.extend(recovered);
            records.sort_by_key(|r| r.created_at);
        }
        Ok(records)
    }

    fn read_index(&self) -> Result<Vec<VersionRecord>, StoreError> {
        let path = self.index_path();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut records = Vec::new();
        for (lineno, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<VersionRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed version record"),
            }
        }
        Ok(records)
    }

    /// `v<stamp>.toml` files with no index record, oldest first.
    fn unindexed_versions(&self, indexed: &[VersionRecord]) -> Result<Vec<VersionRecord>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let known: HashSet<&str> = indexed.iter().map(|r| r.version_id.as_str()).collect();
        let mut recovered = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
            let Some(stem) = file_stem(&path) else {
                continue;
            };
            let is_version = stem.starts_with(VERSION_PREFIX)
                && path.extension().is_some_and(|ext| ext == "toml");
            if !is_version || known.contains(stem.as_str()) {
                continue;
            }

            let content = self.read_content(&path)?;
            let stamp = &stem[VERSION_PREFIX.len()..];
            let created_at = parse_stamp(stamp).unwrap_or_else(|| modified_at(&path));
            let backup = self.dir.join(format!("{BACKUP_PREFIX}{stamp}.toml"));
            warn!(version = %stem, "version file missing from index, recovered from directory");
            recovered.push(VersionRecord {
                version_id: stem,
                created_at,
                backup: backup.is_file().then_some(backup),
                content_hash: content_hash(&content),
                provenance: Draft::from_content(content).provenance,
                path,
            });
        }
        recovered.sort_by_key(|r| r.created_at);
        Ok(recovered)
    }

    pub fn get(&self, version_id: &str) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.version_id == version_id))
    }

    pub fn latest(&self) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self.list()?.pop())
    }

    /// Resolve a version id or a backup file stem to a snapshot path.
    pub fn resolve(&self, id: &str) -> Result<PathBuf, StoreError> {
        for record in self.list()? {
            if record.version_id == id {
                return Ok(record.path);
            }
            if let Some(backup) = &record.backup {
                if file_stem(backup).as_deref() == Some(id) {
                    return Ok(backup.clone());
                }
            }
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    pub fn read_content(&self, path: &Path) -> Result<String, StoreError> {
        fs::read_to_string(path).map_err(|e| StoreError::io(path, e))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

/// File stem of a snapshot path, used as its identifier.
pub fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Inverse of [`version_stamp`], ignoring a `-N` collision suffix.
fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let base = stamp.split('-').next()?;
    NaiveDateTime::parse_from_str(base, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn modified_at(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(store: &VersionStore, stamp: &str, backup: Option<PathBuf>) -> VersionRecord {
        let path = store.write_version(b"v", stamp).unwrap();
        VersionRecord {
            version_id: file_stem(&path).unwrap(),
            created_at: Utc::now(),
            path,
            backup,
            content_hash: "h".into(),
            provenance: None,
        }
    }

    #[test]
    fn colliding_stamps_never_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path().join("versions"));

        let a = store.write_version(b"first", "20240101_000000_000000").unwrap();
        let b = store.write_version(b"second", "20240101_000000_000000").unwrap();

        assert_ne!(a, b);
        assert_eq!(fs::read_to_string(&a).unwrap(), "first");
        assert_eq!(fs::read_to_string(&b).unwrap(), "second");
        assert!(b.to_string_lossy().ends_with("-1.toml"));
    }

    #[test]
    fn index_roundtrip_and_latest() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());

        assert!(store.latest().unwrap().is_none());
        let first = record(&store, "20240101_000000_000001", None);
        let second = record(&store, "20240101_000000_000002", None);
        store.append_record(&first).unwrap();
        store.append_record(&second).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.latest().unwrap().unwrap(), second);
        assert_eq!(store.get(&first.version_id).unwrap().unwrap(), first);
    }

    #[test]
    fn malformed_index_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());
        let rec = record(&store, "20240101_000000_000001", None);
        store.append_record(&rec).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(tmp.path().join(INDEX_FILE))
            .unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn unindexed_version_files_are_recovered() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());
        let mut indexed = record(&store, "20240101_000000_000001", None);
        indexed.created_at = parse_stamp("20240101_000000_000001").unwrap();
        store.append_record(&indexed).unwrap();

        // Promotion wrote its files but the index append never happened.
        let backup = store.write_backup(b"v", "20240102_000000_000000").unwrap();
        let orphan = store.write_version(b"b = 2\n", "20240102_000000_000000").unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], indexed);
        let recovered = &all[1];
        assert_eq!(recovered.version_id, "v20240102_000000_000000");
        assert_eq!(recovered.path, orphan);
        assert_eq!(recovered.backup.as_ref(), Some(&backup));
        assert_eq!(recovered.content_hash, content_hash("b = 2\n"));

        assert_eq!(store.latest().unwrap().unwrap().version_id, recovered.version_id);
        assert_eq!(store.resolve("v20240102_000000_000000").unwrap(), orphan);
        assert_eq!(store.resolve("backup_20240102_000000_000000").unwrap(), backup);
    }

    #[test]
    fn stamps_parse_back_to_time() {
        let at = Utc::now();
        let parsed = parse_stamp(&version_stamp(at)).unwrap();
        assert_eq!(parsed.timestamp_micros(), at.timestamp_micros());
        assert_eq!(parse_stamp("20240101_000000_000000-3").unwrap().timestamp(), 1704067200);
        assert!(parse_stamp("garbage").is_none());
    }

    #[test]
    fn resolve_finds_versions_and_backups() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());
        let backup = store.write_backup(b"old", "20240101_000000_000001").unwrap();
        let rec = record(&store, "20240101_000000_000001", Some(backup.clone()));
        store.append_record(&rec).unwrap();

        assert_eq!(store.resolve(&rec.version_id).unwrap(), rec.path);
        assert_eq!(store.resolve("backup_20240101_000000_000001").unwrap(), backup);
        assert!(matches!(
            store.resolve("v19990101"),
            Err(StoreError::NotFound(_))
        ));
    }
}
