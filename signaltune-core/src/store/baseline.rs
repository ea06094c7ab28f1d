//! Metrics store: the single current-baseline record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{write_atomic, StoreError};
use crate::metrics::MetricsSnapshot;

#[derive(Debug, Clone)]
pub struct MetricsStore {
    path: PathBuf,
}

impl MetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current baseline, if any.
    ///
    /// A missing file is "no baseline". An unreadable or unparseable file is
    /// treated the same way, with a warning.
    pub fn load(&self) -> Option<MetricsSnapshot> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read baseline metrics");
                return None;
            }
        };

        match serde_json::from_str::<MetricsSnapshot>(&text) {
            Ok(snapshot) if snapshot.accuracy.is_finite() && (0.0..=1.0).contains(&snapshot.accuracy) => {
                Some(snapshot)
            }
            Ok(snapshot) => {
                warn!(accuracy = snapshot.accuracy, "baseline accuracy out of range, ignoring it");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt baseline metrics, ignoring it");
                None
            }
        }
    }

    /// Baseline accuracy, or 0.0 when no usable baseline exists.
    pub fn baseline_accuracy(&self) -> f64 {
        self.load().map_or(0.0, |m| m.accuracy)
    }

    /// Replace the baseline wholesale.
    pub fn save(&self, snapshot: &MetricsSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_zero_baseline() {
        let tmp = TempDir::new().unwrap();
        let store = MetricsStore::new(tmp.path().join("current_metrics.json"));
        assert!(store.load().is_none());
        assert_eq!(store.baseline_accuracy(), 0.0);
    }

    #[test]
    fn corrupt_file_means_zero_baseline() {
        let tmp = TempDir::new().unwrap();
        let store = MetricsStore::new(tmp.path().join("current_metrics.json"));
        fs::write(store.path(), "{ accuracy: oops").unwrap();
        assert_eq!(store.baseline_accuracy(), 0.0);

        fs::write(store.path(), r#"{"accuracy": 7.5}"#).unwrap();
        assert_eq!(store.baseline_accuracy(), 0.0);
    }

    #[test]
    fn save_overwrites_previous_baseline() {
        let tmp = TempDir::new().unwrap();
        let store = MetricsStore::new(tmp.path().join("current_metrics.json"));

        store.save(&MetricsSnapshot::baseline(0.60).unwrap()).unwrap();
        store.save(&MetricsSnapshot::baseline(0.63).unwrap()).unwrap();

        assert_eq!(store.baseline_accuracy(), 0.63);
    }
}
