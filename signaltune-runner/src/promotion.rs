//! Promotion manager: the only writer of the production artifact.
//!
//! Every promotion runs under one gate: back up current production, write
//! the new version file, swap production atomically, then index the
//! version. A failed backup aborts before production is touched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use signaltune_core::metrics::MetricsSnapshot;
use signaltune_core::params::StrategyModule;
use signaltune_core::store::versions::file_stem;
use signaltune_core::store::{
    content_hash, version_stamp, write_atomic, Draft, MetricsStore, StoreError, VersionRecord,
    VersionStore,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("backup of current production failed, production untouched: {0}")]
    Backup(#[source] StoreError),
    #[error("writing version snapshot failed, production untouched: {0}")]
    Version(#[source] StoreError),
    #[error("replacing production failed: {0}")]
    Production(#[source] StoreError),
    #[error("no version or backup named {0}")]
    UnknownVersion(String),
    #[error("draft content no longer matches its hash {expected}, refusing to promote")]
    Integrity { expected: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct PromotionManager {
    production_path: PathBuf,
    versions: VersionStore,
    metrics: MetricsStore,
    gate: Mutex<()>,
}

impl PromotionManager {
    pub fn new(production_path: impl Into<PathBuf>, versions: VersionStore, metrics: MetricsStore) -> Self {
        Self {
            production_path: production_path.into(),
            versions,
            metrics,
            gate: Mutex::new(()),
        }
    }

    pub fn production_path(&self) -> &Path {
        &self.production_path
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    /// Current production content, if any.
    pub fn production(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.production_path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.production_path, e)),
        }
    }

    /// Current production parsed as a parameter table.
    pub fn production_module(&self) -> Result<Option<StrategyModule>, StoreError> {
        match self.production()? {
            Some(text) => Ok(Some(StrategyModule::parse(&text)?)),
            None => Ok(None),
        }
    }

    /// Write `default` as production when none exists yet.
    pub fn bootstrap_production(&self, default: &StrategyModule) -> Result<bool, PromotionError> {
        let _gate = self.lock();
        if self.production_path.exists() {
            return Ok(false);
        }
        let text = default.render().map_err(StoreError::from)?;
        write_atomic(&self.production_path, text.as_bytes()).map_err(PromotionError::Production)?;
        info!(path = %self.production_path.display(), "wrote initial production module");
        Ok(true)
    }

    /// Promote a draft to production.
    pub fn promote(&self, draft: &Draft) -> Result<VersionRecord, PromotionError> {
        verify(draft)?;
        let _gate = self.lock();
        self.promote_locked(&draft.content, draft.provenance.clone())
    }

    /// Promote a draft and make `candidate` the new baseline.
    ///
    /// Once production has switched, a failed baseline write is logged but
    /// not returned: the promotion itself happened and must not be retried.
    pub fn adopt(&self, draft: &Draft, candidate: &MetricsSnapshot) -> Result<VersionRecord, PromotionError> {
        verify(draft)?;
        let _gate = self.lock();
        let record = self.promote_locked(&draft.content, draft.provenance.clone())?;
        if let Err(e) = self.metrics.save(candidate) {
            error!(
                version = %record.version_id,
                error = %e,
                "production promoted but baseline metrics were not saved"
            );
        }
        Ok(record)
    }

    /// Restore a stored version or backup through the normal promotion path.
    /// The baseline metrics are left as they are.
    pub fn rollback(&self, target: &str) -> Result<VersionRecord, PromotionError> {
        let _gate = self.lock();
        let path = match self.versions.resolve(target) {
            Ok(path) => path,
            Err(StoreError::NotFound(_)) => return Err(PromotionError::UnknownVersion(target.to_string())),
            Err(e) => return Err(e.into()),
        };
        let content = self.versions.read_content(&path)?;
        let record = self.promote_locked(&content, Some(format!("rollback to {target}")))?;
        info!(target, version = %record.version_id, "rolled back production");
        Ok(record)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn promote_locked(&self, content: &str, provenance: Option<String>) -> Result<VersionRecord, PromotionError> {
        let now = Utc::now();
        let stamp = version_stamp(now);

        let backup = match self.production().map_err(PromotionError::Backup)? {
            Some(current) => Some(
                self.versions
                    .write_backup(current.as_bytes(), &stamp)
                    .map_err(PromotionError::Backup)?,
            ),
            None => None,
        };

        let path = self
            .versions
            .write_version(content.as_bytes(), &stamp)
            .map_err(PromotionError::Version)?;

        write_atomic(&self.production_path, content.as_bytes()).map_err(PromotionError::Production)?;

        let record = VersionRecord {
            version_id: file_stem(&path).unwrap_or_else(|| format!("v{stamp}")),
            created_at: now,
            path,
            backup,
            content_hash: content_hash(content),
            provenance,
        };
        if let Err(e) = self.versions.append_record(&record) {
            warn!(version = %record.version_id, error = %e, "version index append failed");
        }

        info!(
            version = %record.version_id,
            backup = ?record.backup.as_ref().map(|p| p.display().to_string()),
            "promoted to production"
        );
        Ok(record)
    }
}

/// The content about to be promoted must be the content that was hashed,
/// and so evaluated.
fn verify(draft: &Draft) -> Result<(), PromotionError> {
    if content_hash(&draft.content) == draft.content_hash {
        Ok(())
    } else {
        Err(PromotionError::Integrity {
            expected: draft.content_hash.clone(),
        })
    }
}
