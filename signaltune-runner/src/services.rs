//! Shared handles used by both the loop and the callback path.

use std::sync::Arc;

use signaltune_core::config::TunerConfig;
use signaltune_core::store::{DraftSlot, MetricsStore, VersionStore};

use crate::learning_log::LearningLog;
use crate::notifier::{notifier_from_config, send_notification, Notifier, NotifyError};
use crate::promotion::PromotionManager;

#[derive(Clone)]
pub struct TunerServices {
    pub promoter: Arc<PromotionManager>,
    pub notifier: Arc<dyn Notifier>,
    pub draft_slot: DraftSlot,
    pub log: LearningLog,
}

impl TunerServices {
    pub fn new(
        promoter: Arc<PromotionManager>,
        notifier: Arc<dyn Notifier>,
        draft_slot: DraftSlot,
        log: LearningLog,
    ) -> Self {
        Self {
            promoter,
            notifier,
            draft_slot,
            log,
        }
    }

    /// Wire stores and the configured notifier from `config.paths`.
    pub fn from_config(config: &TunerConfig) -> Result<Self, NotifyError> {
        let paths = &config.paths;
        let promoter = PromotionManager::new(
            paths.production_path(),
            VersionStore::new(paths.versions_path()),
            MetricsStore::new(paths.metrics_path()),
        );
        Ok(Self::new(
            Arc::new(promoter),
            notifier_from_config(&config.notifier)?,
            DraftSlot::new(paths.draft_path()),
            LearningLog::new(paths.learning_log_path()),
        ))
    }

    pub fn notify(&self, text: &str) {
        send_notification(self.notifier.as_ref(), text);
    }
}
