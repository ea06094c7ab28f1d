//! Evaluation reports and metrics snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keys owned by [`MetricsSnapshot`] itself; never stored in `extra`.
const RESERVED_KEYS: [&str; 2] = ["accuracy", "accuracy_gain"];

#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("accuracy {0} is outside [0, 1]")]
    AccuracyOutOfRange(f64),
    #[error("non-finite metric value for {0}")]
    NonFinite(&'static str),
}

/// What the sandbox evaluator reports for one draft.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy_gain: f64,
    /// Supplemental evaluator-reported numbers, passed through opaquely.
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

/// Performance snapshot of a draft or of the accepted baseline.
///
/// Immutable once built; the baseline is replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub accuracy: f64,
    #[serde(default)]
    pub accuracy_gain: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn new(
        accuracy: f64,
        accuracy_gain: f64,
        extra: BTreeMap<String, f64>,
    ) -> Result<Self, MetricsError> {
        if !accuracy.is_finite() {
            return Err(MetricsError::NonFinite("accuracy"));
        }
        if !accuracy_gain.is_finite() {
            return Err(MetricsError::NonFinite("accuracy_gain"));
        }
        if !(0.0..=1.0).contains(&accuracy) {
            return Err(MetricsError::AccuracyOutOfRange(accuracy));
        }
        Ok(Self {
            accuracy,
            accuracy_gain,
            extra: strip_reserved(extra),
        })
    }

    /// A bare baseline record.
    pub fn baseline(accuracy: f64) -> Result<Self, MetricsError> {
        Self::new(accuracy, 0.0, BTreeMap::new())
    }

    /// Candidate metrics for a draft measured against `baseline`.
    ///
    /// The candidate accuracy is clamped into `[0, 1]` and the stored gain is
    /// recomputed from the two accuracies rather than copied from the report.
    pub fn candidate(baseline: f64, report: &EvaluationReport) -> Result<Self, MetricsError> {
        if !report.accuracy_gain.is_finite() {
            return Err(MetricsError::NonFinite("accuracy_gain"));
        }
        let baseline = if baseline.is_finite() {
            baseline.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let accuracy = (baseline + report.accuracy_gain).clamp(0.0, 1.0);
        Self::new(accuracy, accuracy - baseline, report.extra.clone())
    }

    /// Gain relative to `baseline`, recomputed from stored values.
    pub fn gain_over(&self, baseline: f64) -> f64 {
        self.accuracy - baseline
    }
}

fn strip_reserved(mut extra: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    for key in RESERVED_KEYS {
        extra.remove(key);
    }
    extra.retain(|_, v| v.is_finite());
    extra
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(gain: f64) -> EvaluationReport {
        EvaluationReport {
            accuracy_gain: gain,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn candidate_adds_gain_to_baseline() {
        let c = MetricsSnapshot::candidate(0.60, &report(0.03)).unwrap();
        assert!((c.accuracy - 0.63).abs() < 1e-12);
        assert!((c.accuracy_gain - 0.03).abs() < 1e-12);
    }

    #[test]
    fn candidate_is_clamped_and_gain_recomputed() {
        let c = MetricsSnapshot::candidate(0.98, &report(0.10)).unwrap();
        assert_eq!(c.accuracy, 1.0);
        assert!((c.accuracy_gain - 0.02).abs() < 1e-12);

        let c = MetricsSnapshot::candidate(0.05, &report(-0.50)).unwrap();
        assert_eq!(c.accuracy, 0.0);
        assert!((c.accuracy_gain + 0.05).abs() < 1e-12);
    }

    #[test]
    fn non_finite_gain_is_rejected() {
        assert_eq!(
            MetricsSnapshot::candidate(0.5, &report(f64::NAN)),
            Err(MetricsError::NonFinite("accuracy_gain"))
        );
    }

    #[test]
    fn out_of_range_accuracy_is_rejected() {
        assert_eq!(
            MetricsSnapshot::baseline(1.5),
            Err(MetricsError::AccuracyOutOfRange(1.5))
        );
    }

    #[test]
    fn extra_fields_flatten_into_json() {
        let mut extra = BTreeMap::new();
        extra.insert("win_rate".to_string(), 0.55);
        extra.insert("accuracy".to_string(), 0.99);
        let snap = MetricsSnapshot::new(0.61, 0.01, extra).unwrap();

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["accuracy"], 0.61);
        assert_eq!(json["win_rate"], 0.55);

        let back: MetricsSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn legacy_record_without_gain_parses() {
        let snap: MetricsSnapshot = serde_json::from_str(r#"{"accuracy": 0.6}"#).unwrap();
        assert_eq!(snap.accuracy, 0.6);
        assert_eq!(snap.accuracy_gain, 0.0);
        assert!(snap.extra.is_empty());
    }
}
