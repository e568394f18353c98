use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counters for one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunMetrics {
    pub cases_total: u64,
    pub cases_success: u64,
    pub cases_failed: u64,
    /// Wall-clock seconds spent per stage, summed over cases
    pub stage_seconds: HashMap<String, f64>,
    pub custom: HashMap<String, f64>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a case that reached the end of the pipeline
    pub fn record_success(&mut self) {
        self.cases_total += 1;
        self.cases_success += 1;
    }

    /// Record a case that stopped with an error
    pub fn record_failure(&mut self) {
        self.cases_total += 1;
        self.cases_failed += 1;
    }

    pub fn record_stage(&mut self, stage: impl Into<String>, seconds: f64) {
        *self.stage_seconds.entry(stage.into()).or_insert(0.0) += seconds;
    }

    /// Set a custom metric
    pub fn set_custom(&mut self, key: impl Into<String>, value: f64) {
        self.custom.insert(key.into(), value);
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.cases_total == 0 {
            return 100.0;
        }
        (self.cases_success as f64 / self.cases_total as f64) * 100.0
    }

    /// Fold another run's counters into this one
    pub fn merge(&mut self, other: &RunMetrics) {
        self.cases_total += other.cases_total;
        self.cases_success += other.cases_success;
        self.cases_failed += other.cases_failed;
        for (stage, secs) in &other.stage_seconds {
            self.record_stage(stage.clone(), *secs);
        }
        for (key, value) in &other.custom {
            self.custom.insert(key.clone(), *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = RunMetrics::new();
        assert_eq!(metrics.cases_total, 0);
        assert_eq!(metrics.cases_success, 0);
        assert_eq!(metrics.cases_failed, 0);
        assert!(metrics.stage_seconds.is_empty());
        assert!(metrics.custom.is_empty());
    }

    #[test]
    fn test_record_mixed() {
        let mut metrics = RunMetrics::new();
        metrics.record_success();
        metrics.record_success();
        metrics.record_failure();
        metrics.record_success();

        assert_eq!(metrics.cases_total, 4);
        assert_eq!(metrics.cases_success, 3);
        assert_eq!(metrics.cases_failed, 1);
    }

    #[test]
    fn test_success_rate_zero_cases() {
        let metrics = RunMetrics::new();
        assert_eq!(metrics.success_rate(), 100.0);
    }

    #[test]
    fn test_success_rate_all_failures() {
        let mut metrics = RunMetrics::new();
        metrics.record_failure();
        metrics.record_failure();
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut metrics = RunMetrics::new();
        metrics.record_success();
        metrics.record_success();
        metrics.record_failure();
        metrics.record_success();
        // 3 of 4
        assert_eq!(metrics.success_rate(), 75.0);
    }

    #[test]
    fn test_record_stage_accumulates() {
        let mut metrics = RunMetrics::new();
        metrics.record_stage("mesh", 1.5);
        metrics.record_stage("mesh", 2.0);
        metrics.record_stage("post", 0.25);
        assert_eq!(metrics.stage_seconds.get("mesh"), Some(&3.5));
        assert_eq!(metrics.stage_seconds.get("post"), Some(&0.25));
    }

    #[test]
    fn test_set_custom_metric_overwrite() {
        let mut metrics = RunMetrics::new();
        metrics.set_custom("max_l_over_d", 100.0);
        metrics.set_custom("max_l_over_d", 120.0);

        assert_eq!(metrics.custom.len(), 1);
        assert_eq!(metrics.custom.get("max_l_over_d"), Some(&120.0));
    }

    #[test]
    fn test_merge() {
        let mut a = RunMetrics::new();
        a.record_success();
        a.record_stage("mesh", 1.0);
        let mut b = RunMetrics::new();
        b.record_failure();
        b.record_stage("mesh", 2.0);
        b.set_custom("cl_max", 1.4);

        a.merge(&b);
        assert_eq!(a.cases_total, 2);
        assert_eq!(a.cases_failed, 1);
        assert_eq!(a.stage_seconds.get("mesh"), Some(&3.0));
        assert_eq!(a.custom.get("cl_max"), Some(&1.4));
    }

    #[test]
    fn test_metrics_serialization() {
        let mut metrics = RunMetrics::new();
        metrics.record_success();
        metrics.record_failure();
        metrics.set_custom("test_metric", 123.45);

        let json = serde_json::to_string(&metrics).unwrap();
        let deserialized: RunMetrics = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.cases_total, 2);
        assert_eq!(deserialized.cases_success, 1);
        assert_eq!(deserialized.custom.get("test_metric"), Some(&123.45));
    }
}
