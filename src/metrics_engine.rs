use ahash::AHashMap;
use log::info;

use crate::executor::ParallelExecutor;
use crate::metrics::{registry, Metric};

/// Evaluation settings shared by both trainers.
#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    /// How many test users to sample for averaged metrics; 0 means all.
    pub num_test_users: usize,
    /// Compute averaged metrics after every epoch instead of only the last.
    pub always_compute: bool,
    /// PRNG seed for sampling the test-user subset.
    pub seed: i32,
}

/// Records named time-series of metric values per epoch.
///
/// Metric names are accepted only if the registry knows them; recorded
/// points land under `<prefix><metric>` keys (`train_`, `test_`,
/// `train_avg_`, `test_avg_`).
pub struct MetricsEngine {
    config: MetricsConfig,
    log_records: bool,
    train_metrics: Vec<String>,
    test_metrics: Vec<String>,
    train_avg_metrics: Vec<String>,
    test_avg_metrics: Vec<String>,
    metrics_map: AHashMap<String, Vec<(usize, f64)>>,
}

impl MetricsEngine {
    pub fn new(config: MetricsConfig) -> Self {
        Self::with_logging(config, true)
    }

    pub fn with_logging(config: MetricsConfig, log_records: bool) -> Self {
        MetricsEngine {
            config,
            log_records,
            train_metrics: Vec::new(),
            test_metrics: Vec::new(),
            train_avg_metrics: Vec::new(),
            test_avg_metrics: Vec::new(),
            metrics_map: AHashMap::new(),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn add_train_metric(&mut self, name: &str) -> bool {
        add_metric(&mut self.train_metrics, name)
    }

    pub fn add_test_metric(&mut self, name: &str) -> bool {
        add_metric(&mut self.test_metrics, name)
    }

    pub fn add_train_avg_metric(&mut self, name: &str) -> bool {
        add_metric(&mut self.train_avg_metrics, name)
    }

    pub fn add_test_avg_metric(&mut self, name: &str) -> bool {
        add_metric(&mut self.test_avg_metrics, name)
    }

    pub fn train_metrics(&self) -> &[String] {
        &self.train_metrics
    }

    pub fn test_metrics(&self) -> &[String] {
        &self.test_metrics
    }

    pub fn train_avg_metrics(&self) -> &[String] {
        &self.train_avg_metrics
    }

    pub fn test_avg_metrics(&self) -> &[String] {
        &self.test_avg_metrics
    }

    pub fn compute_and_record_train_metrics(
        &mut self,
        epoch: usize,
        labels: &[f64],
        scores: &[f64],
    ) {
        compute_and_record(
            &mut self.metrics_map,
            self.log_records,
            &self.train_metrics,
            "train_",
            epoch,
            |m| m.compute(labels, scores),
        );
    }

    pub fn compute_and_record_test_metrics(
        &mut self,
        epoch: usize,
        labels: &[f64],
        scores: &[f64],
    ) {
        compute_and_record(
            &mut self.metrics_map,
            self.log_records,
            &self.test_metrics,
            "test_",
            epoch,
            |m| m.compute(labels, scores),
        );
    }

    pub fn compute_and_record_train_avg_metrics(
        &mut self,
        epoch: usize,
        labels: &[Vec<f64>],
        scores: &[Vec<f64>],
        parallel: &ParallelExecutor,
    ) {
        compute_and_record(
            &mut self.metrics_map,
            self.log_records,
            &self.train_avg_metrics,
            "train_avg_",
            epoch,
            |m| m.compute_avg_parallel(labels, scores, parallel),
        );
    }

    pub fn compute_and_record_test_avg_metrics(
        &mut self,
        epoch: usize,
        labels: &[Vec<f64>],
        scores: &[Vec<f64>],
        parallel: &ParallelExecutor,
    ) {
        compute_and_record(
            &mut self.metrics_map,
            self.log_records,
            &self.test_avg_metrics,
            "test_avg_",
            epoch,
            |m| m.compute_avg_parallel(labels, scores, parallel),
        );
    }

    /// Recorded `(epoch, value)` points for a full key like `test_avg_auc`.
    pub fn metric_series(&self, key: &str) -> Option<&[(usize, f64)]> {
        self.metrics_map.get(key).map(|series| series.as_slice())
    }
}

fn add_metric(metrics: &mut Vec<String>, name: &str) -> bool {
    if registry().exists(name) {
        metrics.push(name.to_string());
        true
    } else {
        false
    }
}

fn compute_and_record(
    metrics_map: &mut AHashMap<String, Vec<(usize, f64)>>,
    log_records: bool,
    names: &[String],
    prefix: &str,
    epoch: usize,
    compute: impl Fn(&dyn Metric) -> f64,
) {
    for name in names {
        let metric = registry()
            .get(name)
            .unwrap_or_else(|| panic!("missing metric {prefix}{name}"));
        let value = compute(metric.as_ref());
        let key = format!("{prefix}{name}");
        if log_records {
            info!("epoch {epoch}: recorded metric {key} = {value}");
        }
        metrics_map.entry(key).or_default().push((epoch, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_gates_on_registry_membership() {
        let mut engine = MetricsEngine::with_logging(MetricsConfig::default(), false);
        assert!(engine.add_test_avg_metric("auc"));
        assert!(engine.add_test_avg_metric("p@5"));
        assert!(!engine.add_test_avg_metric("nope"));
        assert!(!engine.add_test_avg_metric("p@"));
        assert_eq!(engine.test_avg_metrics(), ["auc", "p@5"]);
        assert!(engine.train_metrics().is_empty());
    }

    #[test]
    fn records_series_under_prefixed_keys() {
        let mut engine = MetricsEngine::with_logging(MetricsConfig::default(), false);
        assert!(engine.add_train_metric("mse"));
        engine.compute_and_record_train_metrics(1, &[1.0, 0.0], &[0.5, 0.5]);
        engine.compute_and_record_train_metrics(2, &[1.0, 0.0], &[1.0, 0.0]);

        let series = engine.metric_series("train_mse").unwrap();
        assert_eq!(series, &[(1, 0.25), (2, 0.0)]);
        assert!(engine.metric_series("test_mse").is_none());
    }

    #[test]
    fn records_averaged_metrics() {
        let parallel = ParallelExecutor::new(2);
        let mut engine = MetricsEngine::with_logging(MetricsConfig::default(), false);
        assert!(engine.add_test_avg_metric("auc"));

        let labels = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let scores = vec![vec![3.0, 2.0], vec![3.0, 2.0]];
        engine.compute_and_record_test_avg_metrics(7, &labels, &scores, &parallel);

        let series = engine.metric_series("test_avg_auc").unwrap();
        assert_eq!(series, &[(7, 0.5)]);
    }
}
