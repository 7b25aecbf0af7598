use std::cmp::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashMap;
use log::error;

use crate::executor::ParallelExecutor;

/// A ranking or regression metric over matched `labels`/`scores` vectors
/// (per user: one label and one score per item; a label `> 0` marks a
/// relevant item).
pub trait Metric: Send + Sync {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64;

    /// Arithmetic mean of the per-user metric.
    fn compute_avg(&self, labels: &[Vec<f64>], scores: &[Vec<f64>]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        assert!(!labels.is_empty());
        let sum: f64 = labels
            .iter()
            .zip(scores)
            .map(|(l, s)| self.compute(l, s))
            .sum();
        sum / labels.len() as f64
    }

    /// Same as [`Metric::compute_avg`], one user per task.
    fn compute_avg_parallel(
        &self,
        labels: &[Vec<f64>],
        scores: &[Vec<f64>],
        parallel: &ParallelExecutor,
    ) -> f64 {
        assert_eq!(labels.len(), scores.len());
        assert!(!labels.is_empty());
        let total = parallel.map_reduce(
            labels.len(),
            |task_id| self.compute(&labels[task_id], &scores[task_id]),
            |a, b| a + b,
            0.0,
        );
        total / labels.len() as f64
    }
}

/// Pairs every score with its relevance flag, ordered by descending score;
/// relevant items win score ties.
fn rank_by_score(labels: &[f64], scores: &[f64]) -> Vec<(f64, bool)> {
    let mut ranked: Vec<(f64, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&s, &l)| (s, l > 0.0))
        .collect();
    ranked.sort_by(descending);
    ranked
}

fn descending(a: &(f64, bool), b: &(f64, bool)) -> Ordering {
    b.partial_cmp(a).unwrap_or(Ordering::Equal)
}

pub struct MeanSquaredError;

impl Metric for MeanSquaredError {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        assert!(!labels.is_empty());
        let sum: f64 = labels
            .iter()
            .zip(scores)
            .map(|(l, s)| (l - s) * (l - s))
            .sum();
        sum / labels.len() as f64
    }
}

pub struct Auc;

impl Metric for Auc {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        let pos = labels.iter().filter(|&&l| l > 0.0).count();
        let neg = labels.len() - pos;
        if pos == 0 || neg == 0 {
            error!("AUC needs at least 1 example in each class");
            return 1.0;
        }
        let mut tp = 0usize;
        let mut auc = 0.0;
        for (_, relevant) in rank_by_score(labels, scores) {
            if relevant {
                tp += 1;
            } else {
                // tpr * d(fpr) = (tp/pos) * (1/neg)
                auc += tp as f64 / pos as f64 / neg as f64;
            }
        }
        auc
    }
}

pub struct Precision {
    k: usize,
}

impl Precision {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "precision window size should be positive");
        Precision { k }
    }
}

impl Metric for Precision {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        assert!(
            labels.len() >= self.k,
            "P@k needs at least k ranked elements"
        );
        let mut ranked: Vec<(f64, bool)> = scores
            .iter()
            .zip(labels)
            .map(|(&s, &l)| (s, l > 0.0))
            .collect();
        ranked.select_nth_unstable_by(self.k - 1, descending);
        let pos = ranked[..self.k].iter().filter(|p| p.1).count();
        pos as f64 / self.k as f64
    }
}

pub struct Recall {
    k: usize,
}

impl Recall {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "recall window size should be positive");
        Recall { k }
    }
}

impl Metric for Recall {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        assert!(
            labels.len() >= self.k,
            "R@k needs at least k ranked elements"
        );
        let total_pos = labels.iter().filter(|&&l| l > 0.0).count();
        assert!(total_pos > 0, "R@k needs at least 1 positive");
        let mut ranked: Vec<(f64, bool)> = scores
            .iter()
            .zip(labels)
            .map(|(&s, &l)| (s, l > 0.0))
            .collect();
        ranked.select_nth_unstable_by(self.k - 1, descending);
        let pos = ranked[..self.k].iter().filter(|p| p.1).count();
        pos as f64 / total_pos as f64
    }
}

pub struct AveragePrecision;

impl Metric for AveragePrecision {
    fn compute(&self, labels: &[f64], scores: &[f64]) -> f64 {
        assert_eq!(labels.len(), scores.len());
        let total_pos = labels.iter().filter(|&&l| l > 0.0).count();
        assert!(total_pos > 0, "AP needs at least 1 positive");
        let mut pos = 0usize;
        let mut ap = 0.0;
        for (rank, (_, relevant)) in rank_by_score(labels, scores).iter().enumerate() {
            if *relevant {
                pos += 1;
                ap += pos as f64 / (rank + 1) as f64;
            }
        }
        ap / total_pos as f64
    }
}

/// Process-wide metric registry, addressable by short name.
///
/// `mse`, `auc` and `ap` are registered up front; `p@<k>` and `r@<k>` are
/// constructed on first reference and cached. The map only mutates behind
/// the lock, so first-touch construction is safe from any thread.
pub struct MetricsRegistry {
    metrics: Mutex<AHashMap<String, Arc<dyn Metric>>>,
}

static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn registry() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

impl MetricsRegistry {
    fn new() -> Self {
        let mut metrics: AHashMap<String, Arc<dyn Metric>> = AHashMap::new();
        metrics.insert("mse".to_string(), Arc::new(MeanSquaredError));
        metrics.insert("auc".to_string(), Arc::new(Auc));
        metrics.insert("ap".to_string(), Arc::new(AveragePrecision));
        MetricsRegistry {
            metrics: Mutex::new(metrics),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Metric>> {
        let mut metrics = self.metrics.lock().unwrap();
        if let Some(metric) = metrics.get(name) {
            return Some(Arc::clone(metric));
        }
        let metric = build_at_k_metric(name)?;
        metrics.insert(name.to_string(), Arc::clone(&metric));
        Some(metric)
    }
}

/// Parses names like `p@5`: the `@` must not lead, and the suffix must be a
/// positive integer with nothing trailing.
fn parse_at_k(name: &str) -> Option<(&str, usize)> {
    let (prefix, suffix) = name.split_once('@')?;
    if prefix.is_empty() {
        return None;
    }
    let k: usize = suffix.parse().ok()?;
    if k == 0 {
        return None;
    }
    Some((prefix, k))
}

fn build_at_k_metric(name: &str) -> Option<Arc<dyn Metric>> {
    let (prefix, k) = parse_at_k(name)?;
    match prefix {
        "p" => Some(Arc::new(Precision::new(k))),
        "r" => Some(Arc::new(Recall::new(k))),
        _ => None,
    }
}
