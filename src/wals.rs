use log::{info, warn};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::path::Path;

use crate::dataset::Interaction;
use crate::engine::{self, AvgTestData};
use crate::executor::{ParallelExecutor, SyncPtr};
use crate::factors::FactorData;
use crate::id_index::IdIndex;
use crate::linalg::{linear_symmetric_solve, Matrix};
use crate::metrics_engine::MetricsEngine;

#[derive(Clone, Debug)]
pub struct WalsConfig {
    pub nepochs: usize,
    pub nfactors: usize,
    pub regularization_lambda: f64,
    /// `alpha` in the confidence weighting `c = 1 + alpha * value`.
    pub confidence_weight: f64,
    pub init_distribution_bound: f64,
}

impl Default for WalsConfig {
    fn default() -> Self {
        WalsConfig {
            nepochs: 10,
            nfactors: 30,
            regularization_lambda: 0.05,
            confidence_weight: 40.0,
            init_distribution_bound: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub id: i64,
    pub value: f64,
}

/// All interactions originating from one source id (a user, or an item once
/// the dataset has been transposed), packaged for the per-row solve.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalGroup {
    pub source_id: i64,
    pub group: Vec<Signal>,
}

/// Sorts the dataset by `(user_id, item_id)` and groups it by source,
/// inserting source ids into `index` in sorted-unique order so that a
/// group's position always equals its source's index.
pub fn group_signals(dataset: &mut [Interaction], index: &mut IdIndex) -> Vec<SignalGroup> {
    dataset.sort_by(|x, y| (x.user_id, x.item_id).cmp(&(y.user_id, y.item_id)));
    let mut signals: Vec<SignalGroup> = Vec::new();
    for elem in dataset.iter() {
        let signal = Signal {
            id: elem.item_id,
            value: elem.value,
        };
        match signals.last_mut() {
            Some(group) if group.source_id == elem.user_id => group.group.push(signal),
            _ => signals.push(SignalGroup {
                source_id: elem.user_id,
                group: vec![signal],
            }),
        }
    }
    for (i, group) in signals.iter().enumerate() {
        let idx = index.get_or_insert(group.source_id);
        assert_eq!(idx, i, "group position should match its source index");
    }
    signals
}

/// Writes disjoint rows of the matrix being updated from parallel tasks.
#[derive(Clone, Copy)]
struct RowWriter {
    ptr: SyncPtr<f64>,
    ncols: usize,
}

impl RowWriter {
    fn new(matrix: &mut Matrix) -> Self {
        RowWriter {
            ncols: matrix.ncols(),
            ptr: SyncPtr::new(matrix.as_mut_ptr()),
        }
    }

    /// Caller guarantees each row is written by exactly one task.
    unsafe fn row_mut(&self, r: usize) -> &mut [f64] {
        std::slice::from_raw_parts_mut(self.ptr.get().add(r * self.ncols), self.ncols)
    }
}

/// Weighted ALS trainer for implicit feedback (Hu–Koren–Volinsky): each
/// half-epoch recomputes one side's rows as exact closed-form minimisers
/// against the frozen opposite side.
pub struct WalsEngine {
    config: WalsConfig,
    metrics_engine: Option<MetricsEngine>,
    parallel: ParallelExecutor,
    user_index: IdIndex,
    item_index: IdIndex,
    user_factors: Option<FactorData>,
    item_factors: Option<FactorData>,
    user_signals: Vec<SignalGroup>,
    item_signals: Vec<SignalGroup>,
    avg_test: AvgTestData,
}

impl WalsEngine {
    pub fn new(
        config: WalsConfig,
        metrics_engine: Option<MetricsEngine>,
        nthreads: usize,
    ) -> Self {
        if let Some(me) = &metrics_engine {
            if !me.test_avg_metrics().is_empty() && me.config().num_test_users == 0 {
                warn!(
                    "computing average test metrics on all users can be slow! \
                     Set num_test_users > 0 to sample some of them"
                );
            }
        }
        WalsEngine {
            config,
            metrics_engine,
            parallel: ParallelExecutor::new(nthreads),
            user_index: IdIndex::new(),
            item_index: IdIndex::new(),
            user_factors: None,
            item_factors: None,
            user_signals: Vec::new(),
            item_signals: Vec::new(),
            avg_test: AvgTestData::default(),
        }
    }

    pub fn nusers(&self) -> usize {
        self.user_index.len()
    }

    pub fn nitems(&self) -> usize {
        self.item_index.len()
    }

    /// Groups the dataset by user and (transposed) by item, then allocates
    /// the factor matrices. Item factors start uniform in `[-bound, bound]`;
    /// user factors stay at zero since the first half-epoch overwrites them.
    pub fn init(&mut self, dataset: &[Interaction]) {
        assert!(
            self.user_factors.is_none() && self.item_factors.is_none(),
            "engine was already initialized with train data"
        );
        let mut mutable_dataset = dataset.to_vec();
        self.user_signals = group_signals(&mut mutable_dataset, &mut self.user_index);
        for elem in &mut mutable_dataset {
            std::mem::swap(&mut elem.user_id, &mut elem.item_id);
        }
        self.item_signals = group_signals(&mut mutable_dataset, &mut self.item_index);

        let user_factors = FactorData::new(self.nusers(), self.config.nfactors, false);
        let mut item_factors = FactorData::new(self.nitems(), self.config.nfactors, false);
        let bound = self.config.init_distribution_bound;
        let distr = Uniform::new_inclusive(-bound, bound);
        let mut rng = StdRng::from_entropy();
        item_factors.set_factors(|_, _| distr.sample(&mut rng));
        self.user_factors = Some(user_factors);
        self.item_factors = Some(item_factors);
    }

    /// Prepares averaged-metric data from test interactions whose ids were
    /// seen at training time.
    pub fn init_test(&mut self, test_dataset: &[Interaction]) {
        assert!(
            self.avg_test.users.is_empty(),
            "engine was already initialized with test data"
        );
        if let Some(me) = &self.metrics_engine {
            if !me.test_avg_metrics().is_empty() {
                self.avg_test = engine::init_avg_test_data(
                    test_dataset,
                    &self.user_index,
                    &self.item_index,
                    me.config().num_test_users,
                    me.config().seed,
                );
            }
        }
    }

    /// Runs `nepochs`, each epoch being two half-epochs: users against fixed
    /// item factors, then items against the fresh user factors.
    pub fn optimize(&mut self) {
        assert!(
            self.user_factors.is_some() && self.item_factors.is_some(),
            "no factor data, have you initialized the engine?"
        );
        for epoch in 1..=self.config.nepochs {
            self.run_half_epoch(true);
            let loss = self.run_half_epoch(false);
            info!("epoch {epoch}: train loss = {loss}");
            self.evaluate(epoch);
        }
    }

    /// Averaged test metrics when they are due; WALS has no separate eval
    /// sets, the half-epoch reduction already reports the training loss.
    pub fn evaluate(&mut self, epoch: usize) {
        let due = match &self.metrics_engine {
            Some(me) => {
                !me.test_avg_metrics().is_empty()
                    && !self.avg_test.users.is_empty()
                    && (me.config().always_compute || epoch == self.config.nepochs)
            }
            None => false,
        };
        if due {
            let user_factors = self.user_factors.as_ref().unwrap();
            let item_factors = self.item_factors.as_ref().unwrap();
            engine::compute_test_scores(
                &mut self.avg_test.scores,
                &self.avg_test.users,
                user_factors,
                item_factors,
                &self.parallel,
            );
            let me = self.metrics_engine.as_mut().unwrap();
            me.compute_and_record_test_avg_metrics(
                epoch,
                &self.avg_test.labels,
                &self.avg_test.scores,
                &self.parallel,
            );
        }
    }

    pub fn save_user_factors(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let user_factors = self
            .user_factors
            .as_ref()
            .expect("user factors weren't initialized");
        engine::save_factors_to_path(user_factors, &self.user_index, path)
    }

    pub fn save_item_factors(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let item_factors = self
            .item_factors
            .as_ref()
            .expect("item factors weren't initialized");
        engine::save_factors_to_path(item_factors, &self.item_index, path)
    }

    pub fn metrics_engine(&self) -> Option<&MetricsEngine> {
        self.metrics_engine.as_ref()
    }

    /// `X^T X` over row chunks of `ceil(nrows / nthreads)`, reduced by
    /// matrix addition.
    pub fn compute_xtx(&self, x: &Matrix) -> Matrix {
        let ntasks = self.parallel.nthreads();
        let nrows = x.nrows();
        let ncols = x.ncols();
        let task_size = nrows.div_ceil(ntasks);
        self.parallel.map_reduce(
            ntasks,
            |task_id| {
                let mut xtx = Matrix::new(ncols, ncols);
                let lo = task_id * task_size;
                let hi = nrows.min((task_id + 1) * task_size);
                for r in lo..hi {
                    for i in 0..ncols {
                        for j in 0..ncols {
                            xtx[(i, j)] += x[(r, i)] * x[(r, j)];
                        }
                    }
                }
                xtx
            },
            |acc, partial| &acc + &partial,
            Matrix::new(ncols, ncols),
        )
    }

    /// One half-epoch: zero the side being updated, then solve every row
    /// independently. Returns the summed per-row losses over
    /// `nusers * nitems`.
    fn run_half_epoch(&mut self, update_users: bool) -> f64 {
        let yty = {
            let right = if update_users {
                &self.item_factors
            } else {
                &self.user_factors
            };
            self.compute_xtx(right.as_ref().unwrap().factors())
        };
        let denominator = (self.nusers() * self.nitems()) as f64;
        let alpha = self.config.confidence_weight;
        let lambda = self.config.regularization_lambda;

        let (left, left_index, left_signals, right, right_index) = if update_users {
            (
                self.user_factors.as_mut().unwrap(),
                &self.user_index,
                &self.user_signals,
                self.item_factors.as_ref().unwrap(),
                &self.item_index,
            )
        } else {
            (
                self.item_factors.as_mut().unwrap(),
                &self.item_index,
                &self.item_signals,
                self.user_factors.as_ref().unwrap(),
                &self.user_index,
            )
        };
        left.set_factors(|_, _| 0.0);
        let x_rows = RowWriter::new(left.factors_mut());
        let y = right.factors();

        let total_loss = self.parallel.map_reduce(
            left_signals.len(),
            |task_id| {
                update_factors_for_one(
                    x_rows,
                    left_index,
                    y,
                    right_index,
                    &left_signals[task_id],
                    yty.clone(),
                    alpha,
                    lambda,
                )
            },
            |a, b| a + b,
            0.0,
        );
        total_loss / denominator
    }
}

/// Closed-form solve for one row `x` against the fixed right matrix `Y`
/// with signals `S` and confidences `c = 1 + alpha * value`:
///
/// ```text
/// A = Y^T Y + sum_s alpha * v_s * y_s y_s^T + lambda * I
/// b = sum_s (1 + alpha * v_s) * y_s
/// ```
///
/// `a` arrives as a copy of the precomputed `Y^T Y` so the caller's matrix
/// survives across rows. Returns this row's contribution to the training
/// loss, `sum_s c_s + x^T B x - 2 x^T b` with `B` being `A` before the
/// regularisation diagonal.
fn update_factors_for_one(
    x: RowWriter,
    left_index: &IdIndex,
    y: &Matrix,
    right_index: &IdIndex,
    signal_group: &SignalGroup,
    mut a: Matrix,
    alpha: f64,
    lambda: f64,
) -> f64 {
    let n = y.ncols();
    let mut loss = 0.0;
    let mut b = vec![0.0; n];
    for signal in &signal_group.group {
        let ridx = right_index
            .lookup(signal.id)
            .expect("signal id missing from the right index");
        let weight = alpha * signal.value;
        for i in 0..n {
            b[i] += y[(ridx, i)] * (1.0 + weight);
            for j in 0..n {
                a[(i, j)] += y[(ridx, i)] * weight * y[(ridx, j)];
            }
        }
        // the x^T C x term of the objective
        loss += 1.0 + weight;
    }

    // B = Y^T C Y, snapshotted before the regularisation diagonal
    let b_mat = a.clone();
    for i in 0..n {
        a[(i, i)] += lambda;
    }
    let solution = linear_symmetric_solve(a, b.clone());

    for i in 0..n {
        for j in 0..n {
            loss += b_mat[(i, j)] * solution[i] * solution[j];
        }
    }
    for i in 0..n {
        loss -= 2.0 * solution[i] * b[i];
    }

    let lidx = left_index
        .lookup(signal_group.source_id)
        .expect("source id missing from the left index");
    // this task is the only writer of this row
    let row = unsafe { x.row_mut(lidx) };
    row.copy_from_slice(&solution);
    loss
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::assert_near;
    use rand::Rng;

    fn elem(user_id: i64, item_id: i64) -> Interaction {
        Interaction {
            user_id,
            item_id,
            value: 1.0,
        }
    }

    fn groups_of(signals: &[SignalGroup]) -> Vec<(i64, Vec<i64>)> {
        signals
            .iter()
            .map(|g| (g.source_id, g.group.iter().map(|s| s.id).collect()))
            .collect()
    }

    #[test]
    fn init_groups_signals_on_both_sides() {
        let config = WalsConfig {
            nfactors: 30,
            ..WalsConfig::default()
        };
        let mut engine = WalsEngine::new(config, None, 4);
        let dataset = vec![
            elem(1, 1),
            elem(1, 2),
            elem(1, 3),
            elem(2, 1),
            elem(2, 3),
            elem(3, 4),
        ];
        engine.init(&dataset);

        assert_eq!(engine.nusers(), 3);
        assert_eq!(engine.user_factors.as_ref().unwrap().nelems(), 3);
        assert_eq!(engine.user_factors.as_ref().unwrap().nfactors(), 30);
        assert_eq!(
            groups_of(&engine.user_signals),
            vec![(1, vec![1, 2, 3]), (2, vec![1, 3]), (3, vec![4])]
        );

        assert_eq!(engine.nitems(), 4);
        assert_eq!(engine.item_factors.as_ref().unwrap().nelems(), 4);
        assert_eq!(
            groups_of(&engine.item_signals),
            vec![
                (1, vec![1, 2]),
                (2, vec![1]),
                (3, vec![1, 2]),
                (4, vec![3]),
            ]
        );

        // group positions match the indexes
        for (i, group) in engine.user_signals.iter().enumerate() {
            assert_eq!(engine.user_index.lookup(group.source_id), Some(i));
        }
        for (i, group) in engine.item_signals.iter().enumerate() {
            assert_eq!(engine.item_index.lookup(group.source_id), Some(i));
        }
    }

    #[test]
    #[should_panic(expected = "already initialized with train data")]
    fn init_twice() {
        let mut engine = WalsEngine::new(WalsConfig::default(), None, 2);
        let dataset = vec![elem(1, 1)];
        engine.init(&dataset);
        engine.init(&dataset);
    }

    #[test]
    fn init_test_collects_valid_users() {
        let mut metrics_engine =
            MetricsEngine::with_logging(crate::metrics_engine::MetricsConfig::default(), false);
        assert!(metrics_engine.add_test_avg_metric("auc"));
        let mut engine = WalsEngine::new(WalsConfig::default(), Some(metrics_engine), 2);

        let dataset = vec![
            elem(1, 1),
            elem(1, 2),
            elem(1, 3),
            elem(2, 1),
            elem(2, 3),
            elem(3, 4),
        ];
        engine.init(&dataset);

        let test_dataset = vec![elem(1, 4), elem(2, 1), elem(4, 2)];
        engine.init_test(&test_dataset);

        assert_eq!(engine.avg_test.users.len(), 2);
        assert_eq!(engine.avg_test.labels.len(), 2);
        assert_eq!(engine.avg_test.scores.len(), 2);
    }

    #[test]
    #[should_panic(expected = "already initialized with test data")]
    fn init_test_twice() {
        let mut metrics_engine =
            MetricsEngine::with_logging(crate::metrics_engine::MetricsConfig::default(), false);
        assert!(metrics_engine.add_test_avg_metric("auc"));
        let mut engine = WalsEngine::new(WalsConfig::default(), Some(metrics_engine), 2);
        engine.init(&[elem(1, 1), elem(2, 2)]);
        let test_dataset = vec![elem(1, 2)];
        engine.init_test(&test_dataset);
        engine.init_test(&test_dataset);
    }

    #[test]
    fn xtx_matches_serial_reference() {
        let nfactors = 5;
        let n = 17;
        let mut rng = rand::rngs::StdRng::seed_from_u64(123);
        let mut x = Matrix::new(n, nfactors);
        for i in 0..n {
            for j in 0..nfactors {
                x[(i, j)] = rng.gen_range(-1.0..1.0);
            }
        }

        for nthreads in [1usize, 2, 3, 5, 7, 8, 10, 16, 32] {
            let engine = WalsEngine::new(
                WalsConfig {
                    nfactors,
                    ..WalsConfig::default()
                },
                None,
                nthreads,
            );
            let xtx = engine.compute_xtx(&x);
            assert_eq!(xtx.nrows(), nfactors);
            assert_eq!(xtx.ncols(), nfactors);
            for i in 0..nfactors {
                for j in 0..nfactors {
                    let mut expected = 0.0;
                    for r in 0..n {
                        expected += x[(r, i)] * x[(r, j)];
                    }
                    assert_near(xtx[(i, j)], expected, 1e-8);
                }
            }
        }
    }

    #[test]
    fn row_solve_matches_explicit_objective() {
        let nusers = 3;
        let nitems = 2;
        let nfactors = 3;

        let mut x = Matrix::new(nusers, nfactors);
        let mut y = Matrix::new(nitems, nfactors);
        for i in 0..nitems {
            for j in 0..nfactors {
                y[(i, j)] = 0.1;
            }
        }

        let mut user_index = IdIndex::new();
        for i in 0..nusers {
            user_index.get_or_insert(i as i64);
        }
        let mut item_index = IdIndex::new();
        for i in 0..nitems {
            item_index.get_or_insert(i as i64);
        }

        let mut yty = Matrix::new(nfactors, nfactors);
        for i in 0..nfactors {
            for j in 0..nfactors {
                for r in 0..nitems {
                    yty[(i, j)] += y[(r, i)] * y[(r, j)];
                }
            }
        }

        let signal_group = SignalGroup {
            source_id: 0,
            group: vec![
                Signal { id: 0, value: 1.0 },
                Signal { id: 1, value: 1.0 },
            ],
        };

        let loss = update_factors_for_one(
            RowWriter::new(&mut x),
            &user_index,
            &y,
            &item_index,
            &signal_group,
            yty,
            1.0,
            1.0,
        );

        for i in 0..nfactors {
            assert_near(x[(0, i)], 0.357, 1e-2);
        }
        for i in 1..nusers {
            for j in 0..nfactors {
                assert_near(x[(i, j)], 0.0, 1e-8);
            }
        }

        // explicit weighted squared-residual sum over all cells
        let mut expected_loss = 0.0;
        for i in 0..nusers {
            for j in 0..nitems {
                let mut pred = 0.0;
                for f in 0..nfactors {
                    pred += x[(i, f)] * y[(j, f)];
                }
                if i == 0 {
                    // both items liked by this user, confidence 1 + 1
                    expected_loss += 2.0 * (1.0 - pred) * (1.0 - pred);
                } else {
                    expected_loss += pred * pred;
                }
            }
        }
        assert_near(loss, expected_loss, 1e-2);
    }

    #[test]
    fn optimize_reconstructs_preferences() {
        let config = WalsConfig {
            nepochs: 8,
            nfactors: 4,
            regularization_lambda: 0.05,
            confidence_weight: 10.0,
            init_distribution_bound: 0.01,
        };
        let mut engine = WalsEngine::new(config, None, 4);
        // two disjoint taste clusters
        let dataset = vec![
            elem(1, 1),
            elem(1, 2),
            elem(2, 1),
            elem(2, 2),
            elem(3, 3),
            elem(3, 4),
            elem(4, 3),
            elem(4, 4),
        ];
        engine.init(&dataset);
        engine.optimize();

        let score = |user_id: i64, item_id: i64| {
            let uidx = engine.user_index.lookup(user_id).unwrap();
            let pidx = engine.item_index.lookup(item_id).unwrap();
            let user_factors = engine.user_factors.as_ref().unwrap();
            let item_factors = engine.item_factors.as_ref().unwrap();
            let mut s = 0.0;
            for f in 0..user_factors.nfactors() {
                s += user_factors.at(uidx, f) * item_factors.at(pidx, f);
            }
            s
        };
        assert!(score(1, 1) > score(1, 3));
        assert!(score(1, 2) > score(1, 4));
        assert!(score(3, 3) > score(3, 1));
        assert!(score(3, 4) > score(3, 2));
    }
}
