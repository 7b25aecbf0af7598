use ahash::AHashSet;
use log::{info, warn};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::Path;

use crate::dataset::Interaction;
use crate::engine::{self, AvgTestData};
use crate::executor::{ParallelExecutor, SyncPtr};
use crate::factors::FactorData;
use crate::id_index::IdIndex;
use crate::metrics_engine::MetricsEngine;

#[derive(Clone, Debug)]
pub struct BprConfig {
    pub nepochs: usize,
    pub nfactors: usize,
    pub init_learning_rate: f64,
    pub bias_lambda: f64,
    pub user_lambda: f64,
    pub item_lambda: f64,
    /// Multiplied into the learning rate after each epoch when `< 1.0`.
    pub decay_rate: f64,
    pub use_biases: bool,
    /// Factors initialise i.i.d. uniform in `[-bound, bound]`.
    pub init_distribution_bound: f64,
    pub num_negative_samples: usize,
    /// `> 1` enables lock-free parallel SGD over that many blocks.
    pub num_hogwild_threads: usize,
    pub shuffle_training_set: bool,
}

impl Default for BprConfig {
    fn default() -> Self {
        BprConfig {
            nepochs: 10,
            nfactors: 30,
            init_learning_rate: 0.05,
            bias_lambda: 1.0,
            user_lambda: 0.025,
            item_lambda: 0.0025,
            decay_rate: 0.9,
            use_biases: false,
            init_distribution_bound: 0.01,
            num_negative_samples: 3,
            num_hogwild_threads: 1,
            shuffle_training_set: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PosPair {
    user_idx: usize,
    pos_item_idx: usize,
}

#[derive(Clone, Copy, Debug)]
struct PosNegTriplet {
    user_idx: usize,
    pos_item_idx: usize,
    neg_item_idx: usize,
}

/// Everything one SGD step needs besides the triplet itself.
#[derive(Clone, Copy)]
struct SgdParams {
    nfactors: usize,
    learning_rate: f64,
    bias_lambda: f64,
    user_lambda: f64,
    item_lambda: f64,
}

/// Raw views into the factor storage. In hogwild mode several tasks write
/// through these concurrently; torn writes and lost updates are accepted.
#[derive(Clone, Copy)]
struct FactorPtrs {
    user: SyncPtr<f64>,
    item: SyncPtr<f64>,
    item_bias: Option<SyncPtr<f64>>,
}

/// Bayesian Personalised Ranking trainer: SGD on sampled
/// (user, positive, negative) triplets, optionally hogwild-parallel.
pub struct BprEngine {
    config: BprConfig,
    metrics_engine: Option<MetricsEngine>,
    eval_num_neg: usize,
    eval_seed: i32,
    parallel: ParallelExecutor,
    rng: StdRng,
    learning_rate: f64,
    data: Vec<PosPair>,
    eval_set: Vec<PosNegTriplet>,
    test_eval_set: Vec<PosNegTriplet>,
    item_map: Vec<AHashSet<usize>>,
    test_item_map: Vec<AHashSet<usize>>,
    user_index: IdIndex,
    item_index: IdIndex,
    user_factors: Option<FactorData>,
    item_factors: Option<FactorData>,
    avg_test: AvgTestData,
}

impl BprEngine {
    pub fn new(
        config: BprConfig,
        metrics_engine: Option<MetricsEngine>,
        eval_num_neg: usize,
        eval_seed: i32,
        nthreads: usize,
    ) -> Self {
        if config.num_hogwild_threads > nthreads {
            warn!(
                "number of hogwild threads should be smaller than number of \
                 threads in the threadpool"
            );
        }
        if let Some(me) = &metrics_engine {
            if !me.test_avg_metrics().is_empty() && me.config().num_test_users == 0 {
                warn!(
                    "computing average test metrics on all users can be slow! \
                     Set num_test_users > 0 to sample some of them"
                );
            }
        }
        let learning_rate = config.init_learning_rate;
        BprEngine {
            config,
            metrics_engine,
            eval_num_neg,
            eval_seed,
            parallel: ParallelExecutor::new(nthreads),
            rng: StdRng::from_entropy(),
            learning_rate,
            data: Vec::new(),
            eval_set: Vec::new(),
            test_eval_set: Vec::new(),
            item_map: Vec::new(),
            test_item_map: Vec::new(),
            user_index: IdIndex::new(),
            item_index: IdIndex::new(),
            user_factors: None,
            item_factors: None,
            avg_test: AvgTestData::default(),
        }
    }

    pub fn nusers(&self) -> usize {
        self.user_index.len()
    }

    pub fn nitems(&self) -> usize {
        self.item_index.len()
    }

    /// Ingests the training set: keeps interactions with `value >= 1.0`,
    /// builds the id indexes and per-user positive sets, freezes the
    /// evaluation triplets and initialises the factors.
    pub fn init(&mut self, dataset: &[Interaction]) {
        assert!(
            self.user_factors.is_none() && self.item_factors.is_none(),
            "engine was already initialized with train data"
        );
        for elem in dataset {
            if elem.value < 1.0 {
                continue;
            }
            let uidx = self.user_index.get_or_insert(elem.user_id);
            let pidx = self.item_index.get_or_insert(elem.item_id);
            self.data.push(PosPair {
                user_idx: uidx,
                pos_item_idx: pidx,
            });
        }

        self.item_map = vec![AHashSet::new(); self.user_index.len()];
        for pair in &self.data {
            self.item_map[pair.user_idx].insert(pair.pos_item_idx);
        }

        let mut eval_rng = StdRng::seed_from_u64(self.eval_seed as u64);
        self.eval_set = self.build_eval_set(&mut eval_rng);

        self.learning_rate = self.config.init_learning_rate;
        let mut user_factors = FactorData::new(self.nusers(), self.config.nfactors, false);
        let mut item_factors =
            FactorData::new(self.nitems(), self.config.nfactors, self.config.use_biases);
        let bound = self.config.init_distribution_bound;
        let distr = Uniform::new_inclusive(-bound, bound);
        user_factors.set_factors(|_, _| distr.sample(&mut self.rng));
        item_factors.set_factors(|_, _| distr.sample(&mut self.rng));
        if self.config.use_biases {
            item_factors.set_biases(|_| distr.sample(&mut self.rng));
        }
        self.user_factors = Some(user_factors);
        self.item_factors = Some(item_factors);
    }

    /// Prepares the test-side structures from interactions whose user and
    /// item were both seen at training time; everything else is dropped.
    pub fn init_test(&mut self, test_dataset: &[Interaction]) {
        assert!(
            self.test_eval_set.is_empty(),
            "engine was already initialized with test data"
        );
        let mut valid = Vec::with_capacity(test_dataset.len());
        self.test_item_map = vec![AHashSet::new(); self.user_index.len()];
        for elem in test_dataset {
            if elem.value < 1.0 {
                continue;
            }
            let (Some(uidx), Some(pidx)) = (
                self.user_index.lookup(elem.user_id),
                self.item_index.lookup(elem.item_id),
            ) else {
                continue;
            };
            self.test_item_map[uidx].insert(pidx);
            valid.push((uidx, pidx));
        }

        let nitems = self.nitems();
        let mut rng = StdRng::seed_from_u64(self.eval_seed as u64);
        self.test_eval_set.reserve(self.eval_num_neg * valid.len());
        for &(uidx, pidx) in &valid {
            for _ in 0..self.eval_num_neg {
                self.test_eval_set.push(PosNegTriplet {
                    user_idx: uidx,
                    pos_item_idx: pidx,
                    neg_item_idx: draw_negative(&self.test_item_map[uidx], nitems, &mut rng),
                });
            }
        }

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

    /// Runs `nepochs` of SGD, evaluating after each epoch.
    pub fn optimize(&mut self) {
        assert!(
            self.user_factors.is_some() && self.item_factors.is_some(),
            "no factor data, have you initialized the engine?"
        );
        for epoch in 1..=self.config.nepochs {
            if self.config.num_hogwild_threads <= 1 {
                self.sgd_pass_serial();
            } else {
                self.sgd_pass_hogwild();
            }

            self.evaluate(epoch);

            if self.config.decay_rate < 1.0 {
                self.learning_rate *= self.config.decay_rate;
            }
            if self.config.shuffle_training_set {
                self.data.shuffle(&mut self.rng);
            }
        }
    }

    /// Mean loss over the frozen train/test evaluation sets (-1.0 when a
    /// set is empty), plus averaged test metrics when they are due.
    pub fn evaluate(&mut self, epoch: usize) {
        let train_eval_loss = self.eval_set_loss(&self.eval_set);
        let test_eval_loss = self.eval_set_loss(&self.test_eval_set);
        info!("epoch {epoch}: train loss = {train_eval_loss}, test loss = {test_eval_loss}");

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

    /// Score difference `b_i - b_j + <p_u, q_i - q_j>`.
    pub fn predict_difference(
        &self,
        user_idx: usize,
        pos_item_idx: usize,
        neg_item_idx: usize,
    ) -> f64 {
        let user_factors = self.user_factors.as_ref().expect("no factor data");
        let item_factors = self.item_factors.as_ref().expect("no factor data");
        let mut pred = 0.0;
        if self.config.use_biases {
            pred += item_factors.bias_at(pos_item_idx) - item_factors.bias_at(neg_item_idx);
        }
        for fidx in 0..self.config.nfactors {
            pred += user_factors.at(user_idx, fidx)
                * (item_factors.at(pos_item_idx, fidx) - item_factors.at(neg_item_idx, fidx));
        }
        pred
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

    fn build_eval_set(&self, rng: &mut StdRng) -> Vec<PosNegTriplet> {
        let nitems = self.nitems();
        let mut eval_set = Vec::with_capacity(self.eval_num_neg * self.data.len());
        for pair in &self.data {
            for _ in 0..self.eval_num_neg {
                eval_set.push(PosNegTriplet {
                    user_idx: pair.user_idx,
                    pos_item_idx: pair.pos_item_idx,
                    neg_item_idx: draw_negative(&self.item_map[pair.user_idx], nitems, rng),
                });
            }
        }
        eval_set
    }

    fn sgd_pass_serial(&mut self) {
        let params = self.sgd_params();
        let use_biases = self.config.use_biases;
        let num_neg = self.config.num_negative_samples;
        let nitems = self.nitems();
        let ptrs = self.factor_ptrs();
        for i in 0..self.data.len() {
            let pair = self.data[i];
            for _ in 0..num_neg {
                let neg = draw_negative(&self.item_map[pair.user_idx], nitems, &mut self.rng);
                let triplet = PosNegTriplet {
                    user_idx: pair.user_idx,
                    pos_item_idx: pair.pos_item_idx,
                    neg_item_idx: neg,
                };
                // exclusive access here; the raw-pointer kernel is shared
                // with the hogwild path
                unsafe { sgd_update(ptrs, params, use_biases, triplet) };
            }
        }
    }

    fn sgd_pass_hogwild(&mut self) {
        let params = self.sgd_params();
        let use_biases = self.config.use_biases;
        let num_neg = self.config.num_negative_samples;
        let nitems = self.nitems();
        let ptrs = self.factor_ptrs();
        let rng = SyncPtr::new(&mut self.rng as *mut StdRng);
        let ntasks = self.config.num_hogwild_threads;
        let block = self.data.len() / ntasks;
        let data = &self.data;
        let item_map = &self.item_map;
        self.parallel.execute(ntasks, move |task_id| {
            let start = task_id * block;
            let end = data.len().min((task_id + 1) * block);
            for pair in &data[start..end] {
                for _ in 0..num_neg {
                    // the PRNG is shared and unsynchronised, like the factors
                    let neg = {
                        let rng = unsafe { &mut *rng.get() };
                        draw_negative(&item_map[pair.user_idx], nitems, rng)
                    };
                    let triplet = PosNegTriplet {
                        user_idx: pair.user_idx,
                        pos_item_idx: pair.pos_item_idx,
                        neg_item_idx: neg,
                    };
                    unsafe { sgd_update(ptrs, params, use_biases, triplet) };
                }
            }
        });
    }

    fn sgd_params(&self) -> SgdParams {
        SgdParams {
            nfactors: self.config.nfactors,
            learning_rate: self.learning_rate,
            bias_lambda: self.config.bias_lambda,
            user_lambda: self.config.user_lambda,
            item_lambda: self.config.item_lambda,
        }
    }

    fn factor_ptrs(&mut self) -> FactorPtrs {
        let user = self.user_factors.as_mut().expect("no factor data");
        let item = self.item_factors.as_mut().expect("no factor data");
        FactorPtrs {
            user: SyncPtr::new(user.factors_mut().as_mut_ptr()),
            item: SyncPtr::new(item.factors_mut().as_mut_ptr()),
            item_bias: item
                .biases_mut()
                .map(|biases| SyncPtr::new(biases.as_mut_ptr())),
        }
    }

    fn eval_set_loss(&self, eval_set: &[PosNegTriplet]) -> f64 {
        if eval_set.is_empty() {
            return -1.0;
        }
        let total = self.parallel.map_reduce_elems(
            eval_set,
            |triplet: &PosNegTriplet| {
                loss(self.predict_difference(
                    triplet.user_idx,
                    triplet.pos_item_idx,
                    triplet.neg_item_idx,
                ))
            },
            |a, b| a + b,
            0.0,
        );
        total / eval_set.len() as f64
    }
}

/// `log(1 + e^{-x})`
fn loss(score_difference: f64) -> f64 {
    (1.0 + (-score_difference).exp()).ln()
}

/// Uniform over `[0, nitems)`, rejecting the user's positives. Assumes each
/// positive set is much smaller than the item universe, otherwise rejection
/// sampling degenerates.
fn draw_negative(positives: &AHashSet<usize>, nitems: usize, rng: &mut impl Rng) -> usize {
    loop {
        let neg_idx = rng.gen_range(0..nitems);
        if !positives.contains(&neg_idx) {
            return neg_idx;
        }
    }
}

/// One SGD step for a (user, positive, negative) triplet:
///
/// ```text
/// e   = 1 / (1 + e^{x}),  x = b_i - b_j + <p_u, q_i - q_j>
/// b_i += lr * ( e - bias_lambda * b_i)        (biases only)
/// b_j += lr * (-e - bias_lambda * b_j)
/// p_u += lr * ( e * (q_i - q_j) - user_lambda * p_u)
/// q_i += lr * ( e * p_u         - item_lambda * q_i)
/// q_j += lr * (-e * p_u         - item_lambda * q_j)
/// ```
///
/// The item updates read `p_u` after the user update on purpose. Callers
/// either hold exclusive access (serial pass) or share the buffers through
/// `SyncPtr` (hogwild), where races on individual doubles are accepted.
unsafe fn sgd_update(ptrs: FactorPtrs, params: SgdParams, use_biases: bool, t: PosNegTriplet) {
    let k = params.nfactors;
    let p_u = std::slice::from_raw_parts_mut(ptrs.user.get().add(t.user_idx * k), k);
    let q_i = std::slice::from_raw_parts_mut(ptrs.item.get().add(t.pos_item_idx * k), k);
    let q_j = std::slice::from_raw_parts_mut(ptrs.item.get().add(t.neg_item_idx * k), k);

    let mut x = 0.0;
    if use_biases {
        let bias = ptrs.item_bias.expect("bias storage missing");
        x += *bias.get().add(t.pos_item_idx) - *bias.get().add(t.neg_item_idx);
    }
    for fidx in 0..k {
        x += p_u[fidx] * (q_i[fidx] - q_j[fidx]);
    }
    // e = d/dx log sigmoid(x) = 1 / (1 + e^x)
    let e = 1.0 / (1.0 + x.exp());
    assert!(
        e.is_finite(),
        "gradients too big, try decreasing the learning rate (--init_learning_rate)"
    );

    let lr = params.learning_rate;
    if use_biases {
        let bias = ptrs.item_bias.expect("bias storage missing");
        let b_i = bias.get().add(t.pos_item_idx);
        *b_i += lr * (e - params.bias_lambda * *b_i);
        let b_j = bias.get().add(t.neg_item_idx);
        *b_j += lr * (-e - params.bias_lambda * *b_j);
    }
    for fidx in 0..k {
        p_u[fidx] += lr * (e * (q_i[fidx] - q_j[fidx]) - params.user_lambda * p_u[fidx]);
    }
    for fidx in 0..k {
        q_i[fidx] += lr * (e * p_u[fidx] - params.item_lambda * q_i[fidx]);
    }
    for fidx in 0..k {
        q_j[fidx] += lr * (-e * p_u[fidx] - params.item_lambda * q_j[fidx]);
    }
}
