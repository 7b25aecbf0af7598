use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::Interaction;
use crate::executor::{ParallelExecutor, SyncPtr};
use crate::factors::FactorData;
use crate::id_index::IdIndex;

/// Per-user label/score rows for averaged test metrics. `labels[i]` and
/// `scores[i]` belong to the user at index `users[i]`, one slot per item.
#[derive(Debug, Default)]
pub struct AvgTestData {
    pub users: Vec<usize>,
    pub labels: Vec<Vec<f64>>,
    pub scores: Vec<Vec<f64>>,
}

/// Collects the test users whose ids resolve in the training indexes and
/// lays out their label/score rows.
///
/// Test records referencing unknown users or items are silently dropped.
/// When `0 < num_test_users < collected`, the user set is shuffled with a
/// PRNG seeded from `seed` and truncated.
pub fn init_avg_test_data(
    test_dataset: &[Interaction],
    user_index: &IdIndex,
    item_index: &IdIndex,
    num_test_users: usize,
    seed: i32,
) -> AvgTestData {
    // first-appearance order keeps the subsample deterministic for a fixed
    // dataset and seed
    let mut seen = AHashSet::new();
    let mut users = Vec::new();
    for elem in test_dataset {
        let (Some(uidx), Some(_)) = (
            user_index.lookup(elem.user_id),
            item_index.lookup(elem.item_id),
        ) else {
            continue;
        };
        if seen.insert(uidx) {
            users.push(uidx);
        }
    }
    if num_test_users > 0 && num_test_users < users.len() {
        users.shuffle(&mut StdRng::seed_from_u64(seed as u64));
        users.truncate(num_test_users);
    }

    let mut slot_of = AHashMap::with_capacity(users.len());
    for (slot, &uidx) in users.iter().enumerate() {
        slot_of.insert(uidx, slot);
    }

    let nitems = item_index.len();
    let mut labels = vec![vec![0.0; nitems]; users.len()];
    let scores = vec![vec![0.0; nitems]; users.len()];
    for elem in test_dataset {
        let (Some(uidx), Some(pidx)) = (
            user_index.lookup(elem.user_id),
            item_index.lookup(elem.item_id),
        ) else {
            continue;
        };
        let Some(&slot) = slot_of.get(&uidx) else {
            continue;
        };
        labels[slot][pidx] = elem.value;
    }

    AvgTestData {
        users,
        labels,
        scores,
    }
}

/// Scores every item for every selected test user, in parallel.
pub fn compute_test_scores(
    scores: &mut [Vec<f64>],
    users: &[usize],
    user_factors: &FactorData,
    item_factors: &FactorData,
    parallel: &ParallelExecutor,
) {
    assert_eq!(scores.len(), users.len());
    let rows = SyncPtr::new(scores.as_mut_ptr());
    let nfactors = user_factors.nfactors();
    parallel.execute(users.len(), move |task_id| {
        // each task owns exactly one scores row
        let row = unsafe { &mut *rows.get().add(task_id) };
        let uidx = users[task_id];
        for idx in 0..item_factors.nelems() {
            let mut score = item_factors.bias_or_zero(idx);
            for fidx in 0..nfactors {
                score += user_factors.at(uidx, fidx) * item_factors.at(idx, fidx);
            }
            row[idx] = score;
        }
    });
}

/// Writes one line per row: `<id>[ <bias>] <f_0> ... <f_{k-1}>`, fixed
/// notation with 9 fractional digits.
pub fn save_factors(
    factor_data: &FactorData,
    index: &IdIndex,
    out: &mut impl Write,
) -> io::Result<()> {
    assert_eq!(
        factor_data.nelems(),
        index.len(),
        "factor rows should match the id index"
    );
    for idx in 0..factor_data.nelems() {
        write!(out, "{}", index.id_of(idx))?;
        if factor_data.has_biases() {
            write!(out, " {:.9}", factor_data.bias_at(idx))?;
        }
        for fidx in 0..factor_data.nfactors() {
            write!(out, " {:.9}", factor_data.at(idx, fidx))?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

pub fn save_factors_to_path(
    factor_data: &FactorData,
    index: &IdIndex,
    path: impl AsRef<Path>,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    save_factors(factor_data, index, &mut out)?;
    out.flush()
}
