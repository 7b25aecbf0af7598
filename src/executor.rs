use std::panic;
use std::thread;

use crate::thread_pool::ThreadPool;

/// Raw pointer that may be copied into parallel tasks.
///
/// This is the escape hatch for the two places that intentionally share
/// mutable state across tasks without synchronisation: disjoint row writes
/// (each task owns its row) and hogwild SGD (races are part of the
/// contract). The caller is responsible for making either of those true.
#[derive(Debug)]
pub(crate) struct SyncPtr<T>(*mut T);

impl<T> SyncPtr<T> {
    pub fn new(ptr: *mut T) -> Self {
        SyncPtr(ptr)
    }

    pub fn get(self) -> *mut T {
        self.0
    }
}

impl<T> Clone for SyncPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SyncPtr<T> {}

unsafe impl<T> Send for SyncPtr<T> {}
unsafe impl<T> Sync for SyncPtr<T> {}

/// Higher-level parallel primitives over a [`ThreadPool`].
///
/// All entry points block until every dispatched task has completed, so the
/// closures may borrow caller state even though the pool itself requires
/// `'static` tasks; the lifetime is erased internally and cannot dangle.
pub struct ParallelExecutor {
    pool: ThreadPool,
}

impl ParallelExecutor {
    pub fn new(nthreads: usize) -> Self {
        ParallelExecutor {
            pool: ThreadPool::new(nthreads),
        }
    }

    pub fn nthreads(&self) -> usize {
        self.pool.nthreads()
    }

    /// Runs `func` once for every task id in `[0, ntasks)`.
    ///
    /// Exactly `nthreads` pool tasks are spawned; task `t` covers the ids
    /// `t, t + N, t + 2N, ...` (stride partitioning). There is no ordering
    /// between task ids.
    pub fn execute<F>(&self, ntasks: usize, func: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        let nthreads = self.pool.nthreads();
        // Every future is collected below before this frame returns, so the
        // erased borrow outlives all task executions.
        let func: &'static (dyn Fn(usize) + Send + Sync) =
            unsafe { std::mem::transmute(&func as &(dyn Fn(usize) + Send + Sync)) };
        let futures: Vec<_> = (0..nthreads)
            .map(|thread_id| {
                self.pool.add_task(move || {
                    let mut task_id = thread_id;
                    while task_id < ntasks {
                        func(task_id);
                        task_id += nthreads;
                    }
                })
            })
            .collect();
        let results: Vec<_> = futures.into_iter().map(|f| f.join()).collect();
        propagate_panics(results);
    }

    /// Maps every task id in `[0, ntasks)` and reduces the results.
    ///
    /// Each worker folds its stride subset locally starting from a clone of
    /// `neutral`; the partials are then folded sequentially in worker-id
    /// order. `reducer` must be associative.
    pub fn map_reduce<T, M, R>(&self, ntasks: usize, mapper: M, reducer: R, neutral: T) -> T
    where
        T: Send + Clone + 'static,
        M: Fn(usize) -> T + Send + Sync,
        R: Fn(T, T) -> T + Send + Sync,
    {
        let nthreads = self.pool.nthreads();
        let mapper: &'static (dyn Fn(usize) -> T + Send + Sync) =
            unsafe { std::mem::transmute(&mapper as &(dyn Fn(usize) -> T + Send + Sync)) };
        let reducer_ref: &'static (dyn Fn(T, T) -> T + Send + Sync) =
            unsafe { std::mem::transmute(&reducer as &(dyn Fn(T, T) -> T + Send + Sync)) };
        let futures: Vec<_> = (0..nthreads)
            .map(|thread_id| {
                let neutral = neutral.clone();
                self.pool.add_task(move || {
                    let mut acc = neutral;
                    let mut task_id = thread_id;
                    while task_id < ntasks {
                        acc = reducer_ref(acc, mapper(task_id));
                        task_id += nthreads;
                    }
                    acc
                })
            })
            .collect();
        let results: Vec<_> = futures.into_iter().map(|f| f.join()).collect();
        let mut acc = neutral;
        for partial in propagate_panics(results) {
            acc = reducer(acc, partial);
        }
        acc
    }

    /// Maps every element of `elems` and reduces the results.
    ///
    /// Block partitioning: worker `t` handles `elems[t*B..min((t+1)*B, n)]`
    /// with `B = n / nthreads`, so the tail `n % nthreads` is never visited.
    /// The BPR evaluation-loss average relies on exactly this partitioning.
    pub fn map_reduce_elems<E, T, M, R>(
        &self,
        elems: &[E],
        mapper: M,
        reducer: R,
        neutral: T,
    ) -> T
    where
        E: Sync + 'static,
        T: Send + Clone + 'static,
        M: Fn(&E) -> T + Send + Sync,
        R: Fn(T, T) -> T + Send + Sync,
    {
        let nthreads = self.pool.nthreads();
        let nelems = elems.len();
        let block = nelems / nthreads;
        let elems: &'static [E] = unsafe { std::mem::transmute(elems) };
        let mapper: &'static (dyn Fn(&E) -> T + Send + Sync) =
            unsafe { std::mem::transmute(&mapper as &(dyn Fn(&E) -> T + Send + Sync)) };
        let reducer_ref: &'static (dyn Fn(T, T) -> T + Send + Sync) =
            unsafe { std::mem::transmute(&reducer as &(dyn Fn(T, T) -> T + Send + Sync)) };
        let futures: Vec<_> = (0..nthreads)
            .map(|thread_id| {
                let neutral = neutral.clone();
                self.pool.add_task(move || {
                    let start = thread_id * block;
                    let end = nelems.min((thread_id + 1) * block);
                    elems[start..end]
                        .iter()
                        .fold(neutral, |acc, elem| reducer_ref(acc, mapper(elem)))
                })
            })
            .collect();
        let results: Vec<_> = futures.into_iter().map(|f| f.join()).collect();
        let mut acc = neutral;
        for partial in propagate_panics(results) {
            acc = reducer(acc, partial);
        }
        acc
    }
}

/// Unwraps every task result, re-raising the first panic only after all
/// workers have finished (their closures may borrow the caller's frame).
fn propagate_panics<T>(results: Vec<thread::Result<T>>) -> Vec<T> {
    let mut values = Vec::with_capacity(results.len());
    let mut first_panic = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(payload) => {
                first_panic.get_or_insert(payload);
            }
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn execute_visits_every_task_once() {
        let nthreads = 4;
        let ntasks = 1000;
        let parallel = ParallelExecutor::new(nthreads);

        let visits: Vec<AtomicUsize> = (0..ntasks).map(|_| AtomicUsize::new(0)).collect();
        parallel.execute(ntasks, |task_id| {
            visits[task_id].fetch_add(1, Ordering::Relaxed);
        });
        for count in &visits {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn map_reduce_matches_sequential_fold() {
        let ntasks = 1000usize;
        let parallel = ParallelExecutor::new(4);

        let sum = parallel.map_reduce(ntasks, |task_id| task_id * task_id, |a, b| a + b, 0);
        assert_eq!(sum, (ntasks - 1) * ntasks * (2 * ntasks - 1) / 6);
    }

    #[test]
    fn map_reduce_elems_matches_sequential_fold() {
        let ntasks = 1000usize;
        let parallel = ParallelExecutor::new(4);

        let elems: Vec<(usize, usize)> = (0..ntasks).map(|i| (i, i)).collect();
        let sum = parallel.map_reduce_elems(&elems, |p| p.0 * p.1, |a, b| a + b, 0);
        assert_eq!(sum, (ntasks - 1) * ntasks * (2 * ntasks - 1) / 6);
    }

    #[test]
    fn map_reduce_elems_drops_the_tail() {
        // 10 elements over 4 workers: block = 2, elements 8 and 9 are lost.
        let parallel = ParallelExecutor::new(4);
        let elems: Vec<usize> = (1..=10).collect();
        let sum = parallel.map_reduce_elems(&elems, |&e| e, |a, b| a + b, 0);
        assert_eq!(sum, (1..=8).sum());
    }

    #[test]
    fn execute_with_fewer_tasks_than_threads() {
        let parallel = ParallelExecutor::new(8);
        let visits: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();
        parallel.execute(3, |task_id| {
            visits[task_id].fetch_add(1, Ordering::Relaxed);
        });
        for count in &visits {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }
    }
}
