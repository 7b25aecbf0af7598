use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    poisoned: bool,
}

/// Fixed pool of worker threads executing arbitrary nullary tasks.
///
/// Workers block on a condition variable until a task is queued or the pool
/// is poisoned. Dropping the pool poisons it, wakes every worker and joins
/// them; tasks already in the queue still run to completion first.
pub struct ThreadPool {
    state: Arc<(Mutex<PoolState>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

/// Handle to a task's eventual result.
pub struct TaskFuture<T> {
    result: Receiver<thread::Result<T>>,
}

impl<T> TaskFuture<T> {
    /// Blocks until the task has run and returns its value, re-raising the
    /// task's panic on the calling thread if it had one.
    pub fn wait(self) -> T {
        match self.join() {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    pub(crate) fn join(self) -> thread::Result<T> {
        self.result.recv().expect("worker dropped a task result")
    }
}

impl ThreadPool {
    pub fn new(nthreads: usize) -> Self {
        assert!(nthreads > 0, "the number of threads should be positive");
        let state = Arc::new((
            Mutex::new(PoolState {
                tasks: VecDeque::new(),
                poisoned: false,
            }),
            Condvar::new(),
        ));
        let workers = (0..nthreads)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || worker_loop(&state))
            })
            .collect();
        ThreadPool { state, workers }
    }

    pub fn nthreads(&self) -> usize {
        self.workers.len()
    }

    /// Queues `func` and returns a future resolving to its return value.
    pub fn add_task<F, T>(&self, func: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let task: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(func));
            let _ = tx.send(result);
        });
        let (lock, cond) = &*self.state;
        {
            let mut state = lock.lock().unwrap();
            state.tasks.push_back(task);
        }
        cond.notify_one();
        TaskFuture { result: rx }
    }
}

fn worker_loop(state: &(Mutex<PoolState>, Condvar)) {
    let (lock, cond) = state;
    loop {
        let task = {
            let mut guard = lock.lock().unwrap();
            loop {
                if let Some(task) = guard.tasks.pop_front() {
                    break task;
                }
                if guard.poisoned {
                    return;
                }
                guard = cond.wait(guard).unwrap();
            }
        };
        task();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let (lock, cond) = &*self.state;
        lock.lock().unwrap().poisoned = true;
        cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
