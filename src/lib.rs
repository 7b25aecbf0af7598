//! Low-rank latent-factor models for implicit feedback.
//!
//! Two training cores over a shared substrate: [`bpr`] learns by pairwise
//! ranking SGD on sampled (user, positive, negative) triplets, optionally
//! hogwild-parallel; [`wals`] alternates exact closed-form row solves with
//! the Hu–Koren–Volinsky confidence weighting. Both score a (user, item)
//! pair as `bias_i + <p_u, q_i>` and share the id remapping, evaluation
//! harness and thread-pool-backed parallel executor.

pub mod bpr;
pub mod dataset;
pub mod engine;
pub mod executor;
pub mod factors;
pub mod id_index;
pub mod linalg;
pub mod metrics;
pub mod metrics_engine;
pub mod thread_pool;
pub mod wals;

pub use bpr::{BprConfig, BprEngine};
pub use dataset::{DatasetError, DatasetReader, Interaction};
pub use executor::ParallelExecutor;
pub use factors::FactorData;
pub use id_index::IdIndex;
pub use linalg::{linear_symmetric_solve, Matrix, Vector};
pub use metrics_engine::{MetricsConfig, MetricsEngine};
pub use thread_pool::ThreadPool;
pub use wals::{WalsConfig, WalsEngine};
