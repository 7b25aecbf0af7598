use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mimalloc::MiMalloc;

use rankmf::{DatasetReader, MetricsConfig, MetricsEngine, WalsConfig, WalsEngine};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Weighted ALS trainer for implicit feedback.
#[derive(Parser)]
#[command(name = "wals", version, rename_all = "snake_case")]
struct Args {
    /// number of epochs for ALS
    #[arg(long, default_value_t = 10)]
    nepochs: usize,

    /// dimension of learned factors
    #[arg(long, default_value_t = 30)]
    nfactors: usize,

    /// regularization param
    #[arg(long, default_value_t = 0.05)]
    regularization_lambda: f64,

    /// confidence weight
    #[arg(long, default_value_t = 40.0)]
    confidence_weight: f64,

    /// init distribution bound
    #[arg(long, default_value_t = 0.01)]
    init_distribution_bound: f64,

    /// number of threads for parallel execution
    #[arg(long, default_value_t = 16)]
    nthreads: usize,

    /// filename of training dataset
    #[arg(long, default_value = "")]
    train_dataset: String,

    /// filename of test dataset
    #[arg(long, default_value = "")]
    test_dataset: String,

    /// comma-separated list of test metrics (averaged per-user)
    #[arg(long, default_value = "")]
    test_avg_metrics: String,

    /// random seed for picking test users
    #[arg(long, default_value_t = 42)]
    eval_seed: i32,

    /// # users to use for computing test avg metrics (0 = all users)
    #[arg(long, default_value_t = 0)]
    num_test_users: usize,

    /// whether to compute test avg metrics after each epoch (if false, only
    /// computes at the end)
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    test_always: bool,

    /// filename of user factors
    #[arg(long, default_value = "")]
    user_factors: String,

    /// filename of item factors
    #[arg(long, default_value = "")]
    item_factors: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if args.user_factors.is_empty() || args.item_factors.is_empty() {
        warn!("missing model output filenames! (use options --user_factors/--item_factors)");
    }

    let config = WalsConfig {
        nepochs: args.nepochs,
        nfactors: args.nfactors,
        regularization_lambda: args.regularization_lambda,
        confidence_weight: args.confidence_weight,
        init_distribution_bound: args.init_distribution_bound,
    };
    let metrics_config = MetricsConfig {
        num_test_users: args.num_test_users,
        always_compute: args.test_always,
        seed: args.eval_seed,
    };
    let mut metrics_engine = MetricsEngine::new(metrics_config);
    for metric in args
        .test_avg_metrics
        .split(',')
        .filter(|name| !name.is_empty())
    {
        if !metrics_engine.add_test_avg_metric(metric) {
            bail!("metric {metric} is not available");
        }
    }

    let mut engine = WalsEngine::new(config, Some(metrics_engine), args.nthreads);

    info!("loading training data");
    let train_dataset = DatasetReader::open(&args.train_dataset)
        .with_context(|| format!("opening training dataset {}", args.train_dataset))?
        .read_all()?;
    engine.init(&train_dataset);

    if !args.test_dataset.is_empty() {
        info!("loading test data");
        let test_dataset = DatasetReader::open(&args.test_dataset)
            .with_context(|| format!("opening test dataset {}", args.test_dataset))?
            .read_all()?;
        engine.init_test(&test_dataset);
    }

    info!("training");
    engine.optimize();

    if !args.user_factors.is_empty() && !args.item_factors.is_empty() {
        info!("saving model output");
        engine
            .save_user_factors(&args.user_factors)
            .with_context(|| format!("writing user factors to {}", args.user_factors))?;
        engine
            .save_item_factors(&args.item_factors)
            .with_context(|| format!("writing item factors to {}", args.item_factors))?;
    }

    Ok(())
}
