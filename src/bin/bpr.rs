use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mimalloc::MiMalloc;

use rankmf::{BprConfig, BprEngine, DatasetReader, MetricsConfig, MetricsEngine};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Bayesian Personalised Ranking trainer for implicit feedback.
#[derive(Parser)]
#[command(name = "bpr", version, rename_all = "snake_case")]
struct Args {
    /// number of epochs for SGD
    #[arg(long, default_value_t = 10)]
    nepochs: usize,

    /// dimension of learned factors
    #[arg(long, default_value_t = 30)]
    nfactors: usize,

    /// initial learning rate
    #[arg(long, default_value_t = 0.05)]
    init_learning_rate: f64,

    /// regularization on biases
    #[arg(long, default_value_t = 1.0)]
    bias_lambda: f64,

    /// regularization on user factors
    #[arg(long, default_value_t = 0.025)]
    user_lambda: f64,

    /// regularization on item factors
    #[arg(long, default_value_t = 0.0025)]
    item_lambda: f64,

    /// decay rate on learning rate
    #[arg(long, default_value_t = 0.9)]
    decay_rate: f64,

    /// use bias term
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    use_biases: bool,

    /// init distribution bound
    #[arg(long, default_value_t = 0.01)]
    init_distribution_bound: f64,

    /// number of negative items to sample for each positive item
    #[arg(long, default_value_t = 3)]
    num_negative_samples: usize,

    /// number of parallel threads for hogwild
    #[arg(long, default_value_t = 1)]
    num_hogwild_threads: usize,

    /// shuffle training set after each epoch
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    shuffle_training_set: bool,

    /// number of negatives generated per positive in evaluation
    #[arg(long, default_value_t = 3)]
    eval_num_neg: usize,

    /// random seed for generating evaluation set and test users
    #[arg(long, default_value_t = 42)]
    eval_seed: i32,

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

    let config = BprConfig {
        nepochs: args.nepochs,
        nfactors: args.nfactors,
        init_learning_rate: args.init_learning_rate,
        bias_lambda: args.bias_lambda,
        user_lambda: args.user_lambda,
        item_lambda: args.item_lambda,
        decay_rate: args.decay_rate,
        use_biases: args.use_biases,
        init_distribution_bound: args.init_distribution_bound,
        num_negative_samples: args.num_negative_samples,
        num_hogwild_threads: args.num_hogwild_threads,
        shuffle_training_set: args.shuffle_training_set,
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

    let mut engine = BprEngine::new(
        config,
        Some(metrics_engine),
        args.eval_num_neg,
        args.eval_seed,
        args.nthreads,
    );

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
