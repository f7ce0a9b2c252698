//! Training Arguments - CLI configuration for training

use clap::Args;

use crate::config::{Prediction, SequenceModeling};

/// Training configuration from command line arguments
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Where to store logs and models (derived from the stages when omitted)
    #[arg(long)]
    pub experiment_name: Option<String>,

    #[arg(long, default_value = "data/training")]
    pub train_data: String,

    #[arg(long, default_value = "data/validation")]
    pub valid_data: String,

    #[arg(long, default_value_t = 1111)]
    pub manual_seed: u64,

    /// Batch prefetch threads (0 = build batches on the training thread)
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = 196)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 300_000)]
    pub num_iter: usize,

    #[arg(long, default_value_t = 1000)]
    pub val_interval: usize,

    #[arg(long, default_value_t = 1000)]
    pub save_interval: usize,

    /// Checkpoint to resume training from
    #[arg(long)]
    pub continue_model: Option<String>,

    /// Pretrained weights; layers that do not match in name or shape are ignored
    #[arg(long)]
    pub load_weights: Option<String>,

    /// Use Adam (default is Adadelta)
    #[arg(long, action)]
    pub adam: bool,

    #[arg(long, default_value_t = 1.0)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.9)]
    pub beta1: f64,

    /// Decay rate for Adadelta
    #[arg(long, default_value_t = 0.95)]
    pub rho: f64,

    #[arg(long, default_value_t = 1e-8)]
    pub eps: f64,

    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f64,

    /// Training selections under train_data, '-' separated ('/' = everything)
    #[arg(long, default_value = "MJ-ST")]
    pub select_data: String,

    /// Share of each selection in a batch, '-' separated
    #[arg(long, default_value = "0.5-0.5")]
    pub batch_ratio: String,

    #[arg(long, default_value_t = 1.0)]
    pub total_data_usage_ratio: f64,

    #[arg(long, default_value_t = 25)]
    pub batch_max_length: usize,

    #[arg(long, default_value_t = 32)]
    pub img_h: usize,

    #[arg(long, default_value_t = 100)]
    pub img_w: usize,

    #[arg(long, action)]
    pub rgb: bool,

    #[arg(long, default_value = "0123456789abcdefghijklmnopqrstuvwxyz")]
    pub character: String,

    /// Case-sensitive mode (94 printable characters)
    #[arg(long, action)]
    pub sensitive: bool,

    /// Keep aspect ratio and pad when resizing
    #[arg(long, action)]
    pub pad: bool,

    #[arg(long, value_enum)]
    pub sequence_modeling: Option<SequenceModeling>,

    #[arg(long, value_enum)]
    pub prediction: Option<Prediction>,

    #[arg(long, default_value_t = 512)]
    pub output_channel: usize,

    #[arg(long, default_value_t = 256)]
    pub hidden_size: usize,

    /// Model width used by the warmup schedule
    #[arg(long, default_value_t = 512)]
    pub d_model: usize,

    #[arg(long, default_value_t = 16_000)]
    pub n_warmup_steps: usize,

    #[arg(long, action)]
    pub use_scheduled_optim: bool,

    #[arg(long, action)]
    pub label_smoothing: bool,

    #[arg(long, default_value = "saved_models")]
    pub output_dir: String,
}
