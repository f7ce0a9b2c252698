//! Training Module - orchestration core
//!
//! - args: CLI arguments
//! - variant: per-variant targets, loss and optimizer policy
//! - loss / optim / init: numerical building blocks
//! - state / checkpoint / validation: run bookkeeping and persistence
//! - training_loop: the trainer

pub mod args;
pub mod checkpoint;
pub mod init;
pub mod loss;
pub mod optim;
pub mod state;
pub mod training_loop;
pub mod validation;
pub mod variant;

pub use args::TrainArgs;
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMeta};
pub use state::TrainingState;
pub use training_loop::{run, RunSummary, Trainer};
pub use validation::{BestModelTracker, DatasetValidator, ValidationReport, Validator};
pub use variant::{DecodingVariant, UpdateRule, VariantStrategy};
