//! Training Loop - setup, iteration, validation cadence and periodic snapshots

use anyhow::{bail, Context, Result};
use candle_core::Var;
use indicatif::{ProgressBar, ProgressStyle};
use recog_engine::RecognizerConfig;
use std::path::{Path, PathBuf};
use tracing::info;

use super::args::TrainArgs;
use super::checkpoint::CheckpointManager;
use super::init::ParameterInitializer;
use super::optim::TrainOptimizer;
use super::state::TrainingState;
use super::validation::{BestModelTracker, DatasetValidator, RunLog, Validator};
use super::variant::VariantStrategy;
use crate::config::TrainingConfig;
use crate::data::{hierarchical_dataset, AlignCollate, BalancedBatchLoader, Batch, BatchSource, LabelFilter, ValidationLoader};
use crate::model::{count_parameters, named_parameters, ComputeContext, RecognizerModel, SequenceModel};

/// What a call to [`Trainer::run`] did.
#[derive(Debug)]
pub struct RunSummary {
    pub start_iter: usize,
    pub iterations_run: usize,
    pub validations: usize,
    pub periodic_checkpoints: Vec<PathBuf>,
    pub state: TrainingState,
}

pub struct Trainer<M: SequenceModel> {
    config: TrainingConfig,
    ctx: ComputeContext,
    model: M,
    strategy: VariantStrategy,
    optimizer: TrainOptimizer,
    params: Vec<(String, Var)>,
    checkpoints: CheckpointManager,
    tracker: BestModelTracker,
    state: TrainingState,
}

impl<M: SequenceModel> Trainer<M> {
    /// Initializes parameters, writes the options log, builds the optimizer,
    /// then applies the optional transplant and resume.
    pub fn setup(config: TrainingConfig, ctx: ComputeContext, strategy: VariantStrategy, mut model: M) -> Result<Self> {
        config.validate()?;
        let dir = config.experiment_dir();
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let params = named_parameters(model.varmap());
        ParameterInitializer::new(config.manual_seed).apply(&params)?;
        info!("Trainable params num : {}", count_parameters(model.varmap()));

        let mut optimizer = strategy.build_optimizer(&config, params.clone());
        config.write_options_log()?;

        let checkpoints = CheckpointManager::new(&dir, config.save_interval, ctx.device().clone());
        let mut state = TrainingState::new();
        if let Some(path) = &config.load_weights {
            checkpoints.transplant(Path::new(path), model.varmap())?;
        }
        if let Some(path) = &config.continue_model {
            checkpoints.resume(Path::new(path), model.varmap(), &mut optimizer, &mut state)?;
        }

        model.set_training(true);
        info!(
            "Model size: {:.6} M",
            count_parameters(model.varmap()) as f64 / 1e6
        );
        optimizer.set_schedule_step(state.iteration);

        let tracker = BestModelTracker::new(RunLog::new(dir.join("log_train.txt")), config.num_iter);
        Ok(Self {
            config,
            ctx,
            model,
            strategy,
            optimizer,
            params,
            checkpoints,
            tracker,
            state,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &TrainOptimizer {
        &self.optimizer
    }

    /// Forward, loss, backward and update for one batch. Returns the loss.
    pub fn train_step(&mut self, batch: Batch) -> Result<f64> {
        let device = self.ctx.device();
        let images = batch.images.to_device(device)?;
        let targets = self.strategy.encode_targets(&batch.labels, device)?;

        let preds = self.model.forward(&images, &targets)?;
        let loss = self.strategy.compute_loss(&preds, &targets)?;

        // A fresh gradient store every step; nothing carries over
        let grads = loss.backward()?;
        self.strategy
            .apply_update(&mut self.optimizer, &self.params, grads, self.config.grad_clip)?;

        let value = loss.to_scalar::<f32>()? as f64;
        self.state.running_loss.add(value);
        Ok(value)
    }

    /// Runs iterations `start..num_iter`, validating every `val_interval`
    /// iterations and snapshotting every `save_interval`.
    pub fn run(&mut self, source: &mut dyn BatchSource, validator: &mut dyn Validator) -> Result<RunSummary> {
        let start_iter = self.state.iteration;
        let num_iter = self.config.num_iter;
        let mut validations = 0;
        let mut periodic_checkpoints = Vec::new();

        if start_iter >= num_iter {
            info!("Nothing to do: start_iter {} >= num_iter {}", start_iter, num_iter);
        }

        let pb = ProgressBar::new(num_iter.saturating_sub(start_iter) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );

        for i in start_iter..num_iter {
            self.state.iteration = i;
            let batch = source.next_batch()?;
            let loss = self.train_step(batch)?;

            if (i + 1) % self.config.val_interval == 0 {
                pb.suspend(|| -> Result<()> {
                    self.tracker.run(
                        i,
                        &mut self.state,
                        &mut self.model,
                        &self.strategy,
                        &mut *validator,
                        &self.checkpoints,
                    )?;
                    Ok(())
                })?;
                validations += 1;
            }

            if self.checkpoints.is_periodic(i) {
                let path = self
                    .checkpoints
                    .save_periodic(i, self.model.varmap(), &self.optimizer, &self.state)?;
                periodic_checkpoints.push(path);
            }

            pb.set_message(format!("loss {:.4}", loss));
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.state.iteration = self.state.iteration.max(num_iter);
        let iterations_run = num_iter.saturating_sub(start_iter);
        info!(
            "Training finished: {} iterations, {} validations, {} checkpoints",
            iterations_run,
            validations,
            periodic_checkpoints.len()
        );
        Ok(RunSummary {
            start_iter,
            iterations_run,
            validations,
            periodic_checkpoints,
            state: self.state.clone(),
        })
    }
}

/// Main training function
pub fn run(args: TrainArgs) -> Result<()> {
    let config = TrainingConfig::from_args(&args)?;
    info!("--- Text Recognition Training ---");
    info!(
        "Variant: {:?}, Batch={}, Iterations={}, ValInterval={}",
        config.variant, config.batch_size, config.num_iter, config.val_interval
    );

    let ctx = ComputeContext::detect();
    ctx.seed(config.manual_seed);

    let mut train_source = BalancedBatchLoader::new(&config)?;

    let filter = LabelFilter::new(&config.character, config.sensitive, config.batch_max_length);
    let valid_samples = hierarchical_dataset(Path::new(&config.valid_data), "/", &filter)?;
    if valid_samples.is_empty() {
        bail!("No validation samples under {:?}", config.valid_data);
    }
    info!("Validation samples: {}", valid_samples.len());
    let collate = AlignCollate::new(config.img_h, config.img_w, config.input_channel == 3, config.pad);
    let mut validator = DatasetValidator::new(
        ValidationLoader::new(valid_samples, collate, config.batch_size),
        ctx.device().clone(),
    );

    let strategy = VariantStrategy::from_config(&config);
    let model_config = RecognizerConfig {
        input_channel: config.input_channel,
        output_channel: config.output_channel,
        hidden_size: config.hidden_size,
        num_class: strategy.converter().num_classes(),
        batch_max_length: config.batch_max_length,
        head: config.variant.head_kind(),
        start_token: strategy.converter().start_index(),
    };
    info!(
        "model input parameters {} {} {} {} {} {} {} {:?}",
        config.img_h,
        config.img_w,
        model_config.input_channel,
        model_config.output_channel,
        model_config.hidden_size,
        model_config.num_class,
        model_config.batch_max_length,
        model_config.head
    );
    let model = RecognizerModel::new(model_config, &ctx)?;

    let mut trainer = Trainer::setup(config, ctx, strategy, model)?;
    trainer.run(&mut train_source, &mut validator)?;
    Ok(())
}
