//! Validation & Best-Model Tracking

use anyhow::{bail, Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use super::checkpoint::CheckpointManager;
use super::state::TrainingState;
use super::variant::VariantStrategy;
use crate::data::ValidationSource;
use crate::metrics::{norm_ed, Averager};
use crate::model::SequenceModel;

/// Lines of the run log that show sample predictions.
const SAMPLES_SHOWN: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub loss: f64,
    /// Exact-match fraction in `[0, 1]`
    pub accuracy: f64,
    /// Mean normalized edit distance, lower is better
    pub norm_ed: f64,
    /// Decoded predictions, terminators included
    pub predictions: Vec<String>,
    pub ground_truths: Vec<String>,
    /// Seconds spent in forward passes
    pub infer_time: f64,
    pub sample_count: usize,
}

pub trait Validator {
    fn validate(&mut self, model: &dyn SequenceModel, strategy: &VariantStrategy) -> Result<ValidationReport>;
}

/// Full pass over a validation source.
pub struct DatasetValidator<S: ValidationSource> {
    source: S,
    device: Device,
}

impl<S: ValidationSource> DatasetValidator<S> {
    pub fn new(source: S, device: Device) -> Self {
        Self { source, device }
    }
}

impl<S: ValidationSource> Validator for DatasetValidator<S> {
    fn validate(&mut self, model: &dyn SequenceModel, strategy: &VariantStrategy) -> Result<ValidationReport> {
        let mut loss_avg = Averager::new();
        let mut report = ValidationReport::default();
        let mut correct = 0usize;
        let mut ed_sum = 0f64;

        for batch in self.source.batches() {
            let batch = batch?;
            let images = batch.images.to_device(&self.device)?;
            let targets = strategy.encode_targets(&batch.labels, &self.device)?;

            let start = Instant::now();
            let preds = model.forward(&images, &targets)?;
            let decoded = strategy.decode_predictions(&preds)?;
            report.infer_time += start.elapsed().as_secs_f64();

            let cost = strategy.compute_loss(&preds, &targets)?;
            loss_avg.add_weighted(cost.to_scalar::<f32>()? as f64, batch.len());

            for (pred, gt) in decoded.into_iter().zip(batch.labels) {
                let stripped = strategy.strip_terminator(&pred);
                let gt_stripped = strategy.strip_terminator(&gt);
                if stripped == gt_stripped {
                    correct += 1;
                }
                ed_sum += norm_ed(stripped, gt_stripped);
                report.predictions.push(pred);
                report.ground_truths.push(gt);
            }
        }

        report.sample_count = report.predictions.len();
        if report.sample_count == 0 {
            bail!("Validation pass produced no samples");
        }
        report.loss = loss_avg.val();
        report.accuracy = correct as f64 / report.sample_count as f64;
        report.norm_ed = ed_sum / report.sample_count as f64;
        Ok(report)
    }
}

/// Append-only human-readable training log.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, lines: &[String]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open run log {:?}", self.path))?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

/// Which best-metric snapshots a validation produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BestUpdate {
    pub accuracy: bool,
    pub norm_ed: bool,
}

pub struct BestModelTracker {
    run_log: RunLog,
    num_iter: usize,
    started: Instant,
}

impl BestModelTracker {
    pub fn new(run_log: RunLog, num_iter: usize) -> Self {
        Self {
            run_log,
            num_iter,
            started: Instant::now(),
        }
    }

    /// One validation cycle at `iteration` (0-based): log the running loss,
    /// validate in eval mode, log samples and metrics, save improved bests.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &mut self,
        iteration: usize,
        state: &mut TrainingState,
        model: &mut dyn SequenceModel,
        strategy: &VariantStrategy,
        validator: &mut dyn Validator,
        checkpoints: &CheckpointManager,
    ) -> Result<BestUpdate> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let tag = format!("[{}/{}]", iteration + 1, self.num_iter);
        let loss_line = format!(
            "{} Loss: {:0.5} elapsed_time: {:0.5}",
            tag,
            state.running_loss.val(),
            elapsed
        );
        info!("{}", loss_line);
        state.running_loss.reset();

        model.set_training(false);
        let report = validator.validate(&*model, strategy);
        model.set_training(true);
        let report = report?;

        let mut lines = vec![loss_line];
        for (pred, gt) in report
            .predictions
            .iter()
            .zip(&report.ground_truths)
            .take(SAMPLES_SHOWN)
        {
            let pred = strategy.strip_terminator(pred);
            let gt = strategy.strip_terminator(gt);
            let line = format!("{:20}, gt: {:20},   {}", pred, gt, pred == gt);
            info!("{}", line);
            lines.push(line);
        }

        let valid_line = format!(
            "{} valid loss: {:0.5} accuracy: {:0.3}, norm_ED: {:0.2}",
            tag, report.loss, report.accuracy, report.norm_ed
        );
        info!("{} ({} samples, {:.3}s inference)", valid_line, report.sample_count, report.infer_time);
        lines.push(valid_line);

        let update = self.record(state, &report, model.varmap(), checkpoints)?;

        let best_line = format!(
            "best_accuracy: {:0.3}, best_norm_ED: {:0.2}",
            state.best_accuracy(),
            state.best_norm_ed()
        );
        info!("{}", best_line);
        lines.push(best_line);

        self.run_log.append(&lines)?;
        Ok(update)
    }

    /// Updates the bests from `report`; each improved metric gets its own snapshot.
    pub fn record(
        &self,
        state: &mut TrainingState,
        report: &ValidationReport,
        varmap: &VarMap,
        checkpoints: &CheckpointManager,
    ) -> Result<BestUpdate> {
        let mut update = BestUpdate::default();
        if state.offer_accuracy(report.accuracy) {
            let path = checkpoints.save_best_accuracy(varmap, state)?;
            info!("New best accuracy {:0.3} saved to {:?}", report.accuracy, path);
            update.accuracy = true;
        }
        if state.offer_norm_ed(report.norm_ed) {
            let path = checkpoints.save_best_norm_ed(varmap, state)?;
            info!("New best norm_ED {:0.2} saved to {:?}", report.norm_ed, path);
            update.norm_ed = true;
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::EncodedTargets;
    use crate::data::Batch;
    use crate::train::variant::DecodingVariant;
    use candle_core::{DType, Tensor};
    use candle_nn::Init;
    use tempfile::tempdir;

    fn report(accuracy: f64, norm_ed: f64) -> ValidationReport {
        ValidationReport {
            accuracy,
            norm_ed,
            ..Default::default()
        }
    }

    #[test]
    fn test_best_writes_follow_improvements() {
        let dir = tempdir().unwrap();
        let varmap = VarMap::new();
        varmap
            .get(3, "w.weight", Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let tracker = BestModelTracker::new(RunLog::new(dir.path().join("log_train.txt")), 100);
        let mut state = TrainingState::new();

        let accuracies = [0.5, 0.6, 0.55, 0.7];
        let norm_eds = [0.4, 0.4, 0.3, 0.5];
        let mut acc_writes = Vec::new();
        let mut ed_writes = Vec::new();
        for (i, (&a, &e)) in accuracies.iter().zip(&norm_eds).enumerate() {
            let update = tracker.record(&mut state, &report(a, e), &varmap, &manager).unwrap();
            if update.accuracy {
                acc_writes.push(i);
            }
            if update.norm_ed {
                ed_writes.push(i);
            }
        }

        assert_eq!(acc_writes, vec![0, 1, 3]);
        assert_eq!(ed_writes, vec![0, 2]);
        assert_eq!(state.best_accuracy(), 0.7);
        assert_eq!(state.best_norm_ed(), 0.3);
        assert!(dir.path().join("best_accuracy.safetensors").exists());
        assert!(dir.path().join("best_norm_ED.safetensors").exists());

        let sidecar: serde_json::Value = serde_json::from_reader(
            std::fs::File::open(dir.path().join("best_accuracy.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar["best_accuracy"], 0.7);
        assert!(sidecar.get("best_norm_ED").is_none());
    }

    /// Uniform logits over four columns, whatever the image.
    struct UniformModel {
        varmap: VarMap,
        training: bool,
    }

    impl UniformModel {
        fn new() -> Self {
            let varmap = VarMap::new();
            varmap
                .get(3, "head.weight", Init::Const(1.0), DType::F32, &Device::Cpu)
                .unwrap();
            Self {
                varmap,
                training: true,
            }
        }
    }

    impl SequenceModel for UniformModel {
        fn forward(&self, images: &Tensor, _targets: &EncodedTargets) -> candle_core::Result<Tensor> {
            Tensor::zeros((images.dim(0)?, 4, 3), DType::F32, &Device::Cpu)
        }

        fn varmap(&self) -> &VarMap {
            &self.varmap
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    fn batch(labels: &[&str]) -> Batch {
        Batch {
            images: Tensor::zeros((labels.len(), 1, 4, 4), DType::F32, &Device::Cpu).unwrap(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ctc() -> VariantStrategy {
        VariantStrategy::new(DecodingVariant::AlignmentFree, "ab", 4, false)
    }

    #[test]
    fn test_empty_validation_set_leaves_bests_alone() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut tracker = BestModelTracker::new(RunLog::new(dir.path().join("log_train.txt")), 100);
        let mut state = TrainingState::new();
        let mut model = UniformModel::new();
        let mut validator = DatasetValidator::new(Vec::<Batch>::new(), Device::Cpu);

        let result = tracker.run(9, &mut state, &mut model, &ctc(), &mut validator, &manager);
        assert!(result.is_err());
        assert!(model.is_training());
        assert_eq!(state.best_accuracy(), -1.0);
        assert!(state.best_norm_ed().is_infinite());
        assert!(!dir.path().join("best_norm_ED.safetensors").exists());
        assert!(!dir.path().join("best_accuracy.safetensors").exists());
    }

    #[test]
    fn test_validation_loss_is_weighted_by_batch_size() {
        let strategy = ctc();
        let model = UniformModel::new();
        let batches = vec![batch(&["a", "b"]), batch(&["ab"])];

        let per_batch: Vec<f64> = batches
            .iter()
            .map(|b| {
                let targets = strategy.encode_targets(&b.labels, &Device::Cpu).unwrap();
                let preds = model.forward(&b.images, &targets).unwrap();
                strategy
                    .compute_loss(&preds, &targets)
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap() as f64
            })
            .collect();
        let expected = (2.0 * per_batch[0] + per_batch[1]) / 3.0;

        let mut validator = DatasetValidator::new(batches, Device::Cpu);
        let report = validator.validate(&model, &strategy).unwrap();
        assert_eq!(report.sample_count, 3);
        assert!((report.loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_run_log_appends() {
        let dir = tempdir().unwrap();
        let log = RunLog::new(dir.path().join("log_train.txt"));
        log.append(&["one".to_string()]).unwrap();
        log.append(&["two".to_string(), "three".to_string()]).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "one\ntwo\nthree\n");
    }
}
