//! Checkpoint Management - transplant, resume and snapshot persistence
//!
//! A checkpoint is `<stem>.safetensors` (parameters under `state_dict.`,
//! optimizer slots under `optimizer.`) plus a `<stem>.json` sidecar with the
//! step, best metrics and optimizer bookkeeping.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::optim::{OptimizerKind, OptimizerState, TrainOptimizer};
use super::state::TrainingState;
use crate::model::named_parameters;

const PARAM_PREFIX: &str = "state_dict.";
const OPTIM_PREFIX: &str = "optimizer.";

pub const BEST_ACCURACY_STEM: &str = "best_accuracy";
pub const BEST_NORM_ED_STEM: &str = "best_norm_ED";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OptimizerMeta {
    pub kind: OptimizerKind,
    pub step: usize,
}

/// Sidecar record. Every field is optional.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CheckpointMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_accuracy: Option<f64>,
    #[serde(rename = "best_norm_ED", default, skip_serializing_if = "Option::is_none")]
    pub best_norm_ed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
}

/// Snapshot read from or written to disk.
pub struct Checkpoint {
    pub parameters: HashMap<String, Tensor>,
    pub optimizer: Option<OptimizerState>,
    pub meta: CheckpointMeta,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// `foo`, `foo.safetensors` and `foo.json` all name the same checkpoint.
pub fn weights_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => path.to_path_buf(),
        Some("json") => path.with_extension("safetensors"),
        _ => PathBuf::from(format!("{}.safetensors", path.display())),
    }
}

fn sidecar_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", path.display()))
}

/// Writes the checkpoint under an exclusive lock. Both files go to temporary
/// siblings first and are renamed into place, sidecar before weights. The
/// weights file is the commit point: a reader never sees new weights next to
/// an older sidecar.
fn save_securely(tensors: &HashMap<String, Tensor>, meta: &CheckpointMeta, weights: &Path) -> Result<()> {
    let lock_path = format!("{}.lock", weights.display());
    let lock_file = File::create(&lock_path)?;
    lock_file.lock_exclusive()?;

    let sidecar = sidecar_path(weights);
    let weights_tmp = tmp_path(weights);
    let sidecar_tmp = tmp_path(&sidecar);

    let result = (|| -> Result<()> {
        candle_core::safetensors::save(tensors, &weights_tmp)
            .with_context(|| format!("Failed to write {:?}", weights_tmp))?;
        let file = File::create(&sidecar_tmp)?;
        serde_json::to_writer_pretty(file, meta)?;
        std::fs::rename(&sidecar_tmp, &sidecar)?;
        std::fs::rename(&weights_tmp, weights)?;
        Ok(())
    })();

    lock_file.unlock()?;
    let _ = std::fs::remove_file(&lock_path);
    result
}

impl Checkpoint {
    /// Reads a checkpoint. A missing sidecar yields a weights-only checkpoint.
    /// Parameters nested under `state_dict.` are preferred over a bare map.
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let weights = weights_path(path);
        let tensors = candle_core::safetensors::load(&weights, device)
            .with_context(|| format!("Failed to read checkpoint {:?}", weights))?;

        let sidecar = sidecar_path(&weights);
        let meta: CheckpointMeta = if sidecar.exists() {
            let file = File::open(&sidecar)?;
            serde_json::from_reader(file)
                .with_context(|| format!("Failed to parse checkpoint metadata {:?}", sidecar))?
        } else {
            CheckpointMeta::default()
        };

        let nested = tensors.keys().any(|k| k.starts_with(PARAM_PREFIX));
        let mut parameters = HashMap::new();
        let mut optim_tensors = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(PARAM_PREFIX) {
                parameters.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIM_PREFIX) {
                optim_tensors.insert(name.to_string(), tensor);
            } else if !nested {
                parameters.insert(key, tensor);
            }
        }

        let optimizer = meta.optimizer.as_ref().map(|m| OptimizerState {
            kind: m.kind,
            step: m.step,
            tensors: optim_tensors,
        });

        Ok(Self {
            parameters,
            optimizer,
            meta,
        })
    }

    /// Writes `<stem>.safetensors` and `<stem>.json`. Returns the weights path.
    pub fn write(&self, stem: &Path) -> Result<PathBuf> {
        let weights = weights_path(stem);
        let mut tensors = HashMap::new();
        for (name, t) in &self.parameters {
            tensors.insert(format!("{}{}", PARAM_PREFIX, name), t.clone());
        }
        if let Some(opt) = &self.optimizer {
            for (key, t) in &opt.tensors {
                tensors.insert(format!("{}{}", OPTIM_PREFIX, key), t.clone());
            }
        }
        save_securely(&tensors, &self.meta, &weights)?;
        Ok(weights)
    }
}

fn snapshot_parameters(varmap: &VarMap) -> HashMap<String, Tensor> {
    named_parameters(varmap)
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().detach()))
        .collect()
}

/// Parameters applied and skipped by a transplant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransplantReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct CheckpointManager {
    dir: PathBuf,
    save_interval: usize,
    device: Device,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, save_interval: usize, device: Device) -> Self {
        Self {
            dir: dir.into(),
            save_interval,
            device,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every checkpoint parameter whose name and shape match the model.
    /// A missing file is a no-op.
    pub fn transplant(&self, path: &Path, varmap: &VarMap) -> Result<Option<TransplantReport>> {
        let weights = weights_path(path);
        if !weights.exists() {
            warn!("Pretrained weights {:?} not found, training from scratch", weights);
            return Ok(None);
        }
        let checkpoint = Checkpoint::read(&weights, &self.device)?;

        let mut report = TransplantReport::default();
        let params: HashMap<String, _> = named_parameters(varmap).into_iter().collect();
        let mut names: Vec<&String> = checkpoint.parameters.keys().collect();
        names.sort();
        for name in names {
            let tensor = &checkpoint.parameters[name];
            match params.get(name) {
                Some(var) if var.shape() == tensor.shape() => {
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    report.applied.push(name.clone());
                }
                _ => report.skipped.push(name.clone()),
            }
        }

        info!(
            "Loaded pretrained weights from {:?} ({} applied, {} ignored)",
            weights,
            report.applied.len(),
            report.skipped.len()
        );
        Ok(Some(report))
    }

    /// Restores parameters, optimizer state, iteration and best metrics.
    /// Any failure is fatal: the checkpoint must exist and match the model exactly.
    pub fn resume(
        &self,
        path: &Path,
        varmap: &VarMap,
        optimizer: &mut TrainOptimizer,
        state: &mut TrainingState,
    ) -> Result<()> {
        let weights = weights_path(path);
        if !weights.exists() {
            bail!("Checkpoint to continue from not found: {:?}", weights);
        }
        info!("loading pretrained model from {:?}", weights);
        let checkpoint = Checkpoint::read(&weights, &self.device)?;
        if checkpoint.parameters.is_empty() {
            bail!("Checkpoint {:?} holds no parameters", weights);
        }

        let params = named_parameters(varmap);
        let mut missing = Vec::new();
        for (name, var) in &params {
            match checkpoint.parameters.get(name) {
                Some(t) if t.shape() == var.shape() => {}
                Some(t) => bail!(
                    "Parameter '{}' has shape {:?} in checkpoint, {:?} in model",
                    name,
                    t.shape(),
                    var.shape()
                ),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            bail!("Checkpoint {:?} is missing parameters: {:?}", weights, missing);
        }
        let extra: Vec<&String> = checkpoint
            .parameters
            .keys()
            .filter(|k| !params.iter().any(|(n, _)| n == *k))
            .collect();
        if !extra.is_empty() {
            bail!("Checkpoint {:?} has unexpected parameters: {:?}", weights, extra);
        }

        for (name, var) in &params {
            var.set(&checkpoint.parameters[name].to_dtype(var.dtype())?)?;
        }

        if let Some(opt_state) = &checkpoint.optimizer {
            optimizer.load_state(opt_state)?;
            info!("Optimizer state restored ({:?}, step {})", opt_state.kind, opt_state.step);
        }
        if let Some(step) = checkpoint.meta.step {
            state.iteration = step + 1;
            info!("continue to train start_iter: {}", state.iteration);
        }
        state.restore_bests(checkpoint.meta.best_accuracy, checkpoint.meta.best_norm_ed);
        Ok(())
    }

    pub fn is_periodic(&self, iteration: usize) -> bool {
        (iteration + 1) % self.save_interval == 0
    }

    /// Full snapshot `iter_{iteration + 1}` with `step = iteration`.
    pub fn save_periodic(
        &self,
        iteration: usize,
        varmap: &VarMap,
        optimizer: &TrainOptimizer,
        state: &TrainingState,
    ) -> Result<PathBuf> {
        let opt_state = optimizer.state();
        let checkpoint = Checkpoint {
            parameters: snapshot_parameters(varmap),
            meta: CheckpointMeta {
                step: Some(iteration),
                best_accuracy: finite(state.best_accuracy()),
                best_norm_ed: finite(state.best_norm_ed()),
                optimizer: Some(OptimizerMeta {
                    kind: opt_state.kind,
                    step: opt_state.step,
                }),
                saved_at: Some(chrono::Local::now().to_rfc3339()),
            },
            optimizer: Some(opt_state),
        };
        let path = checkpoint.write(&self.dir.join(format!("iter_{}", iteration + 1)))?;
        info!("Saved checkpoint {:?}", path);
        Ok(path)
    }

    pub fn save_best_accuracy(&self, varmap: &VarMap, state: &TrainingState) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            parameters: snapshot_parameters(varmap),
            optimizer: None,
            meta: CheckpointMeta {
                best_accuracy: finite(state.best_accuracy()),
                saved_at: Some(chrono::Local::now().to_rfc3339()),
                ..Default::default()
            },
        };
        checkpoint.write(&self.dir.join(BEST_ACCURACY_STEM))
    }

    pub fn save_best_norm_ed(&self, varmap: &VarMap, state: &TrainingState) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            parameters: snapshot_parameters(varmap),
            optimizer: None,
            meta: CheckpointMeta {
                best_norm_ed: finite(state.best_norm_ed()),
                saved_at: Some(chrono::Local::now().to_rfc3339()),
                ..Default::default()
            },
        };
        checkpoint.write(&self.dir.join(BEST_NORM_ED_STEM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::optim::Adadelta;
    use candle_core::DType;
    use candle_nn::Init;
    use tempfile::tempdir;

    fn model() -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "head.weight", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(2, "head.bias", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        named_parameters(varmap)
            .into_iter()
            .find(|(n, _)| n == name)
            .unwrap()
            .1
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    fn adadelta(varmap: &VarMap) -> TrainOptimizer {
        TrainOptimizer::Adadelta(Adadelta::new(named_parameters(varmap), 1.0, 0.95, 1e-8))
    }

    #[test]
    fn test_transplant_applies_only_matching_shapes() {
        let dir = tempdir().unwrap();
        let mut params = HashMap::new();
        params.insert(
            "head.weight".to_string(),
            Tensor::full(9f32, (4, 3), &Device::Cpu).unwrap(),
        );
        params.insert("head.bias".to_string(), Tensor::full(7f32, 2, &Device::Cpu).unwrap());
        let source = Checkpoint {
            parameters: params,
            optimizer: None,
            meta: CheckpointMeta::default(),
        };
        let path = source.write(&dir.path().join("pretrained")).unwrap();

        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let report = manager.transplant(&path, &varmap).unwrap().unwrap();
        assert_eq!(report.applied, vec!["head.bias".to_string()]);
        assert_eq!(report.skipped, vec!["head.weight".to_string()]);
        assert_eq!(values(&varmap, "head.bias"), vec![7.0; 2]);
        assert_eq!(values(&varmap, "head.weight"), vec![0.5; 6]);
    }

    #[test]
    fn test_transplant_reads_bare_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("head.bias".to_string(), Tensor::full(3f32, 2, &Device::Cpu).unwrap());
        tensors.insert("other".to_string(), Tensor::full(3f32, 1, &Device::Cpu).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let report = manager.transplant(&path, &varmap).unwrap().unwrap();
        assert_eq!(report.applied, vec!["head.bias".to_string()]);
        assert_eq!(report.skipped, vec!["other".to_string()]);
    }

    #[test]
    fn test_transplant_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let report = manager.transplant(&dir.path().join("nope"), &model()).unwrap();
        assert!(report.is_none());
    }

    #[test]
    fn test_resume_missing_file_fails() {
        let dir = tempdir().unwrap();
        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut state = TrainingState::new();
        let mut opt = adadelta(&varmap);
        assert!(manager
            .resume(&dir.path().join("nope"), &varmap, &mut opt, &mut state)
            .is_err());
    }

    #[test]
    fn test_resume_sets_next_iteration_and_bests() {
        let dir = tempdir().unwrap();
        let mut params = HashMap::new();
        params.insert("head.weight".to_string(), Tensor::full(1f32, (2, 3), &Device::Cpu).unwrap());
        params.insert("head.bias".to_string(), Tensor::full(2f32, 2, &Device::Cpu).unwrap());
        let source = Checkpoint {
            parameters: params,
            optimizer: None,
            meta: CheckpointMeta {
                step: Some(999),
                best_accuracy: Some(0.87),
                ..Default::default()
            },
        };
        let path = source.write(&dir.path().join("iter_1000")).unwrap();

        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut state = TrainingState::new();
        let mut opt = adadelta(&varmap);
        manager.resume(&path, &varmap, &mut opt, &mut state).unwrap();
        assert_eq!(state.iteration, 1000);
        assert_eq!(state.best_accuracy(), 0.87);
        assert!(state.best_norm_ed().is_infinite());
        assert_eq!(values(&varmap, "head.bias"), vec![2.0; 2]);
    }

    #[test]
    fn test_resume_rejects_incomplete_parameters() {
        let dir = tempdir().unwrap();
        let mut params = HashMap::new();
        params.insert("head.bias".to_string(), Tensor::full(2f32, 2, &Device::Cpu).unwrap());
        let source = Checkpoint {
            parameters: params,
            optimizer: None,
            meta: CheckpointMeta::default(),
        };
        let path = source.write(&dir.path().join("partial")).unwrap();

        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut state = TrainingState::new();
        let mut opt = adadelta(&varmap);
        assert!(manager.resume(&path, &varmap, &mut opt, &mut state).is_err());
    }

    #[test]
    fn test_rewrite_replaces_both_files() {
        let dir = tempdir().unwrap();
        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut state = TrainingState::new();

        state.offer_accuracy(0.4);
        manager.save_best_accuracy(&varmap, &state).unwrap();
        named_parameters(&varmap)[0]
            .1
            .set(&Tensor::full(3f32, 2, &Device::Cpu).unwrap())
            .unwrap();
        state.offer_accuracy(0.6);
        let path = manager.save_best_accuracy(&varmap, &state).unwrap();

        let read = Checkpoint::read(&path, &Device::Cpu).unwrap();
        assert_eq!(read.meta.best_accuracy, Some(0.6));
        assert_eq!(
            read.parameters["head.bias"].to_vec1::<f32>().unwrap(),
            vec![3.0; 2]
        );

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["best_accuracy.json".to_string(), "best_accuracy.safetensors".to_string()]
        );
    }

    #[test]
    fn test_periodic_round_trip_restores_optimizer() {
        let dir = tempdir().unwrap();
        let varmap = model();
        let manager = CheckpointManager::new(dir.path(), 1000, Device::Cpu);
        let mut opt = adadelta(&varmap);

        let params = named_parameters(&varmap);
        let loss = params[0].1.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();

        let mut state = TrainingState::new();
        state.offer_accuracy(0.25);
        assert!(manager.is_periodic(999));
        assert!(!manager.is_periodic(1000));
        let path = manager.save_periodic(999, &varmap, &opt, &state).unwrap();
        assert!(path.ends_with("iter_1000.safetensors"));

        let sidecar: serde_json::Value =
            serde_json::from_reader(File::open(path.with_extension("json")).unwrap()).unwrap();
        assert_eq!(sidecar["step"], 999);
        assert!(sidecar.get("best_norm_ED").is_none());

        let restored_map = model();
        let mut restored_opt = adadelta(&restored_map);
        let mut restored = TrainingState::new();
        manager
            .resume(&path, &restored_map, &mut restored_opt, &mut restored)
            .unwrap();
        assert_eq!(restored.iteration, 1000);
        assert_eq!(restored.best_accuracy(), 0.25);
        assert_eq!(restored_opt.state().step, 1);
        assert_eq!(restored_opt.state().tensors.len(), opt.state().tensors.len());
    }
}
