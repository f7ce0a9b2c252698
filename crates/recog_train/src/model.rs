//! Model seam - compute context and the trainable sequence model

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use recog_engine::{RecognizerConfig, TextRecognizer};
use tracing::info;

use crate::converter::EncodedTargets;

/// The device the run executes on. Replication, if any, stays behind this type.
#[derive(Clone, Debug)]
pub struct ComputeContext {
    device: Device,
}

impl ComputeContext {
    pub fn detect() -> Self {
        info!("Initializing Device...");
        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        info!("Device initialized: {:?}", device);
        Self { device }
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Seeds the device RNG. Not every backend supports it (the CPU backend does not).
    pub fn seed(&self, seed: u64) {
        if let Err(e) = self.device.set_seed(seed) {
            tracing::debug!("Device RNG not seeded: {}", e);
        }
    }
}

/// A model the trainer can drive: predictions from images and encoded targets,
/// plus access to its named parameters.
pub trait SequenceModel {
    /// Returns `[batch, steps, num_class]` logits. Training mode uses teacher
    /// forcing; evaluation mode decodes greedily and returns detached outputs.
    fn forward(&self, images: &Tensor, targets: &EncodedTargets) -> candle_core::Result<Tensor>;

    fn varmap(&self) -> &VarMap;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

/// `TextRecognizer` with its parameter store.
pub struct RecognizerModel {
    varmap: VarMap,
    net: TextRecognizer,
    training: bool,
}

impl RecognizerModel {
    pub fn new(config: RecognizerConfig, ctx: &ComputeContext) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, ctx.device());
        let net = TextRecognizer::load(config, vb)?;
        Ok(Self {
            varmap,
            net,
            training: false,
        })
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.net.config
    }
}

impl SequenceModel for RecognizerModel {
    fn forward(&self, images: &Tensor, targets: &EncodedTargets) -> candle_core::Result<Tensor> {
        if self.training {
            self.net
                .forward_train(images, &targets.text, targets.positions.as_ref())
        } else {
            Ok(self.net.forward_greedy(images)?.detach())
        }
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

/// Parameters sorted by name, so every pass over them visits the same order.
pub fn named_parameters(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
