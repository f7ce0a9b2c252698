//! Decoding Variants - per-variant targets, loss, optimizer and update policy
//!
//! All variant branching lives here. The trainer asks the strategy and never
//! matches on the variant itself.

use anyhow::{bail, Result};
use candle_core::{backprop::GradStore, Device, Tensor, Var, D};
use candle_nn::ops;
use recog_engine::HeadKind;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::loss::{ctc_loss, cross_entropy_ignore_index, label_smoothed_loss, LABEL_SMOOTHING_EPS};
use super::optim::{clip_grad_norm, Adadelta, Adam, TrainOptimizer, WarmupScheduler};
use crate::config::{Prediction, SequenceModeling, TrainingConfig};
use crate::converter::{
    AttnLabelConverter, CtcLabelConverter, EncodedTargets, LabelConverter, TransformerLabelConverter,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodingVariant {
    /// CTC
    AlignmentFree,
    Attention,
    /// Transformer-style decoding with positions
    Autoregressive,
}

impl DecodingVariant {
    /// Transformer sequence modeling wins, then the prediction stage decides.
    pub fn from_stages(
        sequence_modeling: Option<SequenceModeling>,
        prediction: Option<Prediction>,
    ) -> Result<Self> {
        match (sequence_modeling, prediction) {
            (Some(SequenceModeling::Transformer), _) => Ok(DecodingVariant::Autoregressive),
            (_, Some(Prediction::Ctc)) => Ok(DecodingVariant::AlignmentFree),
            (_, Some(Prediction::Attn)) => Ok(DecodingVariant::Attention),
            _ => bail!(
                "No decoding stage selected: use --sequence-modeling transformer or --prediction ctc|attn"
            ),
        }
    }

    /// End-of-sequence marker left in decoded strings, if any.
    pub fn terminator(&self) -> Option<&'static str> {
        match self {
            DecodingVariant::AlignmentFree => None,
            DecodingVariant::Attention => Some(AttnLabelConverter::TERMINATOR),
            DecodingVariant::Autoregressive => Some(TransformerLabelConverter::TERMINATOR),
        }
    }

    pub fn head_kind(&self) -> HeadKind {
        match self {
            DecodingVariant::AlignmentFree => HeadKind::Ctc,
            DecodingVariant::Attention => HeadKind::Attention,
            DecodingVariant::Autoregressive => HeadKind::Transformer,
        }
    }
}

/// How gradients turn into a parameter update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    /// Warmup-scheduled rate, then step; no clipping
    ScheduledStep,
    /// Plain step; no clipping
    Step,
    /// Clip the global gradient norm, then step
    ClipThenStep(f64),
}

pub struct VariantStrategy {
    variant: DecodingVariant,
    converter: Box<dyn LabelConverter>,
    batch_max_length: usize,
    label_smoothing: bool,
}

impl VariantStrategy {
    pub fn new(variant: DecodingVariant, character: &str, batch_max_length: usize, label_smoothing: bool) -> Self {
        let converter: Box<dyn LabelConverter> = match variant {
            DecodingVariant::AlignmentFree => Box::new(CtcLabelConverter::new(character)),
            DecodingVariant::Attention => Box::new(AttnLabelConverter::new(character)),
            DecodingVariant::Autoregressive => Box::new(TransformerLabelConverter::new(character)),
        };
        Self {
            variant,
            converter,
            batch_max_length,
            label_smoothing,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.variant,
            &config.character,
            config.batch_max_length,
            config.label_smoothing,
        )
    }

    pub fn variant(&self) -> DecodingVariant {
        self.variant
    }

    pub fn converter(&self) -> &dyn LabelConverter {
        self.converter.as_ref()
    }

    pub fn encode_targets(&self, labels: &[String], device: &Device) -> Result<EncodedTargets> {
        self.converter.encode(labels, self.batch_max_length, device)
    }

    /// Scalar loss for `[batch, steps, classes]` predictions.
    pub fn compute_loss(&self, preds: &Tensor, targets: &EncodedTargets) -> Result<Tensor> {
        match self.variant {
            DecodingVariant::AlignmentFree => {
                let log_probs = ops::log_softmax(preds, D::Minus1)?.transpose(0, 1)?;
                ctc_loss(&log_probs, &targets.text, &targets.lengths)
            }
            DecodingVariant::Attention | DecodingVariant::Autoregressive => {
                let (_, steps, classes) = preds.dims3()?;
                // Drop the leading [GO] / <s>
                let gold = targets.text.narrow(1, 1, steps)?;
                let logits = preds.reshape(((), classes))?;
                let pad = self.converter.pad_index();
                if self.variant == DecodingVariant::Autoregressive && self.label_smoothing {
                    label_smoothed_loss(&logits, &gold, pad, LABEL_SMOOTHING_EPS)
                } else {
                    cross_entropy_ignore_index(&logits, &gold, pad)
                }
            }
        }
    }

    /// Argmax decoding of `[batch, steps, classes]` predictions.
    pub fn decode_predictions(&self, preds: &Tensor) -> Result<Vec<String>> {
        let rows = preds.argmax(D::Minus1)?.to_device(&Device::Cpu)?.to_vec2::<u32>()?;
        Ok(self.converter.decode(&rows))
    }

    /// Cuts a decoded string at the first terminator, when there is one.
    pub fn strip_terminator<'a>(&self, text: &'a str) -> &'a str {
        match self.variant.terminator().and_then(|t| text.find(t)) {
            Some(idx) => &text[..idx],
            None => text,
        }
    }

    pub fn build_optimizer(&self, config: &TrainingConfig, params: Vec<(String, Var)>) -> TrainOptimizer {
        let optimizer = if config.adam {
            TrainOptimizer::Adam(Adam::new(params, config.lr, config.beta1, 0.999, 1e-8))
        } else if self.variant == DecodingVariant::Autoregressive && config.use_scheduled_optim {
            TrainOptimizer::Scheduled {
                adam: Adam::new(params, 0.0, 0.9, 0.98, 1e-9),
                schedule: WarmupScheduler::new(config.d_model, config.n_warmup_steps),
            }
        } else {
            TrainOptimizer::Adadelta(Adadelta::new(params, config.lr, config.rho, config.eps))
        };
        info!("Optimizer: {:?}", optimizer.kind());
        optimizer
    }

    pub fn update_rule(&self, optimizer: &TrainOptimizer, grad_clip: f64) -> UpdateRule {
        match (self.variant, optimizer) {
            (DecodingVariant::Autoregressive, TrainOptimizer::Scheduled { .. }) => UpdateRule::ScheduledStep,
            (DecodingVariant::Autoregressive, _) => UpdateRule::Step,
            _ => UpdateRule::ClipThenStep(grad_clip),
        }
    }

    pub fn apply_update(
        &self,
        optimizer: &mut TrainOptimizer,
        params: &[(String, Var)],
        mut grads: GradStore,
        grad_clip: f64,
    ) -> Result<()> {
        match self.update_rule(optimizer, grad_clip) {
            UpdateRule::ScheduledStep | UpdateRule::Step => optimizer.step(&grads),
            UpdateRule::ClipThenStep(max_norm) => {
                clip_grad_norm(params, &mut grads, max_norm)?;
                optimizer.step(&grads)
            }
        }
    }
}
