//! Training Configuration
//!
//! Validated, immutable run configuration and the options dump written at run start.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::train::args::TrainArgs;
use crate::train::variant::DecodingVariant;

/// 94 printable ASCII characters used in case-sensitive mode
pub const PRINTABLE_CHARACTERS: &str =
    "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Sequence modeling stage selector
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceModeling {
    None,
    Transformer,
}

impl SequenceModeling {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceModeling::None => "None",
            SequenceModeling::Transformer => "Transformer",
        }
    }
}

/// Prediction stage selector
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prediction {
    None,
    Ctc,
    Attn,
}

impl Prediction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prediction::None => "None",
            Prediction::Ctc => "CTC",
            Prediction::Attn => "Attn",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainingConfig {
    pub experiment_name: String,
    pub train_data: String,
    pub valid_data: String,
    pub manual_seed: u64,
    pub workers: usize,
    // Loop
    pub batch_size: usize,
    pub num_iter: usize,
    pub val_interval: usize,
    pub save_interval: usize,
    pub continue_model: Option<String>,
    pub load_weights: Option<String>,
    // Optimizer
    pub adam: bool,
    pub lr: f64,
    pub beta1: f64,
    pub rho: f64,
    pub eps: f64,
    pub grad_clip: f64,
    // Data
    pub select_data: Vec<String>,
    pub batch_ratio: Vec<f64>,
    pub total_data_usage_ratio: f64,
    pub batch_max_length: usize,
    pub img_h: usize,
    pub img_w: usize,
    pub input_channel: usize,
    pub character: String,
    pub sensitive: bool,
    pub pad: bool,
    // Architecture
    pub sequence_modeling: Option<SequenceModeling>,
    pub prediction: Option<Prediction>,
    pub variant: DecodingVariant,
    pub output_channel: usize,
    pub hidden_size: usize,
    // Transformer
    pub d_model: usize,
    pub n_warmup_steps: usize,
    pub use_scheduled_optim: bool,
    pub label_smoothing: bool,
    pub output_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            experiment_name: "demo".to_string(),
            train_data: "data/training".to_string(),
            valid_data: "data/validation".to_string(),
            manual_seed: 1111,
            workers: 4,
            batch_size: 196,
            num_iter: 300_000,
            val_interval: 1000,
            save_interval: 1000,
            continue_model: None,
            load_weights: None,
            adam: false,
            lr: 1.0,
            beta1: 0.9,
            rho: 0.95,
            eps: 1e-8,
            grad_clip: 5.0,
            select_data: vec!["MJ".to_string(), "ST".to_string()],
            batch_ratio: vec![0.5, 0.5],
            total_data_usage_ratio: 1.0,
            batch_max_length: 25,
            img_h: 32,
            img_w: 100,
            input_channel: 1,
            character: "0123456789abcdefghijklmnopqrstuvwxyz".to_string(),
            sensitive: false,
            pad: false,
            sequence_modeling: None,
            prediction: Some(Prediction::Ctc),
            variant: DecodingVariant::AlignmentFree,
            output_channel: 512,
            hidden_size: 256,
            d_model: 512,
            n_warmup_steps: 16_000,
            use_scheduled_optim: false,
            label_smoothing: false,
            output_dir: "saved_models".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn from_args(args: &TrainArgs) -> Result<Self> {
        let variant = DecodingVariant::from_stages(args.sequence_modeling, args.prediction)?;

        let select_data: Vec<String> = args
            .select_data
            .split('-')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let batch_ratio = args
            .batch_ratio
            .split('-')
            .filter(|s| !s.is_empty())
            .map(|r| {
                r.parse::<f64>()
                    .with_context(|| format!("Invalid batch ratio '{}'", r))
            })
            .collect::<Result<Vec<f64>>>()?;

        let experiment_name = args.experiment_name.clone().unwrap_or_else(|| {
            format!(
                "None-SimpleConv-{}-{}-Seed{}",
                args.sequence_modeling.map_or("None", |s| s.as_str()),
                args.prediction.map_or("None", |p| p.as_str()),
                args.manual_seed
            )
        });

        let character = if args.sensitive {
            PRINTABLE_CHARACTERS.to_string()
        } else {
            args.character.clone()
        };

        let config = Self {
            experiment_name,
            train_data: args.train_data.clone(),
            valid_data: args.valid_data.clone(),
            manual_seed: args.manual_seed,
            workers: args.workers,
            batch_size: args.batch_size,
            num_iter: args.num_iter,
            val_interval: args.val_interval,
            save_interval: args.save_interval,
            continue_model: args.continue_model.clone().filter(|p| !p.is_empty()),
            load_weights: args.load_weights.clone().filter(|p| !p.is_empty()),
            adam: args.adam,
            lr: args.lr,
            beta1: args.beta1,
            rho: args.rho,
            eps: args.eps,
            grad_clip: args.grad_clip,
            select_data,
            batch_ratio,
            total_data_usage_ratio: args.total_data_usage_ratio,
            batch_max_length: args.batch_max_length,
            img_h: args.img_h,
            img_w: args.img_w,
            input_channel: if args.rgb { 3 } else { 1 },
            character,
            sensitive: args.sensitive,
            pad: args.pad,
            sequence_modeling: args.sequence_modeling,
            prediction: args.prediction,
            variant,
            output_channel: args.output_channel,
            hidden_size: args.hidden_size,
            d_model: args.d_model,
            n_warmup_steps: args.n_warmup_steps,
            use_scheduled_optim: args.use_scheduled_optim,
            label_smoothing: args.label_smoothing,
            output_dir: args.output_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot start a run. Called before any state is touched.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.num_iter == 0 {
            bail!("num_iter must be greater than zero");
        }
        if self.val_interval == 0 {
            bail!("val_interval must be greater than zero");
        }
        if self.save_interval == 0 {
            bail!("save_interval must be greater than zero");
        }
        let expected = DecodingVariant::from_stages(self.sequence_modeling, self.prediction)?;
        if self.variant != expected {
            bail!(
                "variant {:?} does not match the selected stages (expected {:?})",
                self.variant,
                expected
            );
        }
        if self.character.is_empty() {
            bail!("character set is empty");
        }
        if self.select_data.is_empty() {
            bail!("select_data names no training selection");
        }
        if self.select_data.len() != self.batch_ratio.len() {
            bail!(
                "select_data has {} entries but batch_ratio has {}",
                self.select_data.len(),
                self.batch_ratio.len()
            );
        }
        if !(self.total_data_usage_ratio > 0.0 && self.total_data_usage_ratio <= 1.0) {
            bail!(
                "total_data_usage_ratio must be in (0, 1], got {}",
                self.total_data_usage_ratio
            );
        }
        if self.img_h < 4 || self.img_w < 4 {
            bail!("images must be at least 4x4, got {}x{}", self.img_h, self.img_w);
        }
        if self.use_scheduled_optim && (self.d_model == 0 || self.n_warmup_steps == 0) {
            bail!("scheduled optimizer needs d_model and n_warmup_steps greater than zero");
        }
        Ok(())
    }

    pub fn experiment_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join(&self.experiment_name)
    }

    /// `key: value` dump of every option, framed like the classic opt.txt.
    pub fn options_log(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        let mut log = String::from("------------ Options -------------\n");
        if let serde_json::Value::Object(map) = value {
            for (k, v) in map {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                log.push_str(&format!("{}: {}\n", k, v));
            }
        }
        log.push_str("---------------------------------------\n");
        Ok(log)
    }

    /// Appends the options dump to `<experiment_dir>/opt.txt`.
    pub fn write_options_log(&self) -> Result<PathBuf> {
        let dir = self.experiment_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create experiment directory {:?}", dir))?;
        let path = dir.join("opt.txt");
        let log = self.options_log()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        file.write_all(log.as_bytes())?;
        tracing::info!("\n{}", log);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: TrainArgs,
    }

    fn parse(extra: &[&str]) -> TrainArgs {
        let mut argv = vec!["harness"];
        argv.extend_from_slice(extra);
        Harness::parse_from(argv).args
    }

    #[test]
    fn test_missing_stage_selector_is_fatal() {
        let args = parse(&[]);
        assert!(TrainingConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_transformer_stage_wins_over_prediction() {
        let args = parse(&["--sequence-modeling", "transformer", "--prediction", "ctc"]);
        let config = TrainingConfig::from_args(&args).unwrap();
        assert_eq!(config.variant, DecodingVariant::Autoregressive);
        assert_eq!(config.experiment_name, "None-SimpleConv-Transformer-CTC-Seed1111");
    }

    #[test]
    fn test_ratio_count_must_match_selection() {
        let args = parse(&["--prediction", "attn", "--select-data", "MJ-ST", "--batch-ratio", "1"]);
        assert!(TrainingConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_sensitive_switches_alphabet() {
        let args = parse(&["--prediction", "ctc", "--sensitive"]);
        let config = TrainingConfig::from_args(&args).unwrap();
        assert_eq!(config.character.chars().count(), 94);
    }

    #[test]
    fn test_loop_defaults() {
        let config = TrainingConfig::from_args(&parse(&["--prediction", "ctc"])).unwrap();
        assert_eq!(config.batch_size, 196);
        assert_eq!(config.val_interval, 1000);
        assert_eq!(config.save_interval, 1000);
        assert_eq!(TrainingConfig::default().batch_size, 196);
        assert_eq!(TrainingConfig::default().val_interval, 1000);
    }

    #[test]
    fn test_variant_must_match_stages() {
        let mismatched = TrainingConfig {
            prediction: Some(Prediction::Ctc),
            variant: DecodingVariant::Attention,
            ..Default::default()
        };
        assert!(mismatched.validate().is_err());

        let matched = TrainingConfig {
            prediction: Some(Prediction::Attn),
            variant: DecodingVariant::Attention,
            ..Default::default()
        };
        assert!(matched.validate().is_ok());
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_options_log_is_framed() {
        let config = TrainingConfig::default();
        let log = config.options_log().unwrap();
        assert!(log.starts_with("------------ Options -------------\n"));
        assert!(log.contains("num_iter: 300000\n"));
        assert!(log.ends_with("---------------------------------------\n"));
    }
}
