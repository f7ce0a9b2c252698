//! Parameter Initialization - name-driven init policy applied before training

use anyhow::Result;
use candle_core::{Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

/// Parameters whose name contains this marker arrive initialized and are left alone.
pub const PREINITIALIZED_MARKER: &str = "localization_fc2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAction {
    Skip,
    Zero,
    KaimingNormal,
    FillOne,
    Keep,
}

/// Whether Kaiming init can compute a fan-in for this shape.
pub fn supports_fan_in(dims: &[usize]) -> bool {
    dims.len() >= 2
}

/// `dims[1] * prod(dims[2..])`, the receptive-field fan-in of a weight.
pub fn fan_in(dims: &[usize]) -> usize {
    dims[1] * dims[2..].iter().product::<usize>()
}

pub struct ParameterInitializer {
    rng: StdRng,
}

impl ParameterInitializer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Ordered policy: skip marker, then bias, then weight (Kaiming, or 1 when it has no fan-in).
    pub fn action_for(name: &str, dims: &[usize]) -> InitAction {
        if name.contains(PREINITIALIZED_MARKER) {
            InitAction::Skip
        } else if name.contains("bias") {
            InitAction::Zero
        } else if name.contains("weight") {
            if supports_fan_in(dims) {
                InitAction::KaimingNormal
            } else {
                InitAction::FillOne
            }
        } else {
            InitAction::Keep
        }
    }

    /// Applies the policy to `params` in the given order.
    pub fn apply(&mut self, params: &[(String, Var)]) -> Result<()> {
        for (name, var) in params {
            let dims = var.dims().to_vec();
            match Self::action_for(name, &dims) {
                InitAction::Skip => info!("Skip {} as it is already initialized", name),
                InitAction::Zero => var.set(&var.as_tensor().zeros_like()?)?,
                InitAction::FillOne => var.set(&var.as_tensor().ones_like()?)?,
                InitAction::KaimingNormal => {
                    let std = (2.0 / fan_in(&dims) as f64).sqrt();
                    let normal = Normal::new(0.0, std)?;
                    let values: Vec<f32> = (0..var.elem_count())
                        .map(|_| normal.sample(&mut self.rng) as f32)
                        .collect();
                    let noise = Tensor::from_vec(values, dims.as_slice(), var.device())?
                        .to_dtype(var.dtype())?;
                    var.set(&noise)?;
                }
                InitAction::Keep => debug!("{} keeps its default initialization", name),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(shape: &[usize], value: f32) -> Var {
        Var::from_tensor(&Tensor::full(value, shape, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn test_policy_order() {
        assert_eq!(
            ParameterInitializer::action_for("stn.localization_fc2.bias", &[6]),
            InitAction::Skip
        );
        assert_eq!(ParameterInitializer::action_for("fc.bias", &[4]), InitAction::Zero);
        assert_eq!(
            ParameterInitializer::action_for("fc.weight", &[4, 3]),
            InitAction::KaimingNormal
        );
        assert_eq!(ParameterInitializer::action_for("norm.weight", &[4]), InitAction::FillOne);
        assert_eq!(ParameterInitializer::action_for("pos_table", &[4, 3]), InitAction::Keep);
    }

    #[test]
    fn test_apply() {
        let params = vec![
            ("a.localization_fc2.weight".to_string(), var(&[2, 3], 0.5)),
            ("b.bias".to_string(), var(&[8], 0.5)),
            ("c.weight".to_string(), var(&[64, 32, 3, 3], 0.5)),
            ("d.norm.weight".to_string(), var(&[8], 0.5)),
        ];
        ParameterInitializer::new(1111).apply(&params).unwrap();

        let skipped = params[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(skipped.iter().all(|&v| v == 0.5));

        let bias = params[1].1.as_tensor().to_vec1::<f32>().unwrap();
        assert!(bias.iter().all(|&v| v == 0.0));

        let w = params[2].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let n = w.len() as f64;
        let mean = w.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = w.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        let expected = 2.0 / (32.0 * 9.0);
        assert!(mean.abs() < 0.01);
        assert!((var - expected).abs() / expected < 0.1);

        let norm = params[3].1.as_tensor().to_vec1::<f32>().unwrap();
        assert!(norm.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = vec![("w.weight".to_string(), var(&[4, 4], 0.0))];
        let b = vec![("w.weight".to_string(), var(&[4, 4], 0.0))];
        ParameterInitializer::new(7).apply(&a).unwrap();
        ParameterInitializer::new(7).apply(&b).unwrap();
        let va = a[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let vb = b[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(va, vb);
    }
}
