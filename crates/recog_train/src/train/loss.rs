//! Loss functions - CTC, ignore-index cross-entropy, label smoothing

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops;

/// Fixed smoothing mass for the label-smoothed loss.
pub const LABEL_SMOOTHING_EPS: f64 = 0.1;

/// Stand-in for log(0) that keeps arithmetic finite.
const LOG_ZERO: f32 = -1e30;

/// Elementwise log(exp(a) + exp(b) + ...) over tensors of the same shape.
fn logsumexp(xs: &[&Tensor]) -> Result<Tensor> {
    let mut m = xs[0].detach();
    for x in &xs[1..] {
        m = m.maximum(&x.detach())?;
    }
    let mut acc = (xs[0] - &m)?.exp()?;
    for x in &xs[1..] {
        acc = (acc + (*x - &m)?.exp()?)?;
    }
    Ok((acc.log()? + m)?)
}

/// Connectionist temporal classification loss, blank = 0.
///
/// `log_probs`: `[T, B, K]` log-probabilities (time-major).
/// `targets`: `[B, S]` u32 labels, padded beyond each sample's length.
/// Samples whose targets cannot be aligned in `T` frames contribute 0 and no
/// gradient. Each sample's loss is divided by its target length, then averaged.
pub fn ctc_loss(log_probs: &Tensor, targets: &Tensor, target_lengths: &[usize]) -> Result<Tensor> {
    let (t_len, batch, _k) = log_probs.dims3()?;
    let device = log_probs.device();
    if target_lengths.len() != batch {
        bail!(
            "ctc_loss: {} target lengths for a batch of {}",
            target_lengths.len(),
            batch
        );
    }
    if t_len == 0 {
        bail!("ctc_loss: empty input sequence");
    }

    // Extended label sequence: blank, l1, blank, l2, ..., blank
    let s_max = target_lengths.iter().copied().max().unwrap_or(0);
    let width = 2 * s_max + 1;
    let rows: Vec<Vec<u32>> = targets.to_device(&Device::Cpu)?.to_vec2::<u32>()?;
    let mut ext = vec![0u32; batch * width];
    let mut skip = vec![LOG_ZERO; batch * width];
    for b in 0..batch {
        let n = target_lengths[b];
        if n > rows[b].len() {
            bail!("ctc_loss: target length {} exceeds padded width {}", n, rows[b].len());
        }
        for s in 0..n {
            ext[b * width + 2 * s + 1] = rows[b][s];
        }
        for l in 2..width {
            let cur = ext[b * width + l];
            if cur != 0 && cur != ext[b * width + l - 2] {
                skip[b * width + l] = 0.0;
            }
        }
    }
    let ext = Tensor::from_vec(ext, (batch, width), device)?;
    let skip = Tensor::from_vec(skip, (batch, width), device)?;

    // Emission log-probs per extended position: [T, B, width]
    let index = ext.unsqueeze(0)?.broadcast_as((t_len, batch, width))?.contiguous()?;
    let emissions = log_probs.contiguous()?.gather(&index, 2)?;

    let mut init = vec![LOG_ZERO; width];
    init[0] = 0.0;
    if width > 1 {
        init[1] = 0.0;
    }
    let init = Tensor::from_vec(init, (1, width), device)?;
    let mut alpha = emissions.get(0)?.broadcast_add(&init)?;

    let pad1 = Tensor::full(LOG_ZERO, (batch, 1), device)?;
    let pad2 = Tensor::full(LOG_ZERO, (batch, 2), device)?;
    for t in 1..t_len {
        let (shift1, shift2) = if width == 1 {
            (pad1.clone(), pad1.clone())
        } else {
            let s1 = Tensor::cat(&[&pad1, &alpha.narrow(1, 0, width - 1)?], 1)?;
            let s2 = if width > 2 {
                Tensor::cat(&[&pad2, &alpha.narrow(1, 0, width - 2)?], 1)?
            } else {
                pad2.clone()
            };
            (s1, (s2 + &skip)?)
        };
        alpha = (logsumexp(&[&alpha, &shift1, &shift2])? + emissions.get(t)?)?;
    }

    // Paths end on the last label or the trailing blank
    let last: Vec<u32> = target_lengths.iter().map(|&n| (2 * n) as u32).collect();
    let prev: Vec<u32> = target_lengths
        .iter()
        .map(|&n| (2 * n).saturating_sub(1) as u32)
        .collect();
    let prev_mask: Vec<f32> = target_lengths
        .iter()
        .map(|&n| if n == 0 { LOG_ZERO } else { 0.0 })
        .collect();
    let last = Tensor::from_vec(last, (batch, 1), device)?;
    let prev = Tensor::from_vec(prev, (batch, 1), device)?;
    let prev_mask = Tensor::from_vec(prev_mask, (batch, 1), device)?;
    let end_last = alpha.gather(&last, 1)?;
    let end_prev = (alpha.gather(&prev, 1)? + prev_mask)?;
    let ll = logsumexp(&[&end_last, &end_prev])?.squeeze(1)?;

    // Zero-infinity: unreachable alignments contribute nothing
    let feasible = ll.ge((LOG_ZERO / 2.0) as f64)?.to_dtype(DType::F32)?;
    let norm: Vec<f32> = target_lengths.iter().map(|&n| 1.0 / n.max(1) as f32).collect();
    let norm = Tensor::from_vec(norm, batch, device)?;

    let per_sample = (ll.neg()? * feasible)?.mul(&norm)?;
    Ok(per_sample.mean_all()?)
}

/// Log-probabilities of the target class and the non-pad mask, over flattened rows.
fn pick_targets(logits: &Tensor, targets: &Tensor, pad_index: u32) -> Result<(Tensor, Tensor, Tensor)> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let targets = targets.flatten_all()?.contiguous()?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let mask = targets.ne(pad_index)?.to_dtype(DType::F32)?;
    Ok((log_probs, picked, mask))
}

/// Mean of `values` over positions where `mask` is 1.
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        bail!("every target position is padding");
    }
    Ok(((values * mask)?.sum_all()? / count as f64)?)
}

/// Cross-entropy over `[N, K]` logits, skipping rows whose target is `pad_index`.
pub fn cross_entropy_ignore_index(logits: &Tensor, targets: &Tensor, pad_index: u32) -> Result<Tensor> {
    let (_, picked, mask) = pick_targets(logits, targets, pad_index)?;
    masked_mean(&picked.neg()?, &mask)
}

/// Cross-entropy against `1 - eps` on the target and `eps / (K - 1)` on every
/// other class, averaged over non-pad rows.
pub fn label_smoothed_loss(logits: &Tensor, targets: &Tensor, pad_index: u32, eps: f64) -> Result<Tensor> {
    let n_class = logits.dim(D::Minus1)?;
    if n_class < 2 {
        bail!("label smoothing needs at least two classes");
    }
    let (log_probs, picked, mask) = pick_targets(logits, targets, pad_index)?;
    let others = (log_probs.sum(D::Minus1)? - &picked)?;
    let smoothed = ((picked * (1.0 - eps))? + (others * (eps / (n_class - 1) as f64))?)?;
    masked_mean(&smoothed.neg()?, &mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_ctc_uniform_two_frames() {
        // Three alignments of "1" in two frames, each (1/3)^2
        let lp = Tensor::full((1.0f32 / 3.0).ln(), (2, 1, 3), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&lp, &targets, &[1]).unwrap();
        assert!(close(loss.to_scalar::<f32>().unwrap(), 3f32.ln()));
    }

    #[test]
    fn test_ctc_infeasible_is_zero() {
        // "11" needs three frames
        let lp = Tensor::full((1.0f32 / 3.0).ln(), (2, 1, 3), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 1]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&lp, &targets, &[2]).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_ctc_empty_target() {
        // Only the all-blank path: (1/3)^2
        let lp = Tensor::full((1.0f32 / 3.0).ln(), (2, 1, 3), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&lp, &targets, &[0]).unwrap();
        assert!(close(loss.to_scalar::<f32>().unwrap(), 2.0 * 3f32.ln()));
    }

    #[test]
    fn test_label_smoothing_closed_form() {
        let logits = Tensor::new(&[[1.0f32, 2.0, 0.5], [0.1, -1.0, 3.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        let loss = label_smoothed_loss(&logits, &targets, 0, 0.1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let lp = ops::log_softmax(&logits, 1).unwrap().to_vec2::<f32>().unwrap();
        let eps = 0.1f32;
        let mut expected = 0.0;
        for (row, &t) in lp.iter().zip(&[1usize, 2]) {
            let others: f32 = row.iter().enumerate().filter(|(j, _)| *j != t).map(|(_, v)| v).sum();
            expected += -(1.0 - eps) * row[t] - eps / 2.0 * others;
        }
        expected /= 2.0;
        assert!(close(loss, expected));
    }

    #[test]
    fn test_zero_smoothing_equals_cross_entropy() {
        let logits = Tensor::new(&[[1.0f32, 2.0, 0.5], [0.1, -1.0, 3.0], [0.3, 0.3, 0.3]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 2, 0], &Device::Cpu).unwrap();
        let smoothed = label_smoothed_loss(&logits, &targets, 0, 0.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let ce = cross_entropy_ignore_index(&logits, &targets, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(close(smoothed, ce));
    }

    #[test]
    fn test_cross_entropy_ignores_padding() {
        let logits = Tensor::new(&[[0.0f32, 0.0], [5.0, -5.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        let ce = cross_entropy_ignore_index(&logits, &targets, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(close(ce, 2f32.ln()));

        let all_pad = Tensor::new(&[0u32, 0], &Device::Cpu).unwrap();
        assert!(cross_entropy_ignore_index(&logits, &all_pad, 0).is_err());
    }
}
