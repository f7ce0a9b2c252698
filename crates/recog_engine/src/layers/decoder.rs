//! Prediction heads - CTC classifier and attention decoder

use candle_core::{Result, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

/// Per-column linear classifier
pub struct CtcHead {
    pub fc: Linear,
}

impl CtcHead {
    pub fn load(hidden_size: usize, num_class: usize, vb: VarBuilder) -> Result<Self> {
        let fc = candle_nn::linear(hidden_size, num_class, vb.pp("fc"))?;
        Ok(Self { fc })
    }

    pub fn forward(&self, columns: &Tensor) -> Result<Tensor> {
        self.fc.forward(columns)
    }
}

/// Single-head cross-attention decoder.
///
/// Each output position attends over the column features with a query built
/// from the previous token (and its position, for the transformer head).
pub struct AttentionDecoder {
    pub embed: Embedding,
    pub pos_embed: Option<Embedding>,
    pub query: Linear,
    pub fc: Linear,
    hidden_size: usize,
}

impl AttentionDecoder {
    pub fn load(
        hidden_size: usize,
        num_class: usize,
        max_positions: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embed = candle_nn::embedding(num_class, hidden_size, vb.pp("embed"))?;
        let pos_embed = match max_positions {
            Some(n) => Some(candle_nn::embedding(n, hidden_size, vb.pp("pos_embed"))?),
            None => None,
        };
        let query = candle_nn::linear(hidden_size, hidden_size, vb.pp("query"))?;
        let fc = candle_nn::linear(2 * hidden_size, num_class, vb.pp("fc"))?;

        Ok(Self {
            embed,
            pos_embed,
            query,
            fc,
            hidden_size,
        })
    }

    /// `keys`: `[batch, columns, hidden]`, `tokens`/`positions`: `[batch, steps]` (u32).
    /// Returns logits `[batch, steps, num_class]`.
    pub fn forward(&self, keys: &Tensor, tokens: &Tensor, positions: Option<&Tensor>) -> Result<Tensor> {
        let mut q = self.embed.forward(tokens)?;
        if let (Some(pos_embed), Some(positions)) = (&self.pos_embed, positions) {
            q = (q + pos_embed.forward(positions)?)?;
        }
        let q = self.query.forward(&q)?;

        let scale = 1.0 / (self.hidden_size as f64).sqrt();
        let scores = (q.matmul(&keys.transpose(1, 2)?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = attn.matmul(keys)?;

        let joined = Tensor::cat(&[&q, &context], 2)?;
        self.fc.forward(&joined)
    }
}
