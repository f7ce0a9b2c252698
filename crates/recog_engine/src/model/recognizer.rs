//! TextRecognizer - Full model: features -> sequence projection -> head

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::{HeadKind, RecognizerConfig};
use crate::layers::{AttentionDecoder, CtcHead, SimpleConv};

enum Head {
    Ctc(CtcHead),
    Decoder(AttentionDecoder),
}

/// Image -> per-step class logits.
pub struct TextRecognizer {
    pub config: RecognizerConfig,
    pub features: SimpleConv,
    pub sequence: Linear,
    head: Head,
}

impl TextRecognizer {
    pub fn load(config: RecognizerConfig, vb: VarBuilder) -> Result<Self> {
        let features = SimpleConv::load(
            config.input_channel,
            config.output_channel,
            vb.pp("feature"),
        )?;
        let sequence = candle_nn::linear(
            config.output_channel,
            config.hidden_size,
            vb.pp("sequence").pp("proj"),
        )?;

        let head = match config.head {
            HeadKind::Ctc => Head::Ctc(CtcHead::load(
                config.hidden_size,
                config.num_class,
                vb.pp("prediction"),
            )?),
            HeadKind::Attention => Head::Decoder(AttentionDecoder::load(
                config.hidden_size,
                config.num_class,
                None,
                vb.pp("prediction"),
            )?),
            HeadKind::Transformer => Head::Decoder(AttentionDecoder::load(
                config.hidden_size,
                config.num_class,
                Some(config.max_positions()),
                vb.pp("prediction"),
            )?),
        };

        tracing::debug!("TextRecognizer loaded: {:?}", config);
        Ok(Self {
            config,
            features,
            sequence,
            head,
        })
    }

    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let columns = self.features.forward(images)?;
        self.sequence.forward(&columns)?.relu()
    }

    /// Teacher-forced forward pass.
    ///
    /// `text` holds the full encoded target (`[GO]`/`<s>` first); the decoder
    /// consumes `text[:, :-1]` so the output lines up with `text[:, 1:]`.
    /// The CTC head ignores `text`.
    pub fn forward_train(
        &self,
        images: &Tensor,
        text: &Tensor,
        positions: Option<&Tensor>,
    ) -> Result<Tensor> {
        let keys = self.encode(images)?;
        match &self.head {
            Head::Ctc(head) => head.forward(&keys),
            Head::Decoder(decoder) => {
                let steps = text.dim(1)?.saturating_sub(1);
                let inputs = text.narrow(1, 0, steps)?;
                let inputs_pos = match positions {
                    Some(p) => Some(p.narrow(1, 0, steps)?),
                    None => None,
                };
                decoder.forward(&keys, &inputs, inputs_pos.as_ref())
            }
        }
    }

    /// Greedy decoding: every step feeds back the previous argmax.
    /// Returns logits `[batch, decode_steps, num_class]` (CTC: `[batch, columns, num_class]`).
    pub fn forward_greedy(&self, images: &Tensor) -> Result<Tensor> {
        let keys = self.encode(images)?;
        let decoder = match &self.head {
            Head::Ctc(head) => return head.forward(&keys),
            Head::Decoder(decoder) => decoder,
        };

        let batch = images.dim(0)?;
        let device = images.device();
        let mut tokens = Tensor::full(self.config.start_token, (batch, 1), device)?;
        let mut outputs = Vec::with_capacity(self.config.decode_steps());

        for step in 0..self.config.decode_steps() {
            let positions = Tensor::full((step + 1) as u32, (batch, 1), device)?;
            let logits = decoder.forward(&keys, &tokens, Some(&positions))?;
            tokens = logits.argmax_keepdim(D::Minus1)?.squeeze(2)?.to_dtype(DType::U32)?;
            outputs.push(logits);
        }

        Tensor::cat(&outputs, 1)
    }
}
