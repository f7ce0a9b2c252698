//! RecognizerConfig - Model configuration

use serde::{Deserialize, Serialize};

/// Prediction head attached after the sequence projection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadKind {
    /// Per-column classifier trained with CTC
    Ctc,
    /// Cross-attention decoder conditioned on the previous token
    Attention,
    /// Cross-attention decoder with learned target positions
    Transformer,
}

/// Model configuration for TextRecognizer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub input_channel: usize,
    pub output_channel: usize,
    pub hidden_size: usize,
    /// Number of output classes, including the converter's special tokens
    pub num_class: usize,
    pub batch_max_length: usize,
    pub head: HeadKind,
    /// First decoder input in greedy decoding (`[GO]` or `<s>`)
    pub start_token: u32,
}

impl RecognizerConfig {
    /// Decoding steps for the attention heads: every character plus the terminator.
    pub fn decode_steps(&self) -> usize {
        self.batch_max_length + 1
    }

    /// Size of the position table: PAD position 0 plus `<s>`, characters and `</s>`.
    pub fn max_positions(&self) -> usize {
        self.batch_max_length + 3
    }
}
