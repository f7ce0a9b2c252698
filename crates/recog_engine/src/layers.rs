//! Layers Module - Building blocks of the recognizer
//!
//! - SimpleConv: convolutional feature extractor producing column features
//! - CtcHead: per-column classifier
//! - AttentionDecoder: token-conditioned cross-attention over column features

pub mod decoder;
pub mod feature;

pub use decoder::{AttentionDecoder, CtcHead};
pub use feature::SimpleConv;
