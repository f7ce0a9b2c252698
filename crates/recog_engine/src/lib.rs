//! Recog Engine
//!
//! Reference text-recognition network built on candle.
//! Images go through a small convolutional feature extractor, are collapsed
//! into a left-to-right column sequence, and are decoded either by a CTC
//! classifier or by a cross-attention decoder (attention / transformer heads).

pub mod layers;
pub mod model;

pub use layers::{AttentionDecoder, CtcHead, SimpleConv};
pub use model::{HeadKind, RecognizerConfig, TextRecognizer};
