//! Model Module - Text recognizer architecture
//!
//! - RecognizerConfig / HeadKind: model configuration
//! - TextRecognizer: feature extractor + sequence projection + prediction head

pub mod config;
pub mod recognizer;

pub use config::{HeadKind, RecognizerConfig};
pub use recognizer::TextRecognizer;
