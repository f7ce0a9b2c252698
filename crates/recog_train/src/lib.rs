//! Recog Train
//!
//! Training orchestration for the text recognizer: one loop driving CTC,
//! attention and transformer-style decoding, with periodic validation,
//! dual best-metric tracking and checkpoint resume/transplant.

pub mod cli;
pub mod config;
pub mod converter;
pub mod data;
pub mod metrics;
pub mod model;
pub mod train;
