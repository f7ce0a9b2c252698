//! Data Module - batch providers for training and validation
//!
//! - dataset: gt.txt datasets, label filtering and image collation
//! - balanced: ratio-balanced training batches with prefetch workers

use anyhow::Result;
use candle_core::Tensor;

pub mod balanced;
pub mod dataset;

pub use balanced::BalancedBatchLoader;
pub use dataset::{hierarchical_dataset, AlignCollate, LabelFilter, LabeledImageDataset, ValidationLoader};

/// One batch of images and their raw labels.
#[derive(Clone, Debug)]
pub struct Batch {
    /// `[batch, channels, img_h, img_w]` f32 in `[-1, 1]`, on CPU
    pub images: Tensor,
    pub labels: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Endless supply of training batches. Blocks until the next batch is ready.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// One full pass over validation data per call.
pub trait ValidationSource {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

impl ValidationSource for Vec<Batch> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}
