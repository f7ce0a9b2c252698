//! Balanced Batch Loader - mixes training selections by ratio
//!
//! Each selection contributes a fixed number of samples to every batch.
//! Batches are assembled by background workers and handed over through a
//! bounded channel; the training loop blocks on `recv`.

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use super::dataset::{hierarchical_dataset, AlignCollate, LabelFilter};
use super::{Batch, BatchSource};
use crate::config::TrainingConfig;

/// Endless shuffled walk over one selection's samples.
#[derive(Clone)]
struct SelectionCursor {
    samples: Arc<Vec<(PathBuf, String)>>,
    order: Vec<usize>,
    pos: usize,
    per_batch: usize,
}

impl SelectionCursor {
    fn new(samples: Arc<Vec<(PathBuf, String)>>, per_batch: usize, rng: &mut StdRng) -> Self {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.shuffle(rng);
        Self {
            samples,
            order,
            pos: 0,
            per_batch,
        }
    }

    fn take(&mut self, rng: &mut StdRng, out: &mut Vec<(PathBuf, String)>) {
        for _ in 0..self.per_batch {
            if self.pos >= self.order.len() {
                self.order.shuffle(rng);
                self.pos = 0;
            }
            out.push(self.samples[self.order[self.pos]].clone());
            self.pos += 1;
        }
    }
}

/// Builds batches from the selection cursors. Each worker owns one.
#[derive(Clone)]
struct BatchAssembler {
    cursors: Vec<SelectionCursor>,
    collate: AlignCollate,
    rng: StdRng,
}

impl BatchAssembler {
    fn reseed(&self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let cursors = self
            .cursors
            .iter()
            .map(|c| SelectionCursor::new(c.samples.clone(), c.per_batch, &mut rng))
            .collect();
        Self {
            cursors,
            collate: self.collate.clone(),
            rng,
        }
    }

    fn assemble(&mut self) -> Result<Batch> {
        let mut picked = Vec::new();
        for cursor in self.cursors.iter_mut() {
            cursor.take(&mut self.rng, &mut picked);
        }
        self.collate.collate(&picked)
    }
}

enum Mode {
    Inline(BatchAssembler),
    Prefetch {
        rx: Option<Receiver<Result<Batch>>>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Ratio-balanced training batches over the selected datasets.
pub struct BalancedBatchLoader {
    mode: Mode,
    batch_size: usize,
}

/// Samples per batch for one selection.
pub fn per_batch_count(batch_size: usize, ratio: f64) -> usize {
    ((batch_size as f64 * ratio).round() as usize).max(1)
}

impl BalancedBatchLoader {
    pub fn new(config: &TrainingConfig) -> Result<Self> {
        let filter = LabelFilter::new(&config.character, config.sensitive, config.batch_max_length);
        let collate = AlignCollate::new(
            config.img_h,
            config.img_w,
            config.input_channel == 3,
            config.pad,
        );
        Self::from_selections(
            Path::new(&config.train_data),
            &config.select_data,
            &config.batch_ratio,
            config.total_data_usage_ratio,
            config.batch_size,
            &filter,
            collate,
            config.workers,
            config.manual_seed,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_selections(
        root: &Path,
        select_data: &[String],
        batch_ratio: &[f64],
        usage_ratio: f64,
        batch_size: usize,
        filter: &LabelFilter,
        collate: AlignCollate,
        workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if select_data.len() != batch_ratio.len() {
            bail!("select_data and batch_ratio must have the same length");
        }
        info!("dataset_root: {:?}", root);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut cursors = Vec::with_capacity(select_data.len());
        let mut total = 0;
        for (selection, &ratio) in select_data.iter().zip(batch_ratio) {
            let mut samples = hierarchical_dataset(root, selection, filter)?;
            let full = samples.len();
            let used = (full as f64 * usage_ratio) as usize;
            samples.truncate(used);
            if samples.is_empty() {
                bail!("Selection '{}' under {:?} has no usable samples", selection, root);
            }
            let per_batch = per_batch_count(batch_size, ratio);
            info!(
                "num total samples of {}: {} x {} (total_data_usage_ratio) = {}",
                selection, full, usage_ratio, used
            );
            info!("num samples of {} per batch: {} x {} (batch_ratio) = {}", selection, batch_size, ratio, per_batch);
            total += per_batch;
            cursors.push(SelectionCursor::new(Arc::new(samples), per_batch, &mut rng));
        }
        if total != batch_size {
            warn!("Total batch size {} differs from requested {}", total, batch_size);
        }

        let assembler = BatchAssembler {
            cursors,
            collate,
            rng,
        };
        let mode = if workers == 0 {
            Mode::Inline(assembler)
        } else {
            Self::spawn_workers(&assembler, workers, seed)?
        };
        Ok(Self {
            mode,
            batch_size: total,
        })
    }

    fn spawn_workers(assembler: &BatchAssembler, workers: usize, seed: u64) -> Result<Mode> {
        // Backpressure: at most two batches in flight per worker
        let (tx, rx) = sync_channel::<Result<Batch>>(workers * 2);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let tx = tx.clone();
            let mut local = assembler.reseed(seed.wrapping_add(id as u64));
            let handle = thread::Builder::new()
                .name(format!("batch-worker-{}", id))
                .spawn(move || loop {
                    let batch = local.assemble();
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                })?;
            handles.push(handle);
        }
        Ok(Mode::Prefetch {
            rx: Some(rx),
            workers: handles,
        })
    }

    /// Samples per batch across all selections.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl BatchSource for BalancedBatchLoader {
    fn next_batch(&mut self) -> Result<Batch> {
        match &mut self.mode {
            Mode::Inline(assembler) => assembler.assemble(),
            Mode::Prefetch { rx, .. } => rx
                .as_ref()
                .ok_or_else(|| anyhow!("Batch loader already shut down"))?
                .recv()
                .map_err(|_| anyhow!("All batch workers stopped"))?,
        }
    }
}

impl Drop for BalancedBatchLoader {
    fn drop(&mut self) {
        if let Mode::Prefetch { rx, workers } = &mut self.mode {
            // Unblocks workers waiting on a full channel
            drop(rx.take());
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    fn write_selection(dir: &Path, label: &str, count: usize) {
        std::fs::create_dir_all(dir).unwrap();
        let mut gt = String::new();
        for i in 0..count {
            let name = format!("{}.png", i);
            GrayImage::from_pixel(12, 6, Luma([(i * 40 % 256) as u8]))
                .save(dir.join(&name))
                .unwrap();
            gt.push_str(&format!("{}\t{}\n", name, label));
        }
        std::fs::write(dir.join("gt.txt"), gt).unwrap();
    }

    fn loader(root: &Path, workers: usize) -> BalancedBatchLoader {
        BalancedBatchLoader::from_selections(
            root,
            &["MJ".to_string(), "ST".to_string()],
            &[0.75, 0.25],
            1.0,
            4,
            &LabelFilter::new("ab", false, 5),
            AlignCollate::new(8, 8, false, false),
            workers,
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_per_batch_count() {
        assert_eq!(per_batch_count(192, 0.5), 96);
        assert_eq!(per_batch_count(10, 0.01), 1);
        assert_eq!(per_batch_count(5, 0.5), 3);
    }

    #[test]
    fn test_batches_follow_ratio() {
        let dir = tempdir().unwrap();
        write_selection(&dir.path().join("MJ"), "a", 5);
        write_selection(&dir.path().join("ST"), "b", 2);

        for workers in [0, 2] {
            let mut source = loader(dir.path(), workers);
            assert_eq!(source.batch_size(), 4);
            // Enough batches to wrap around both selections
            for _ in 0..4 {
                let batch = source.next_batch().unwrap();
                assert_eq!(batch.images.dims(), &[4, 1, 8, 8]);
                assert_eq!(batch.labels.iter().filter(|l| *l == "a").count(), 3);
                assert_eq!(batch.labels.iter().filter(|l| *l == "b").count(), 1);
            }
        }
    }

    #[test]
    fn test_empty_selection_is_rejected() {
        let dir = tempdir().unwrap();
        write_selection(&dir.path().join("MJ"), "a", 2);
        let result = BalancedBatchLoader::from_selections(
            dir.path(),
            &["MJ".to_string(), "ST".to_string()],
            &[0.5, 0.5],
            1.0,
            2,
            &LabelFilter::new("ab", false, 5),
            AlignCollate::new(8, 8, false, false),
            0,
            1,
        );
        assert!(result.is_err());
    }
}
