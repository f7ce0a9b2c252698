//! Datasets - `gt.txt` indexed image folders and batch collation

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use glob::glob;
use image::imageops::FilterType;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Batch, ValidationSource};

/// Index file expected in every dataset directory.
pub const GT_FILE: &str = "gt.txt";

/// Normalizes raw labels: case folding, alphabet filtering and length limit.
#[derive(Clone, Debug)]
pub struct LabelFilter {
    alphabet: HashSet<char>,
    sensitive: bool,
    batch_max_length: usize,
}

impl LabelFilter {
    pub fn new(character: &str, sensitive: bool, batch_max_length: usize) -> Self {
        Self {
            alphabet: character.chars().collect(),
            sensitive,
            batch_max_length,
        }
    }

    /// Returns the cleaned label, or None when the sample should be dropped.
    pub fn apply(&self, raw: &str) -> Option<String> {
        let label = if self.sensitive {
            raw.to_string()
        } else {
            raw.to_lowercase()
        };
        let label: String = label.chars().filter(|c| self.alphabet.contains(c)).collect();
        let len = label.chars().count();
        if len == 0 || len > self.batch_max_length {
            return None;
        }
        Some(label)
    }
}

/// Images listed in one `gt.txt` (`relative/path<TAB>label` per line).
#[derive(Clone, Debug)]
pub struct LabeledImageDataset {
    pub root: PathBuf,
    pub samples: Vec<(PathBuf, String)>,
}

impl LabeledImageDataset {
    pub fn open(root: &Path, filter: &LabelFilter) -> Result<Self> {
        let gt_path = root.join(GT_FILE);
        let content = std::fs::read_to_string(&gt_path)
            .with_context(|| format!("Failed to read {:?}", gt_path))?;

        let mut samples = Vec::new();
        let mut dropped = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some((rel, raw)) = line.split_once('\t') else {
                debug!("{:?}:{} has no tab separator, skipped", gt_path, lineno + 1);
                dropped += 1;
                continue;
            };
            match filter.apply(raw) {
                Some(label) => samples.push((root.join(rel), label)),
                None => dropped += 1,
            }
        }

        debug!(
            "Dataset {:?}: {} samples ({} dropped)",
            root,
            samples.len(),
            dropped
        );
        Ok(Self {
            root: root.to_path_buf(),
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Concatenates every dataset under `root` whose directory (relative to `root`)
/// contains `selection`. `/` selects everything.
pub fn hierarchical_dataset(
    root: &Path,
    selection: &str,
    filter: &LabelFilter,
) -> Result<Vec<(PathBuf, String)>> {
    if !root.exists() {
        bail!("Dataset root not found: {:?}", root);
    }
    let pattern = format!("{}/**/{}", root.display(), GT_FILE);
    let mut dirs: Vec<PathBuf> = glob(&pattern)?
        .filter_map(|entry| entry.ok())
        .filter_map(|gt| gt.parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();

    let mut samples = Vec::new();
    for dir in dirs {
        let rel = dir
            .strip_prefix(root)
            .unwrap_or(&dir)
            .to_string_lossy()
            .replace('\\', "/");
        if selection != "/" && !rel.contains(selection) {
            continue;
        }
        let dataset = LabeledImageDataset::open(&dir, filter)?;
        info!("sub-directory:\t/{}\t num samples: {}", rel, dataset.len());
        samples.extend(dataset.samples);
    }
    Ok(samples)
}

/// Resizes and normalizes images into one `[B, C, H, W]` tensor.
#[derive(Clone, Debug)]
pub struct AlignCollate {
    pub img_h: usize,
    pub img_w: usize,
    pub rgb: bool,
    /// Keep the aspect ratio and replicate the last column up to `img_w`.
    pub keep_ratio_with_pad: bool,
}

impl AlignCollate {
    pub fn new(img_h: usize, img_w: usize, rgb: bool, keep_ratio_with_pad: bool) -> Self {
        Self {
            img_h,
            img_w,
            rgb,
            keep_ratio_with_pad,
        }
    }

    pub fn channels(&self) -> usize {
        if self.rgb {
            3
        } else {
            1
        }
    }

    pub fn collate(&self, samples: &[(PathBuf, String)]) -> Result<Batch> {
        let pixels: Vec<Vec<f32>> = samples
            .par_iter()
            .map(|(path, _)| self.load(path))
            .collect::<Result<_>>()?;

        let labels = samples.iter().map(|(_, l)| l.clone()).collect();
        let flat: Vec<f32> = pixels.into_iter().flatten().collect();
        let images = Tensor::from_vec(
            flat,
            (samples.len(), self.channels(), self.img_h, self.img_w),
            &Device::Cpu,
        )?;
        Ok(Batch { images, labels })
    }

    /// Decodes one image into CHW floats in `[-1, 1]`.
    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).with_context(|| format!("Failed to open image {:?}", path))?;
        let (h, w) = (self.img_h as u32, self.img_w as u32);
        let c = self.channels();

        let (raw, width, height): (Vec<u8>, u32, u32) = if self.rgb {
            let src = img.to_rgb8();
            let target_w = self.target_width(src.width(), src.height());
            let resized = image::imageops::resize(&src, target_w, h, FilterType::CatmullRom);
            (resized.into_raw(), target_w, h)
        } else {
            let src = img.to_luma8();
            let target_w = self.target_width(src.width(), src.height());
            let resized = image::imageops::resize(&src, target_w, h, FilterType::CatmullRom);
            (resized.into_raw(), target_w, h)
        };
        if width == 0 || height == 0 {
            return Err(anyhow!("Image {:?} resized to an empty canvas", path));
        }

        // HWC u8 -> CHW f32, padded on the right with the last column
        let (width, height) = (width as usize, height as usize);
        let mut out = vec![0f32; c * self.img_h * self.img_w];
        for ch in 0..c {
            for y in 0..height {
                for x in 0..w as usize {
                    let sx = x.min(width - 1);
                    let v = raw[(y * width + sx) * c + ch] as f32 / 255.0;
                    out[(ch * self.img_h + y) * self.img_w + x] = (v - 0.5) / 0.5;
                }
            }
        }
        Ok(out)
    }

    fn target_width(&self, src_w: u32, src_h: u32) -> u32 {
        let w = self.img_w as u32;
        if !self.keep_ratio_with_pad || src_h == 0 {
            return w;
        }
        let ratio = src_w as f64 / src_h as f64;
        let scaled = (self.img_h as f64 * ratio).ceil() as u32;
        scaled.clamp(1, w)
    }
}

/// Sequential pass over a validation set in fixed-size batches.
pub struct ValidationLoader {
    samples: Vec<(PathBuf, String)>,
    collate: AlignCollate,
    batch_size: usize,
}

impl ValidationLoader {
    pub fn new(samples: Vec<(PathBuf, String)>, collate: AlignCollate, batch_size: usize) -> Self {
        if samples.is_empty() {
            warn!("Validation set is empty");
        }
        Self {
            samples,
            collate,
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl ValidationSource for ValidationLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(
            self.samples
                .chunks(self.batch_size)
                .map(move |chunk| self.collate.collate(chunk)),
        )
    }
}
