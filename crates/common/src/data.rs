//! Data pipeline: CIFAR-10 binary loading, balanced subsets, batching.
//!
//! CIFAR-10 ships as binary files of fixed-size records: one label byte
//! followed by 3072 pixel bytes (3 × 32 × 32, channel-major). Files are
//! memory-mapped and copied into an in-memory [`ImageDataset`]; batches are
//! normalised to f32 on the fly.
//!
//! * **[`Cifar10File`]**: zero-copy view over one `.bin` file via `memmap2`.
//! * **[`ImageDataset`]**: labelled u8 images; [`ImageDataset::batches`].
//! * **[`BatchDataset`]**: what the trainer iterates over.
//! * **[`batch_to_tensors`]**: [`ImageBatch`] → `[B, C, H, W]` / `[B]` tensors.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ── CIFAR-10 binary format ──────────────────────────────────────────────────

pub const CIFAR10_CHANNELS: usize = 3;
pub const CIFAR10_HEIGHT: usize = 32;
pub const CIFAR10_WIDTH: usize = 32;
pub const CIFAR10_NUM_CLASSES: usize = 10;
/// Pixel bytes per record.
pub const CIFAR10_IMAGE_BYTES: usize = CIFAR10_CHANNELS * CIFAR10_HEIGHT * CIFAR10_WIDTH;
/// Label byte + pixel bytes.
pub const CIFAR10_RECORD_BYTES: usize = 1 + CIFAR10_IMAGE_BYTES;

/// Per-channel mean of the CIFAR-10 training set (pixels in [0, 1]).
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel standard deviation of the CIFAR-10 training set.
pub const CIFAR10_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILES: [&str; 1] = ["test_batch.bin"];

/// Which half of the dataset to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn files(self) -> &'static [&'static str] {
        match self {
            Split::Train => &TRAIN_FILES,
            Split::Test => &TEST_FILES,
        }
    }
}

/// Memory-mapped CIFAR-10 binary file.
pub struct Cifar10File {
    mmap: Mmap,
    num_records: usize,
}

impl Cifar10File {
    /// Map and validate one `.bin` file.
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        let file =
            File::open(path).with_context(|| format!("open cifar file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap cifar file")? };
        if mmap.len() % CIFAR10_RECORD_BYTES != 0 {
            anyhow::bail!(
                "{}: length {} is not a multiple of the {}-byte record size",
                path.display(),
                mmap.len(),
                CIFAR10_RECORD_BYTES
            );
        }
        let num_records = mmap.len() / CIFAR10_RECORD_BYTES;
        let file = Self { mmap, num_records };
        for (i, (label, _)) in file.records().enumerate() {
            if label as usize >= CIFAR10_NUM_CLASSES {
                anyhow::bail!("{}: record {i} has invalid label {label}", path.display());
            }
        }
        Ok(file)
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    /// `(label, pixels)` of record `i`, or `None` past the end.
    /// Pixels are channel-major u8.
    #[inline]
    pub fn record(&self, i: usize) -> Option<(u8, &[u8])> {
        let start = i.checked_mul(CIFAR10_RECORD_BYTES)?;
        let end = start.checked_add(CIFAR10_RECORD_BYTES)?;
        let rec = self.mmap.get(start..end)?;
        Some((rec[0], &rec[1..]))
    }

    /// All records in file order.
    pub fn records(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        self.mmap
            .chunks_exact(CIFAR10_RECORD_BYTES)
            .map(|rec| (rec[0], &rec[1..]))
    }
}

// ── ImageDataset ────────────────────────────────────────────────────────────

/// Labelled images held in memory as raw u8 pixels.
pub struct ImageDataset {
    pixels: Vec<u8>,
    labels: Vec<u32>,
    channels: usize,
    height: usize,
    width: usize,
    num_classes: usize,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ImageDataset {
    /// Build from raw channel-major pixels. Normalisation defaults to
    /// scaling into [0, 1] only (mean 0, std 1).
    pub fn from_raw(
        pixels: Vec<u8>,
        labels: Vec<u32>,
        channels: usize,
        height: usize,
        width: usize,
        num_classes: usize,
    ) -> AnyhowResult<Self> {
        let image_bytes = channels * height * width;
        if image_bytes == 0 {
            anyhow::bail!("image dimensions must be non-zero");
        }
        if pixels.len() != labels.len() * image_bytes {
            anyhow::bail!(
                "pixel buffer has {} bytes, expected {} images × {} bytes",
                pixels.len(),
                labels.len(),
                image_bytes
            );
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            anyhow::bail!("label {bad} out of range for {num_classes} classes");
        }
        Ok(Self {
            pixels,
            labels,
            channels,
            height,
            width,
            num_classes,
            mean: vec![0.0; channels],
            std: vec![1.0; channels],
        })
    }

    /// Load a CIFAR-10 split from a directory holding the `.bin` files.
    ///
    /// `subset` in (0, 1) keeps a class-balanced fraction of the split
    /// (sampled with `seed`); `None` or ≥ 1 keeps everything.
    pub fn load_cifar10(
        dir: &Path,
        split: Split,
        subset: Option<f64>,
        seed: u64,
    ) -> AnyhowResult<Self> {
        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for name in split.files() {
            let file = Cifar10File::open(&dir.join(name))?;
            pixels.reserve(file.num_records() * CIFAR10_IMAGE_BYTES);
            labels.reserve(file.num_records());
            for (label, image) in file.records() {
                labels.push(label as u32);
                pixels.extend_from_slice(image);
            }
        }
        let dataset = Self::from_raw(
            pixels,
            labels,
            CIFAR10_CHANNELS,
            CIFAR10_HEIGHT,
            CIFAR10_WIDTH,
            CIFAR10_NUM_CLASSES,
        )?
        .with_normalization(CIFAR10_MEAN.to_vec(), CIFAR10_STD.to_vec())?;

        let dataset = match subset {
            Some(ratio) if ratio < 1.0 => dataset.balanced_subset(ratio, seed)?,
            _ => dataset,
        };
        tracing::info!(
            split = ?split,
            images = dataset.len(),
            dir = %dir.display(),
            "Loaded CIFAR-10"
        );
        Ok(dataset)
    }

    /// Per-channel normalisation applied when batching: `(p/255 - mean) / std`.
    pub fn with_normalization(mut self, mean: Vec<f32>, std: Vec<f32>) -> AnyhowResult<Self> {
        if mean.len() != self.channels || std.len() != self.channels {
            anyhow::bail!(
                "normalisation needs {} channels, got mean {} / std {}",
                self.channels,
                mean.len(),
                std.len()
            );
        }
        if std.iter().any(|&s| s <= 0.0) {
            anyhow::bail!("normalisation std must be positive");
        }
        self.mean = mean;
        self.std = std;
        Ok(self)
    }

    /// Keep `floor(len × ratio / num_classes)` images of every class.
    pub fn balanced_subset(self, ratio: f64, seed: u64) -> AnyhowResult<Self> {
        if !(ratio > 0.0) {
            anyhow::bail!("subset ratio must be positive, got {ratio}");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = balanced_subset_indices(&self.labels, self.num_classes, ratio, &mut rng);
        indices.sort_unstable();

        let image_bytes = self.image_bytes();
        let mut pixels = Vec::with_capacity(indices.len() * image_bytes);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in &indices {
            pixels.extend_from_slice(&self.pixels[i * image_bytes..(i + 1) * image_bytes]);
            labels.push(self.labels[i]);
        }
        Ok(Self {
            pixels,
            labels,
            ..self
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// `(channels, height, width)`.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    fn image_bytes(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Yield normalised batches. The last partial batch is kept.
    ///
    /// With `shuffle_seed` the visiting order is a seeded permutation,
    /// otherwise images come in storage order.
    pub fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> impl Iterator<Item = ImageBatch> + '_ {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        let batch_size = batch_size.max(1);
        let mut start = 0usize;
        std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let batch = self.gather(&order[start..end]);
            start = end;
            Some(batch)
        })
    }

    fn gather(&self, indices: &[usize]) -> ImageBatch {
        let image_bytes = self.image_bytes();
        let plane = self.height * self.width;
        let mut pixels = Vec::with_capacity(indices.len() * image_bytes);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let image = &self.pixels[i * image_bytes..(i + 1) * image_bytes];
            for (c, channel) in image.chunks_exact(plane).enumerate() {
                let (mean, std) = (self.mean[c], self.std[c]);
                pixels.extend(channel.iter().map(|&p| (p as f32 / 255.0 - mean) / std));
            }
            labels.push(self.labels[i]);
        }
        ImageBatch {
            pixels,
            labels,
            channels: self.channels,
            height: self.height,
            width: self.width,
        }
    }
}

/// Class-balanced sample without replacement.
///
/// Every class contributes `floor(len × ratio / num_classes)` indices (capped
/// at the class population).
pub fn balanced_subset_indices(
    labels: &[u32],
    num_classes: usize,
    ratio: f64,
    rng: &mut StdRng,
) -> Vec<usize> {
    if num_classes == 0 {
        return Vec::new();
    }
    let per_class = (labels.len() as f64 * ratio / num_classes as f64) as usize;
    let mut out = Vec::with_capacity(per_class * num_classes);
    for class in 0..num_classes as u32 {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == class)
            .map(|(i, _)| i)
            .collect();
        let take = per_class.min(members.len());
        out.extend(members.choose_multiple(rng, take).copied());
    }
    out
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// One normalised batch, channel-major per image.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub pixels: Vec<f32>,
    pub labels: Vec<u32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Common interface for datasets that yield labelled image batches.
pub trait BatchDataset {
    fn num_images(&self) -> usize;

    fn num_batches(&self, batch_size: usize) -> usize {
        self.num_images().div_ceil(batch_size.max(1))
    }

    fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_>;
}

impl BatchDataset for ImageDataset {
    fn num_images(&self) -> usize {
        self.len()
    }

    fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        Box::new(self.batches(batch_size, shuffle_seed))
    }
}

/// Convert an [`ImageBatch`] to `([B, C, S, S] f32, [B] u32)` tensors.
///
/// When the stored images are not `image_size` square they are resized with
/// nearest-neighbour sampling.
pub fn batch_to_tensors(
    batch: &ImageBatch,
    image_size: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let b = batch.len();
    let images = Tensor::from_slice(
        &batch.pixels,
        (b, batch.channels, batch.height, batch.width),
        device,
    )?;
    let images = if batch.height != image_size || batch.width != image_size {
        images.upsample_nearest2d(image_size, image_size)?
    } else {
        images
    };
    let labels = Tensor::from_slice(&batch.labels, b, device)?;
    Ok((images, labels))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tiny_dataset(n: usize) -> ImageDataset {
        let (c, h, w) = (3, 2, 2);
        let pixels: Vec<u8> = (0..n * c * h * w).map(|i| (i % 256) as u8).collect();
        let labels: Vec<u32> = (0..n as u32).map(|i| i % 2).collect();
        ImageDataset::from_raw(pixels, labels, c, h, w, 2).unwrap()
    }

    #[test]
    fn from_raw_rejects_mismatched_buffer() {
        assert!(ImageDataset::from_raw(vec![0; 11], vec![0], 3, 2, 2, 2).is_err());
        assert!(ImageDataset::from_raw(vec![0; 12], vec![5], 3, 2, 2, 2).is_err());
    }

    #[test]
    fn batches_keep_partial_tail() {
        let ds = tiny_dataset(5);
        let sizes: Vec<usize> = ds.batches(2, None).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(BatchDataset::num_batches(&ds, 2), 3);
    }

    #[test]
    fn shuffled_batches_are_a_permutation() {
        let ds = tiny_dataset(8);
        let mut seen: Vec<u32> = ds
            .batches(3, Some(7))
            .flat_map(|b| b.labels.into_iter())
            .collect();
        seen.sort_unstable();
        let mut expected = ds.labels().to_vec();
        expected.sort_unstable();
        assert_eq!(seen, expected);

        let a: Vec<f32> = ds.batches(8, Some(7)).next().unwrap().pixels;
        let b: Vec<f32> = ds.batches(8, Some(7)).next().unwrap().pixels;
        assert_eq!(a, b);
    }

    #[test]
    fn normalisation_applies_per_channel() {
        let pixels = vec![255u8, 255, 0, 0, 51, 51];
        let ds = ImageDataset::from_raw(pixels, vec![0], 3, 1, 2, 1)
            .unwrap()
            .with_normalization(vec![0.5, 0.0, 0.2], vec![0.5, 1.0, 0.1])
            .unwrap();
        let batch = ds.batches(1, None).next().unwrap();
        let expected = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        for (got, want) in batch.pixels.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn balanced_subset_takes_equal_counts() {
        let labels: Vec<u32> = (0..100).map(|i| i % 4).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let idx = balanced_subset_indices(&labels, 4, 0.2, &mut rng);
        assert_eq!(idx.len(), 20);
        for class in 0..4 {
            let count = idx.iter().filter(|&&i| labels[i] == class).count();
            assert_eq!(count, 5);
        }
        let mut dedup = idx.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), idx.len());
    }

    #[test]
    fn batch_to_tensors_shapes_and_resize() {
        let ds = tiny_dataset(3);
        let batch = ds.batches(3, None).next().unwrap();
        let (images, labels) = batch_to_tensors(&batch, 2, &Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[3, 3, 2, 2]);
        assert_eq!(labels.dims(), &[3]);

        let (images, _) = batch_to_tensors(&batch, 4, &Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[3, 3, 4, 4]);
    }

    #[test]
    fn batch_to_tensors_keeps_values_and_leaves_batch_intact() {
        let ds = tiny_dataset(2);
        let batch = ds.batches(2, None).next().unwrap();
        let (images, labels) = batch_to_tensors(&batch, 2, &Device::Cpu).unwrap();
        let flat: Vec<f32> = images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, batch.pixels);
        assert_eq!(labels.to_vec1::<u32>().unwrap(), batch.labels);

        // The same batch converts again without being consumed.
        let (again, _) = batch_to_tensors(&batch, 2, &Device::Cpu).unwrap();
        assert_eq!(again.flatten_all().unwrap().to_vec1::<f32>().unwrap(), flat);
    }

    fn write_cifar_file(path: &Path, labels: &[u8]) {
        let mut f = File::create(path).unwrap();
        for (i, &label) in labels.iter().enumerate() {
            f.write_all(&[label]).unwrap();
            f.write_all(&vec![i as u8; CIFAR10_IMAGE_BYTES]).unwrap();
        }
    }

    #[test]
    fn cifar_file_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_batch.bin");
        write_cifar_file(&path, &[3, 9, 0]);
        let file = Cifar10File::open(&path).unwrap();
        assert_eq!(file.num_records(), 3);
        let (label, pixels) = file.record(1).unwrap();
        assert_eq!(label, 9);
        assert_eq!(pixels.len(), CIFAR10_IMAGE_BYTES);
        assert!(pixels.iter().all(|&p| p == 1));
        assert!(file.record(3).is_none());
        assert!(file.record(usize::MAX).is_none());
        let labels: Vec<u8> = file.records().map(|(l, _)| l).collect();
        assert_eq!(labels, vec![3, 9, 0]);

        let ds = ImageDataset::load_cifar10(dir.path(), Split::Test, None, 0).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.labels(), &[3, 9, 0]);
        assert_eq!(ds.image_dims(), (3, 32, 32));
    }

    #[test]
    fn cifar_file_rejects_truncated_and_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        let truncated = dir.path().join("short.bin");
        std::fs::write(&truncated, vec![0u8; CIFAR10_RECORD_BYTES + 5]).unwrap();
        assert!(Cifar10File::open(&truncated).is_err());

        let bad = dir.path().join("bad.bin");
        write_cifar_file(&bad, &[10]);
        assert!(Cifar10File::open(&bad).is_err());
    }
}
