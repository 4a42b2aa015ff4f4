pub mod augment;
mod flo;

use crate::core::config::{Shape3, TrainConfig};
use anyhow::{ensure, Context};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use walkdir::WalkDir;

pub use augment::Augmentation;
use flo::read_flo;

const IMG1_SUFFIX: &str = "_img1";
const IMG2_SUFFIX: &str = "_img2";
const FLOW_SUFFIX: &str = "_flow.flo";
const PREFETCH_BATCHES: usize = 2;

/// One training pair with its ground truth flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSample {
    pub img_0: PathBuf,
    pub img_1: PathBuf,
    pub flow: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FlowDataset {
    pub samples: Vec<FlowSample>,
}

impl FlowDataset {
    /// Finds every `<stem>_img1.<ext>` with a matching `<stem>_img2.<ext>` and
    /// `<stem>_flow.flo` below `root`.
    pub fn discover(root: &Path) -> anyhow::Result<Self> {
        let mut samples = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let Some(prefix) = stem.strip_suffix(IMG1_SUFFIX) else {
                continue;
            };
            let img_1 = path.with_file_name(format!("{prefix}{IMG2_SUFFIX}.{ext}"));
            let flow = path.with_file_name(format!("{prefix}{FLOW_SUFFIX}"));
            if img_1.is_file() && flow.is_file() {
                samples.push(FlowSample {
                    img_0: path.to_path_buf(),
                    img_1,
                    flow,
                });
            } else {
                log::warn!("skipping {}: missing second image or flow", path.display());
            }
        }
        ensure!(
            !samples.is_empty(),
            "no training samples (*_img1/*_img2/*_flow.flo) found in {}",
            root.display()
        );
        samples.sort_by(|a, b| a.img_0.cmp(&b.img_0));
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A decoded batch kept in host memory, channel-planar:
/// images `[B, 3, H, W]`, flows `[B, 2, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub size: usize,
    pub height: usize,
    pub width: usize,
    pub imgs_0: Vec<f32>,
    pub imgs_1: Vec<f32>,
    pub flows: Vec<f32>,
}

impl HostBatch {
    pub fn image_len(&self) -> usize {
        3 * self.height * self.width
    }

    pub fn flow_len(&self) -> usize {
        2 * self.height * self.width
    }

    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let (b, h, w) = (self.size, self.height, self.width);
        let imgs_0 = Tensor::from_slice(&self.imgs_0, (b, 3, h, w), device)?;
        let imgs_1 = Tensor::from_slice(&self.imgs_1, (b, 3, h, w), device)?;
        let flows = Tensor::from_slice(&self.flows, (b, 2, h, w), device)?;
        Ok((imgs_0, imgs_1, flows))
    }

    fn from_samples(net: Shape3, decoded: Vec<DecodedSample>) -> Self {
        let size = decoded.len();
        let mut batch = Self {
            size,
            height: net.height,
            width: net.width,
            imgs_0: Vec::with_capacity(size * 3 * net.height * net.width),
            imgs_1: Vec::with_capacity(size * 3 * net.height * net.width),
            flows: Vec::with_capacity(size * 2 * net.height * net.width),
        };
        for s in decoded {
            batch.imgs_0.extend(s.img_0);
            batch.imgs_1.extend(s.img_1);
            batch.flows.extend(s.flow);
        }
        batch
    }
}

struct DecodedSample {
    img_0: Vec<f32>,
    img_1: Vec<f32>,
    flow: Vec<f32>,
}

/// Shapes the decoder checks records against.
#[derive(Debug, Clone, Copy)]
pub struct DecodeShapes {
    pub data: Shape3,
    pub net: Shape3,
    pub record_bytes: usize,
}

impl DecodeShapes {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            data: cfg.d_shape_img,
            net: cfg.img_net_shape,
            record_bytes: cfg.record_bytes,
        }
    }

    fn crop_origin(&self) -> (usize, usize) {
        (
            (self.data.height - self.net.height) / 2,
            (self.data.width - self.net.width) / 2,
        )
    }
}

fn load_image(path: &Path, shapes: &DecodeShapes) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    ensure!(
        (h as usize, w as usize) == (shapes.data.height, shapes.data.width),
        "{} is {}x{}, expected {}x{}",
        path.display(),
        h,
        w,
        shapes.data.height,
        shapes.data.width
    );
    let (top, left) = shapes.crop_origin();
    let (nh, nw) = (shapes.net.height, shapes.net.width);
    let mut out = Vec::with_capacity(3 * nh * nw);
    for c in 0..3 {
        for y in 0..nh {
            for x in 0..nw {
                let p = img.get_pixel((left + x) as u32, (top + y) as u32);
                out.push(p[c] as f32 / 255.0);
            }
        }
    }
    Ok(out)
}

fn load_flow(path: &Path, shapes: &DecodeShapes) -> anyhow::Result<Vec<f32>> {
    let flow = read_flo(path, Some(shapes.record_bytes))?;
    ensure!(
        (flow.height, flow.width) == (shapes.data.height, shapes.data.width),
        "{} is {}x{}, expected {}x{}",
        path.display(),
        flow.height,
        flow.width,
        shapes.data.height,
        shapes.data.width
    );
    let (top, left) = shapes.crop_origin();
    let (nh, nw) = (shapes.net.height, shapes.net.width);
    let plane = flow.height * flow.width;
    let mut out = Vec::with_capacity(2 * nh * nw);
    for c in 0..2 {
        for y in 0..nh {
            let row = c * plane + (top + y) * flow.width + left;
            out.extend_from_slice(&flow.data[row..row + nw]);
        }
    }
    Ok(out)
}

fn load_sample(sample: &FlowSample, shapes: &DecodeShapes) -> anyhow::Result<DecodedSample> {
    Ok(DecodedSample {
        img_0: load_image(&sample.img_0, shapes)?,
        img_1: load_image(&sample.img_1, shapes)?,
        flow: load_flow(&sample.flow, shapes)?,
    })
}

pub fn load_batch(samples: &[FlowSample], shapes: &DecodeShapes) -> anyhow::Result<HostBatch> {
    let decoded = samples
        .par_iter()
        .map(|s| load_sample(s, shapes))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(HostBatch::from_samples(shapes.net, decoded))
}

/// Endless stream of batches decoded on a background thread.
pub struct Batcher {
    rx: mpsc::Receiver<anyhow::Result<HostBatch>>,
    dataset_len: usize,
}

impl Batcher {
    pub fn dataset_len(&self) -> usize {
        self.dataset_len
    }
}

impl Iterator for Batcher {
    type Item = anyhow::Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Order in which samples are visited; epochs wrap around so every batch is full.
struct EpochOrder {
    len: usize,
    order: Vec<usize>,
    pos: usize,
    shuffle: bool,
    rng: ChaCha8Rng,
}

impl EpochOrder {
    fn new(len: usize, shuffle: bool, seed: u64) -> Self {
        let mut this = Self {
            len,
            order: (0..len).collect(),
            pos: 0,
            shuffle,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        if shuffle {
            this.order.shuffle(&mut this.rng);
        }
        this
    }

    fn take(&mut self, n: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos == self.len {
                self.pos = 0;
                if self.shuffle {
                    self.order.shuffle(&mut self.rng);
                }
            }
            out.push(self.order[self.pos]);
            self.pos += 1;
        }
        out
    }
}

/// Opens `datadir` and starts decoding batches of `batchsize`.
pub fn get_data(cfg: &TrainConfig, shuffle: bool) -> anyhow::Result<Batcher> {
    let dataset = FlowDataset::discover(&cfg.datadir)?;
    log::info!(
        "Load dataset: {} samples from {}",
        dataset.len(),
        cfg.datadir.display()
    );
    let dataset_len = dataset.len();
    let shapes = DecodeShapes::from_config(cfg);
    let batchsize = cfg.batchsize;
    let mut order = EpochOrder::new(dataset_len, shuffle, cfg.seed);

    let (tx, rx) = mpsc::sync_channel(PREFETCH_BATCHES);
    thread::Builder::new()
        .name("flow-prefetch".into())
        .spawn(move || loop {
            let picked: Vec<FlowSample> = order
                .take(batchsize)
                .into_iter()
                .map(|i| dataset.samples[i].clone())
                .collect();
            let batch = load_batch(&picked, &shapes);
            let failed = batch.is_err();
            if tx.send(batch).is_err() || failed {
                break;
            }
        })?;

    Ok(Batcher { rx, dataset_len })
}
