use image::{Rgb, RgbImage};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
struct ScalarEvent<'a> {
    step: u64,
    wall_time: f64,
    tag: &'a str,
    value: f64,
}

/// Per-phase timings of one training step, in milliseconds.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StepTrace {
    pub step: u64,
    pub data_wait_ms: f64,
    pub augmentation_ms: f64,
    pub forward_ms: f64,
    pub backward_ms: f64,
}

/// Scalars go to `events.jsonl`, images to `images/<tag>/`.
pub struct SummaryWriter {
    dir: PathBuf,
    events: BufWriter<File>,
    images: bool,
    max_images: usize,
}

impl SummaryWriter {
    pub fn new(train_dir: &Path, images: bool, max_images: usize) -> anyhow::Result<Self> {
        std::fs::create_dir_all(train_dir)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(train_dir.join(EVENTS_FILE))?;
        Ok(Self {
            dir: train_dir.to_path_buf(),
            events: BufWriter::new(events),
            images,
            max_images,
        })
    }

    pub fn scalars(&mut self, step: u64, values: &[(&str, f64)]) -> anyhow::Result<()> {
        let wall_time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        for (tag, value) in values {
            let event = ScalarEvent {
                step,
                wall_time,
                tag,
                value: *value,
            };
            serde_json::to_writer(&mut self.events, &event)?;
            self.events.write_all(b"\n")?;
        }
        self.events.flush()?;
        Ok(())
    }

    /// Writes up to `max_images` samples of a channel-planar batch. Flows are
    /// colour coded. Returns how many files were written.
    pub fn image_summary(
        &self,
        step: u64,
        tag: &str,
        imgs_0: Option<&[f32]>,
        imgs_1: Option<&[f32]>,
        flows: Option<&[f32]>,
        height: usize,
        width: usize,
    ) -> anyhow::Result<usize> {
        if !self.images {
            return Ok(0);
        }
        let dir = self.dir.join("images").join(tag);
        std::fs::create_dir_all(&dir)?;
        let plane = height * width;
        let mut written = 0;
        for (kind, data, channels) in [("img0", imgs_0, 3), ("img1", imgs_1, 3), ("flow", flows, 2)] {
            let Some(data) = data else { continue };
            let per_sample = channels * plane;
            for (i, sample) in data.chunks_exact(per_sample).take(self.max_images).enumerate() {
                let img = if channels == 3 {
                    chw_to_rgb(sample, height, width)
                } else {
                    let (u, v) = sample.split_at(plane);
                    flow_to_rgb(u, v, height, width)
                };
                img.save(dir.join(format!("{step:08}_{i}_{kind}.png")))?;
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn trace(&self, trace: &StepTrace) -> anyhow::Result<()> {
        let path = self.dir.join(format!("trace_{}.json", trace.step));
        serde_json::to_writer_pretty(File::create(path)?, trace)?;
        Ok(())
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn chw_to_rgb(img: &[f32], height: usize, width: usize) -> RgbImage {
    let plane = height * width;
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([to_u8(img[i]), to_u8(img[plane + i]), to_u8(img[2 * plane + i])])
    })
}

/// Direction as hue, magnitude (relative to the largest in the field) as value.
pub fn flow_to_rgb(u: &[f32], v: &[f32], height: usize, width: usize) -> RgbImage {
    let max_mag = u
        .iter()
        .zip(v)
        .map(|(a, b)| a.hypot(*b))
        .fold(0f32, f32::max)
        .max(1e-6);
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        let hue = (v[i].atan2(u[i]) / std::f32::consts::PI + 1.0) * 180.0;
        let value = u[i].hypot(v[i]) / max_mag;
        let (r, g, b) = hsv_to_rgb(hue, 1.0, value);
        Rgb([to_u8(r), to_u8(g), to_u8(b)])
    })
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let hp = (h % 360.0) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    (r + m, g + m, b + m)
}
