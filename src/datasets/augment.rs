//! Random geometric and photometric augmentation of host batches.
//!
//! Geometry is an inverse warp: for every output pixel a similarity transform
//! gives the source position in the original image. The second image gets a
//! slightly different transform, and the ground truth flow is rebuilt so it
//! still maps pixels of the new first image onto the new second image.

use super::HostBatch;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const TRANSLATE: f32 = 0.2;
const ROTATE_DEG: f32 = 17.0;
const ZOOM: (f32, f32) = (0.9, 2.0);
const REL_TRANSLATE: f32 = 0.03;
const REL_ROTATE_DEG: f32 = 2.3;
const REL_ZOOM: (f32, f32) = (0.95, 1.05);

const NOISE_SIGMA_MAX: f32 = 0.04;
const CONTRAST: (f32, f32) = (-0.8, 0.4);
const COLOR_GAIN: (f32, f32) = (0.5, 2.0);
const GAMMA: (f32, f32) = (0.7, 1.5);
const BRIGHTNESS_SIGMA: f32 = 0.2;

/// Maps an output pixel to its source position:
/// `src = scale * R(angle) * (p - c) + c + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub angle: f32,
    pub scale: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        angle: 0.0,
        scale: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    fn forward(&self, x: f32, y: f32, cx: f32, cy: f32) -> (f32, f32) {
        let (s, c) = self.angle.sin_cos();
        let (dx, dy) = (x - cx, y - cy);
        (
            self.scale * (c * dx - s * dy) + cx + self.tx,
            self.scale * (s * dx + c * dy) + cy + self.ty,
        )
    }

    fn inverse(&self, x: f32, y: f32, cx: f32, cy: f32) -> (f32, f32) {
        let (s, c) = self.angle.sin_cos();
        let (dx, dy) = (x - cx - self.tx, y - cy - self.ty);
        (
            (c * dx + s * dy) / self.scale + cx,
            (-s * dx + c * dy) / self.scale + cy,
        )
    }
}

/// Shared photometric parameters for both images of a pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chromatic {
    pub brightness: f32,
    pub contrast: f32,
    pub gain: [f32; 3],
    pub gamma: f32,
    pub noise_sigma: f32,
}

/// Clamp-to-edge bilinear lookup in one `h x w` plane.
fn bilinear(plane: &[f32], h: usize, w: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let top = plane[y0 * w + x0] * (1.0 - fx) + plane[y0 * w + x1] * fx;
    let bottom = plane[y1 * w + x0] * (1.0 - fx) + plane[y1 * w + x1] * fx;
    top * (1.0 - fy) + bottom * fy
}

fn warp_image(img: &[f32], h: usize, w: usize, t: &Similarity) -> Vec<f32> {
    let (cx, cy) = ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0);
    let plane = h * w;
    let mut out = vec![0f32; img.len()];
    for c in 0..3 {
        let src = &img[c * plane..(c + 1) * plane];
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = t.forward(x as f32, y as f32, cx, cy);
                out[c * plane + y * w + x] = bilinear(src, h, w, sx, sy);
            }
        }
    }
    out
}

fn warp_flow(flow: &[f32], h: usize, w: usize, t0: &Similarity, t1: &Similarity) -> Vec<f32> {
    let (cx, cy) = ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0);
    let plane = h * w;
    let (u, v) = flow.split_at(plane);
    let mut out = vec![0f32; flow.len()];
    for y in 0..h {
        for x in 0..w {
            let (px, py) = (x as f32, y as f32);
            let (q0x, q0y) = t0.forward(px, py, cx, cy);
            let q1x = q0x + bilinear(u, h, w, q0x, q0y);
            let q1y = q0y + bilinear(v, h, w, q0x, q0y);
            let (p1x, p1y) = t1.inverse(q1x, q1y, cx, cy);
            out[y * w + x] = p1x - px;
            out[plane + y * w + x] = p1y - py;
        }
    }
    out
}

/// Warps one pair and its flow in place.
pub fn affine_sample(
    img_0: &mut [f32],
    img_1: &mut [f32],
    flow: &mut [f32],
    h: usize,
    w: usize,
    t0: &Similarity,
    t1: &Similarity,
) {
    let warped_0 = warp_image(img_0, h, w, t0);
    let warped_1 = warp_image(img_1, h, w, t1);
    let warped_flow = warp_flow(flow, h, w, t0, t1);
    img_0.copy_from_slice(&warped_0);
    img_1.copy_from_slice(&warped_1);
    flow.copy_from_slice(&warped_flow);
}

fn chromatic_image<R: Rng>(img: &mut [f32], plane: usize, p: &Chromatic, rng: &mut R) {
    let mean = img.iter().sum::<f32>() / img.len().max(1) as f32;
    let noise = Normal::new(0.0, p.noise_sigma.max(f32::MIN_POSITIVE)).ok();
    for (c, channel) in img.chunks_mut(plane).enumerate() {
        for v in channel.iter_mut() {
            let mut x = *v + p.brightness;
            x = (x - mean) * (1.0 + p.contrast) + mean;
            x = (x * p.gain[c]).clamp(0.0, 1.0);
            x = x.powf(p.gamma);
            if let Some(noise) = &noise {
                x += noise.sample(rng);
            }
            *v = x.clamp(0.0, 1.0);
        }
    }
}

/// Random augmentation state for the whole run.
pub struct Augmentation {
    rng: ChaCha8Rng,
    batches: u64,
}

impl Augmentation {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            batches: 0,
        }
    }

    /// Number of batches augmented so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    fn sample_similarity(&mut self, h: usize, w: usize) -> (Similarity, Similarity) {
        let rng = &mut self.rng;
        let t0 = Similarity {
            angle: rng.gen_range(-ROTATE_DEG..=ROTATE_DEG).to_radians(),
            scale: 1.0 / rng.gen_range(ZOOM.0..=ZOOM.1),
            tx: rng.gen_range(-TRANSLATE..=TRANSLATE) * w as f32,
            ty: rng.gen_range(-TRANSLATE..=TRANSLATE) * h as f32,
        };
        let t1 = Similarity {
            angle: t0.angle + rng.gen_range(-REL_ROTATE_DEG..=REL_ROTATE_DEG).to_radians(),
            scale: t0.scale / rng.gen_range(REL_ZOOM.0..=REL_ZOOM.1),
            tx: t0.tx + rng.gen_range(-REL_TRANSLATE..=REL_TRANSLATE) * w as f32,
            ty: t0.ty + rng.gen_range(-REL_TRANSLATE..=REL_TRANSLATE) * h as f32,
        };
        (t0, t1)
    }

    fn sample_chromatic(&mut self) -> Chromatic {
        let rng = &mut self.rng;
        let brightness = match Normal::new(0.0, BRIGHTNESS_SIGMA) {
            Ok(d) => d.sample(rng),
            Err(_) => 0.0,
        };
        Chromatic {
            brightness,
            contrast: rng.gen_range(CONTRAST.0..=CONTRAST.1),
            gain: [
                rng.gen_range(COLOR_GAIN.0..=COLOR_GAIN.1),
                rng.gen_range(COLOR_GAIN.0..=COLOR_GAIN.1),
                rng.gen_range(COLOR_GAIN.0..=COLOR_GAIN.1),
            ],
            gamma: rng.gen_range(GAMMA.0..=GAMMA.1),
            noise_sigma: rng.gen_range(0.0..=NOISE_SIGMA_MAX),
        }
    }

    /// Affine transform of images and flows.
    pub fn affine_augm(&mut self, batch: &mut HostBatch) {
        let (h, w) = (batch.height, batch.width);
        let (il, fl) = (batch.image_len(), batch.flow_len());
        for i in 0..batch.size {
            let (t0, t1) = self.sample_similarity(h, w);
            affine_sample(
                &mut batch.imgs_0[i * il..(i + 1) * il],
                &mut batch.imgs_1[i * il..(i + 1) * il],
                &mut batch.flows[i * fl..(i + 1) * fl],
                h,
                w,
                &t0,
                &t1,
            );
        }
    }

    /// Photometric changes of the images, flows untouched.
    pub fn chromatic_augm(&mut self, batch: &mut HostBatch) {
        let plane = batch.height * batch.width;
        let il = batch.image_len();
        for i in 0..batch.size {
            let params = self.sample_chromatic();
            chromatic_image(
                &mut batch.imgs_0[i * il..(i + 1) * il],
                plane,
                &params,
                &mut self.rng,
            );
            chromatic_image(
                &mut batch.imgs_1[i * il..(i + 1) * il],
                plane,
                &params,
                &mut self.rng,
            );
        }
    }

    pub fn apply(&mut self, batch: &mut HostBatch) {
        self.affine_augm(batch);
        self.chromatic_augm(batch);
        self.batches += 1;
    }
}

/// Augments `batch` when `enabled`, otherwise leaves it untouched.
/// Returns whether augmentation ran.
pub fn apply_augmentation(enabled: bool, batch: &mut HostBatch, augm: &mut Augmentation) -> bool {
    if enabled {
        augm.apply(batch);
    }
    enabled
}
