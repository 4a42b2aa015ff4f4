use crate::core::parser::Learner;
use crate::core::schedule::LrSchedule;
use crate::models::WhichModel;
use anyhow::{ensure, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `.flo` header: tag, width, height.
pub const FLO_HEADER_BYTES: usize = 12;

/// Data shape: height, width, channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape3 {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Shape3 {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.height * self.width * self.channels
    }
}

/// Penalty `scale * sum(w^2) / 2` over the convolution weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L2Regularizer {
    pub scale: f64,
}

impl L2Regularizer {
    pub fn from_coefficient(weights_reg: f64) -> Option<Self> {
        if weights_reg != 0.0 {
            Some(Self { scale: weights_reg })
        } else {
            None
        }
    }
}

/// Everything a run needs, fixed at process start.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batchsize: usize,
    pub d_shape_img: Shape3,
    pub d_shape_flow: Shape3,
    pub img_net_shape: Shape3,
    pub flow_net_shape: Shape3,
    pub record_bytes: usize,
    pub max_steps: u64,
    pub learning_rate: f64,
    pub schedule: LrSchedule,
    pub drop_rate: f32,
    pub img_summary_num: usize,
    pub max_checkpoints: usize,
    pub keep_checkpoint_every_n_hours: f64,
    pub save_summaries_every: Duration,
    pub save_interval: Duration,
    pub log_every_n_steps: u64,
    pub trace_every_n_steps: u64,

    pub datadir: PathBuf,
    pub logdir: PathBuf,
    pub imgsummary: bool,
    pub augmentation: bool,
    pub weights_reg: Option<L2Regularizer>,
    pub model: WhichModel,
    pub use_cpu: bool,
    pub seed: u64,
}

impl TrainConfig {
    pub fn from_learner(lnr: &Learner) -> anyhow::Result<Self> {
        let base = match &lnr.basedir {
            Some(dir) => dir.clone(),
            None => executable_dir()?,
        };
        Ok(Self::with_base(lnr, &base))
    }

    pub fn with_base(lnr: &Learner, base: &Path) -> Self {
        let max_steps = 1_500_000;
        let learning_rate = 1e-4;
        Self {
            batchsize: 8,
            d_shape_img: Shape3::new(384, 512, 3),
            d_shape_flow: Shape3::new(384, 512, 2),
            img_net_shape: Shape3::new(384, 512, 3),
            flow_net_shape: Shape3::new(384, 512, 2),
            record_bytes: 1_572_876,
            max_steps,
            learning_rate,
            schedule: LrSchedule::halving(max_steps, learning_rate),
            drop_rate: 0.5,
            img_summary_num: 2,
            max_checkpoints: 5,
            keep_checkpoint_every_n_hours: 5.0,
            save_summaries_every: Duration::from_secs(60),
            save_interval: Duration::from_secs(300),
            log_every_n_steps: 100,
            trace_every_n_steps: 1000,

            datadir: resolve_dir(base, &lnr.datadir),
            logdir: resolve_dir(base, &lnr.logdir),
            imgsummary: lnr.imgsummary,
            augmentation: lnr.augmentation,
            weights_reg: L2Regularizer::from_coefficient(lnr.weights_reg),
            model: lnr.model,
            use_cpu: lnr.cpu,
            seed: lnr.seed,
        }
    }

    /// Where checkpoints, summaries and logs of this run go.
    pub fn train_dir(&self) -> PathBuf {
        self.logdir.join("train")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.batchsize > 0, "batchsize must be positive");
        ensure!(self.max_steps > 0, "max_steps must be positive");
        ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(
            (0.0..1.0).contains(&self.drop_rate),
            "drop_rate must be in [0, 1), got {}",
            self.drop_rate
        );
        ensure!(self.max_checkpoints > 0, "max_checkpoints must be positive");
        ensure!(
            !self.save_summaries_every.is_zero() && !self.save_interval.is_zero(),
            "summary and checkpoint intervals must be positive"
        );
        ensure!(
            self.log_every_n_steps > 0 && self.trace_every_n_steps > 0,
            "logging intervals must be positive"
        );
        ensure!(
            self.keep_checkpoint_every_n_hours > 0.0,
            "keep_checkpoint_every_n_hours must be positive"
        );

        ensure!(self.d_shape_img.channels == 3, "images must have 3 channels");
        ensure!(self.d_shape_flow.channels == 2, "flows must have 2 channels");
        ensure!(
            self.img_net_shape.channels == 3 && self.flow_net_shape.channels == 2,
            "net shapes must have 3 image and 2 flow channels"
        );
        ensure!(
            (self.d_shape_img.height, self.d_shape_img.width)
                == (self.d_shape_flow.height, self.d_shape_flow.width),
            "image data shape {:?} and flow data shape {:?} differ",
            self.d_shape_img,
            self.d_shape_flow
        );
        ensure!(
            (self.img_net_shape.height, self.img_net_shape.width)
                == (self.flow_net_shape.height, self.flow_net_shape.width),
            "image net shape {:?} and flow net shape {:?} differ",
            self.img_net_shape,
            self.flow_net_shape
        );
        ensure!(
            self.img_net_shape.height > 0
                && self.img_net_shape.height % 64 == 0
                && self.img_net_shape.width > 0
                && self.img_net_shape.width % 64 == 0,
            "net height and width must be positive multiples of 64, got {:?}",
            self.img_net_shape
        );
        ensure!(
            self.img_net_shape.height <= self.d_shape_img.height
                && self.img_net_shape.width <= self.d_shape_img.width,
            "net shape {:?} is larger than data shape {:?}",
            self.img_net_shape,
            self.d_shape_img
        );
        ensure!(
            self.record_bytes == FLO_HEADER_BYTES + self.d_shape_flow.elem_count() * 4,
            "record_bytes {} does not match flow shape {:?}",
            self.record_bytes,
            self.d_shape_flow
        );

        ensure!(
            self.datadir.is_dir(),
            "datadir {} is not a directory",
            self.datadir.display()
        );
        std::fs::read_dir(&self.datadir)
            .with_context(|| format!("datadir {} is not readable", self.datadir.display()))?;
        std::fs::create_dir_all(self.train_dir()).with_context(|| {
            format!("logdir {} is not writable", self.logdir.display())
        })?;
        Ok(())
    }
}

/// `base.join(given)`; an absolute `given` replaces `base`.
pub fn resolve_dir(base: &Path, given: &Path) -> PathBuf {
    base.join(given)
}

/// Directory holding the running executable.
pub fn executable_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let exe = exe.canonicalize().unwrap_or(exe);
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable has no parent directory")
}
