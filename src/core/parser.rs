use crate::models::WhichModel;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "FlowNet train with candle")]
#[command(version = "0.1")]
#[command(about = "Optical flow estimation (FlowNet) training using candle", long_about = None)]
pub struct Learner {
    /// Directory to put the input data.
    #[arg(long, default_value = "data/flying/train/")]
    pub datadir: PathBuf,

    /// Directory where to write event logs and checkpoints
    #[arg(long, default_value = "log_drop")]
    pub logdir: PathBuf,

    /// Make image summary
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub imgsummary: bool,

    /// Make data augmentation
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    pub augmentation: bool,

    /// weights regularizer, 0 disables it
    #[arg(long = "weights_reg", visible_alias = "weights-reg", default_value_t = 0.0)]
    pub weights_reg: f64,

    /// base directory for relative datadir/logdir, defaults to the executable's directory
    #[arg(long)]
    pub basedir: Option<PathBuf>,

    /// which network to build
    #[arg(short, long, value_enum, default_value_t = WhichModel::FlownetSDropout)]
    pub model: WhichModel,

    /// run on cpu even if cuda is available
    #[arg(long, default_value_t = false)]
    pub cpu: bool,

    /// seed
    #[arg(short, long, default_value_t = 42)]
    pub seed: u64,
}
