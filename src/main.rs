#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod core;
mod datasets;
mod models;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let lnr = core::Learner::parse();
    let cfg = core::TrainConfig::from_learner(&lnr)?;
    let _log_handle = log4rs::init_config(core::build_log_config(&cfg.train_dir())?)?;
    log::info!("{:?}", lnr);

    core::run(&cfg)?;
    Ok(())
}
