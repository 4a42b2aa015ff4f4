mod flownet;
pub use flownet::{full_resolution, multiscale_epe, FlowNetS};

use candle_nn::VarBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WhichModel {
    FlownetS,
    FlownetSDropout,
}

/// FlowNetS with dropout on the two deepest encoder stages.
pub fn flownet_dropout(vb: VarBuilder, drop_rate: f32) -> candle_core::Result<FlowNetS> {
    FlowNetS::new(vb, Some(drop_rate))
}

pub fn get_model(
    vb: VarBuilder,
    model: WhichModel,
    drop_rate: f32,
) -> candle_core::Result<FlowNetS> {
    log::info!("Build model: {:?}", model);
    match model {
        WhichModel::FlownetS => FlowNetS::new(vb, None),
        WhichModel::FlownetSDropout => flownet_dropout(vb, drop_rate),
    }
}
