mod loss;
mod model;
pub use loss::{full_resolution, multiscale_epe};
pub use model::FlowNetS;
