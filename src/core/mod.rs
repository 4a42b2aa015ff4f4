pub mod config;
mod parser;
mod recoder;
mod runloops;
pub mod saver;
pub mod schedule;
pub mod summary;
pub mod train_op;
pub use config::TrainConfig;
pub use parser::Learner;
pub use recoder::build_log_config;
pub use runloops::run;
