use anyhow::Context;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::path::Path;

/// Info and above to stderr, everything to `<train_dir>/<timestamp>.log`.
pub fn build_log_config(train_dir: &Path) -> anyhow::Result<log4rs::Config> {
    let level = log::LevelFilter::Info;
    if !train_dir.exists() {
        std::fs::create_dir_all(train_dir)?;
    }
    let log_path = train_dir
        .join(chrono::Local::now().format("%Y%m-%d--%H-%M-%S").to_string() + ".log");

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {h({l})} {m}{n}")))
        .build();

    // Pattern: https://docs.rs/log4rs/*/log4rs/encode/pattern/index.html
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%+)(utc)} [{f}:{L}] {h({l})} -> {m}{n}",
        )))
        .build(&log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(stderr)),
        )
        .build(
            Root::builder()
                .appender("logfile")
                .appender("stderr")
                .build(log::LevelFilter::Trace),
        )?;

    Ok(config)
}
