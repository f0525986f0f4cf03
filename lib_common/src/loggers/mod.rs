use std::fs;
use std::path::Path;

use anyhow::Result;

/// Wires the `log` facade through fern: always to stdout, plus a dated
/// file when a log directory is configured.
pub fn setup_logging(log_dir: Option<&Path>, log_level: &str, prefix: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(dir) = log_dir {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let file_name = format!(
            "{}_{}.log",
            prefix,
            chrono::Local::now().format("%Y-%m-%d")
        );
        dispatch = dispatch.chain(fern::log_file(dir.join(file_name))?);
    }

    dispatch.apply()?;
    Ok(())
}
