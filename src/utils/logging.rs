use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("relay_scraper={}", level).parse()?)
        .add_directive(format!("relay={}", level).parse()?)
        .add_directive("warn".parse()?);

    let fmt_layer = fmt::layer().with_target(true);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {}", parent.display()))?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context(format!("Failed to open log file: {}", log_file.display()))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Per-run log file: `{directory}/{mode}_{YYYY-MM-DD}.log`
pub fn mode_log_file(directory: &Path, mode: &str) -> PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    directory.join(format!("{}_{}.log", mode, date))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_log_file_name() {
        let path = mode_log_file(Path::new("logs"), "links");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(path.starts_with("logs"));
        assert!(name.starts_with("links_"));
        assert!(name.ends_with(".log"));
        // links_YYYY-MM-DD.log
        assert_eq!(name.len(), "links_".len() + 10 + ".log".len());
    }
}
