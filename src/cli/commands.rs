use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::ScraperConfig;
use crate::crawler::{Engine, RunReport, RunStatus};
use crate::modes::builtin::register_all;
use crate::modes::{ModeDescriptor, ModeRegistry};

/// Registry with every mode the binary knows about
pub fn build_registry(config: &ScraperConfig) -> Result<ModeRegistry> {
    let mut registry = ModeRegistry::new();
    register_all(&mut registry, config).context("Failed to register built-in modes")?;
    Ok(registry)
}

fn describe(descriptor: &ModeDescriptor) -> String {
    let mut description = match descriptor.input_mode() {
        Some(input) => format!("reads '{}'", input),
        None => "producer".to_string(),
    };
    if descriptor.uses_browser() {
        description.push_str(", browser");
    }
    description
}

/// Print the registered modes
pub fn list_modes(registry: &ModeRegistry) -> Result<()> {
    println!("Available modes:");
    for name in registry.names() {
        let descriptor = registry.resolve(name)?;
        println!("  - {:<10} {}", name, describe(descriptor));
    }
    Ok(())
}

fn print_report(report: &RunReport, output_dir: &Path) {
    println!("Mode: {}", report.mode);
    println!("Status: {}", report.stats.status);
    println!(
        "Records: {} written, {} of {} inputs succeeded",
        report.records, report.stats.succeeded, report.stats.attempted
    );
    if let Some(message) = &report.stats.message {
        println!("Message: {}", message);
    }
    println!("Output: {}", output_dir.join(format!("{}.json", report.mode)).display());
}

/// Fail when the last stage failed, so the exit code reflects it
fn ensure_not_failed(reports: &[RunReport]) -> Result<()> {
    match reports.last() {
        Some(report) if report.stats.status == RunStatus::Failure => anyhow::bail!(
            "Mode '{}' failed: {}",
            report.mode,
            report.stats.message.as_deref().unwrap_or("no details")
        ),
        _ => Ok(()),
    }
}

/// Run a single mode
pub async fn run_mode(
    registry: ModeRegistry,
    config: &ScraperConfig,
    mode: &str,
    url: Option<&str>,
) -> Result<()> {
    let engine = Engine::from_config(Arc::new(registry), config)?;

    let report = engine
        .run(mode, url)
        .await
        .context(format!("Mode '{}' could not run", mode))?;

    print_report(&report, &config.engine.output_dir);
    ensure_not_failed(&[report])
}

/// Run a mode after all the modes it reads from
pub async fn run_chain(registry: ModeRegistry, config: &ScraperConfig, mode: &str) -> Result<()> {
    let engine = Engine::from_config(Arc::new(registry), config)?;

    let reports = engine
        .run_chain(mode)
        .await
        .context(format!("Chain for mode '{}' could not run", mode))?;

    info!("Chain for '{}' ran {} stages", mode, reports.len());
    for report in &reports {
        print_report(report, &config.engine.output_dir);
    }
    ensure_not_failed(&reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::RunStats;

    fn report(status: RunStatus) -> RunReport {
        let mut stats = RunStats::start();
        stats.status = status;
        RunReport {
            mode: "links".to_string(),
            stats,
            records: 0,
        }
    }

    #[test]
    fn test_only_final_failure_is_an_error() {
        assert!(ensure_not_failed(&[]).is_ok());
        assert!(ensure_not_failed(&[report(RunStatus::Partial)]).is_ok());
        assert!(ensure_not_failed(&[report(RunStatus::Failure)]).is_err());
    }

    #[test]
    fn test_describe_modes() {
        let registry = build_registry(&ScraperConfig::default()).unwrap();

        assert_eq!(describe(registry.resolve("seeds").unwrap()), "producer");
        assert_eq!(describe(registry.resolve("pages").unwrap()), "reads 'links', browser");
    }
}
