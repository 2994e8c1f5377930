use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::crawler::errors::ErrorKind;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ScraperConfig {
    pub engine: EngineSettings,
    pub browser: BrowserSettings,
    pub interceptor: InterceptorSettings,
    pub http: HttpSettings,
    pub logging: LoggingSettings,
    pub crawl: CrawlSettings,
}

/// Execution engine settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    pub output_dir: PathBuf,
    pub throttle_min_ms: u64, // Pause between records, lower bound
    pub throttle_max_ms: u64, // Pause between records, upper bound
    pub dedupe: bool,
    pub fatal_errors: Vec<ErrorKind>,
}

/// Browser settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: Option<String>,
    pub lang: String,
    pub page_load_timeout_secs: u64,
    pub arguments: Vec<String>,
}

/// Network interceptor settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InterceptorSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16, // 0 picks a free port
    pub decrypt_https: bool, // Terminate TLS with a local CA instead of tunnelling
    pub upstream_insecure: bool, // Skip certificate checks towards origin servers
}

/// HTTP client settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpSettings {
    pub max_retry: u32, // Attempts including the first one
    pub retry_wait_ms: u64,
    pub backoff_multiplier: f64,
    pub max_wait_ms: u64,
    pub retry_statuses: Vec<u16>,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub proxy: Option<String>,
}

/// Logging settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub file_logging: bool,
    pub directory: PathBuf,
}

/// Inputs for the built-in modes
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CrawlSettings {
    pub seeds: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            throttle_min_ms: 1000,
            throttle_max_ms: 2000,
            dedupe: true,
            fatal_errors: vec![ErrorKind::Browser, ErrorKind::Interceptor],
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: false,
            window_width: 1920,
            window_height: 1080,
            user_agent: None,
            lang: "en".to_string(),
            page_load_timeout_secs: 30,
            arguments: vec![
                "--ignore-certificate-errors".to_string(),
                "--ignore-ssl-errors=yes".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
        }
    }
}

impl Default for InterceptorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
            decrypt_https: true,
            upstream_insecure: false,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_wait_ms: 1000,
            backoff_multiplier: 2.0,
            max_wait_ms: 30_000,
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
            timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file_logging: false,
            directory: PathBuf::from("logs"),
        }
    }
}

impl ScraperConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "relay-scraper", "relay-scraper") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating {}", config_path.display());
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.engine.throttle_min_ms > self.engine.throttle_max_ms {
            anyhow::bail!(
                "engine.throttle_min_ms ({}) cannot be greater than engine.throttle_max_ms ({})",
                self.engine.throttle_min_ms,
                self.engine.throttle_max_ms
            );
        }

        if self.browser.window_width < 640 {
            anyhow::bail!("browser.window_width must be at least 640 pixels");
        }

        if self.browser.lang.is_empty() || !self.browser.lang.chars().all(|c| c.is_ascii_alphabetic()) {
            anyhow::bail!("browser.lang must contain only letters, got '{}'", self.browser.lang);
        }

        if self.http.max_retry == 0 {
            anyhow::bail!("http.max_retry must allow at least one attempt");
        }

        Ok(())
    }
}
