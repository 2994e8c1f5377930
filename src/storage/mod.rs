pub mod json_file;
pub mod memory;

// Re-export common types
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crawler::task::RunStats;
use crate::modes::Document;

/// Everything a mode run persists: `{"data": [...], "run_stats": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeOutput {
    pub data: Vec<Document>,
    pub run_stats: RunStats,
}

/// A previously persisted output, records still undecoded
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOutput {
    pub data: Vec<Value>,
    pub run_stats: Option<RunStats>,
}

/// Accepted on-disk layouts
#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Wrapped {
        data: Vec<Value>,
        #[serde(default)]
        run_stats: Option<RunStats>,
    },
    // Bare list of records, written by older versions
    Bare(Vec<Value>),
}

impl StoredOutput {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_slice(bytes)? {
            OnDisk::Wrapped { data, run_stats } => Self { data, run_stats },
            OnDisk::Bare(data) => Self { data, run_stats: None },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no stored output for mode '{0}'")]
    NotFound(String),

    #[error("stored output for mode '{mode}' is not valid JSON: {source}")]
    Corrupt {
        mode: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("'{0}' cannot be used as a mode output name")]
    InvalidName(String),
}

/// Mode names become file names, so they may not leave the output directory
pub fn check_mode_name(mode: &str) -> Result<(), StoreError> {
    let escapes = mode.is_empty()
        || mode.contains("..")
        || mode.chars().any(|c| c == '/' || c == '\\' || c == '\0');

    if escapes {
        return Err(StoreError::InvalidName(mode.to_string()));
    }
    Ok(())
}

/// Persistence capability for mode outputs
#[async_trait]
pub trait Store: Send + Sync {
    /// Replace the output of `mode` atomically
    async fn write(&self, mode: &str, output: &ModeOutput) -> Result<(), StoreError>;

    /// Read the output previously written for `mode`
    async fn read(&self, mode: &str) -> Result<StoredOutput, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_stay_inside_output_dir() {
        assert!(check_mode_name("links").is_ok());
        assert!(check_mode_name("city_details-v2").is_ok());

        for name in ["", "..", "../x", "a/b", "a\\b", "x..y"] {
            assert!(
                matches!(check_mode_name(name), Err(StoreError::InvalidName(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_bare_and_wrapped_layouts() {
        let bare = StoredOutput::from_slice(br#"[{"link": "https://a.example"}]"#).unwrap();
        assert_eq!(bare.data.len(), 1);
        assert!(bare.run_stats.is_none());

        let wrapped = StoredOutput::from_slice(br#"{"data": []}"#).unwrap();
        assert!(wrapped.data.is_empty());
    }
}
