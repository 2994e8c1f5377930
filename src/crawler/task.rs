use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of one mode run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Engine state machine for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    LoadingInput,
    Running,
    Finalizing,
    Done(RunStatus),
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done(_))
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => f.write_str("INIT"),
            RunPhase::LoadingInput => f.write_str("LOADING_INPUT"),
            RunPhase::Running => f.write_str("RUNNING"),
            RunPhase::Finalizing => f.write_str("FINALIZING"),
            RunPhase::Done(status) => write!(f, "{}", status.to_string().to_uppercase()),
        }
    }
}

/// Persisted outcome summary of a mode run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub status: RunStatus,
    pub message: Option<String>,

    #[serde(default)]
    pub attempted: usize,
    #[serde(default)]
    pub succeeded: usize,
    #[serde(default)]
    pub failed: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Fresh counters for a run starting now
    pub fn start() -> Self {
        Self {
            status: RunStatus::Success,
            message: None,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            run_id: Some(uuid::Uuid::new_v4().to_string()),
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    /// Status implied by the counters alone
    pub fn derived_status(&self) -> RunStatus {
        if self.failed == 0 {
            RunStatus::Success
        } else if self.succeeded == 0 {
            RunStatus::Failure
        } else {
            RunStatus::Partial
        }
    }

    /// Settle status and message from the counters.
    ///
    /// `fatal` forces `failure` with its message; otherwise `last_error`
    /// becomes the message when nothing succeeded.
    pub fn finalize(&mut self, fatal: Option<String>, last_error: Option<String>) {
        self.finished_at = Some(Utc::now());

        if let Some(message) = fatal {
            self.status = RunStatus::Failure;
            self.message = Some(message);
            return;
        }

        self.status = self.derived_status();
        self.message = match self.status {
            RunStatus::Success => None,
            RunStatus::Partial => Some(format!(
                "{} of {} records failed",
                self.failed, self.attempted
            )),
            RunStatus::Failure => Some(
                last_error.unwrap_or_else(|| format!("all {} records failed", self.attempted)),
            ),
        };
    }
}

/// What the engine hands back after a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: String,
    pub stats: RunStats,
    pub records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(failures: usize, total: usize) -> RunStats {
        let mut stats = RunStats::start();
        for i in 0..total {
            if i < failures {
                stats.record_failure();
            } else {
                stats.record_success();
            }
        }
        stats.finalize(None, Some("last error".into()));
        stats
    }

    #[test]
    fn test_status_from_failure_count() {
        assert_eq!(stats_with(0, 4).status, RunStatus::Success);
        assert_eq!(stats_with(1, 4).status, RunStatus::Partial);
        assert_eq!(stats_with(3, 4).status, RunStatus::Partial);
        assert_eq!(stats_with(4, 4).status, RunStatus::Failure);
    }

    #[test]
    fn test_messages() {
        assert_eq!(stats_with(0, 2).message, None);
        assert_eq!(stats_with(1, 2).message.as_deref(), Some("1 of 2 records failed"));
        assert_eq!(stats_with(2, 2).message.as_deref(), Some("last error"));
    }

    #[test]
    fn test_fatal_overrides_counters() {
        let mut stats = RunStats::start();
        stats.record_success();
        stats.finalize(Some("browser crashed".into()), None);

        assert_eq!(stats.status, RunStatus::Failure);
        assert_eq!(stats.message.as_deref(), Some("browser crashed"));
    }

    #[test]
    fn test_minimal_json_shape_is_accepted() {
        let stats: RunStats =
            serde_json::from_str(r#"{"status": "partial", "message": null}"#).unwrap();

        assert_eq!(stats.status, RunStatus::Partial);
        assert_eq!(stats.attempted, 0);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RunPhase::LoadingInput.to_string(), "LOADING_INPUT");
        assert_eq!(RunPhase::Done(RunStatus::Partial).to_string(), "PARTIAL");
        assert!(RunPhase::Done(RunStatus::Success).is_terminal());
    }
}
