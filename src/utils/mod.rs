pub mod logging;

// Re-export common functions
pub use logging::{init_logging, mode_log_file};
