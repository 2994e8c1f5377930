pub mod context;
pub mod controller;
pub mod errors;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use context::{BrowserState, HttpOnly, ModeContext, Session, SessionLauncher};
pub use controller::Engine;
pub use errors::{EngineError, ErrorKind, FailurePolicy, ModeError};
pub use scheduler::{LinkFilter, Throttle};
pub use task::{RunPhase, RunReport, RunStats, RunStatus};
