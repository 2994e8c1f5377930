//! Mode-oriented scraping runner.
//!
//! Modes are named units of work registered in a [`modes::ModeRegistry`].
//! A producer mode creates records from scratch; a transformer reads the
//! persisted output of another mode and processes it one record at a time.
//! The [`crawler::Engine`] drives a run, throttles between records, books
//! per-record failures and writes `{mode}.json` with the run statistics.
//! Browser modes get a WebDriver session whose traffic goes through a local
//! [`proxy::Interceptor`].

pub mod browser;
pub mod cli;
pub mod crawler;
pub mod modes;
pub mod net;
pub mod proxy;
pub mod storage;
pub mod utils;

// Re-export common types
pub use crawler::{Engine, EngineError, ModeContext, ModeError, RunReport, RunStats, RunStatus};
pub use modes::{Document, ModeDescriptor, ModeRegistry, Producer, Schema, Transformer};
