//! scicurate: balanced scientific corpus curation.
//! Configuration and run orchestration behind the `scicurate` binary.

pub mod config;
pub mod run;

pub use config::{Config, ConfigError};
pub use run::{DataLayout, RunError, Runner, Services, StatusReport};
