pub mod command;
pub mod config;
mod error;
pub mod job;
pub mod joblog;
pub mod options;
pub mod paths;
pub mod process;
pub mod progress;
pub mod tools;

pub use error::{EngineError, Result};
