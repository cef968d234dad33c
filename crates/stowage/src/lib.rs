pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod reachability;
pub mod service;
pub mod target;
pub mod transfer;

pub use error::{Error, ErrorKind, Result};
