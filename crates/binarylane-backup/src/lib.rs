pub mod api;
pub mod backup;
pub mod config;
pub mod download;
pub mod error;
pub mod log_sanitize;
pub mod logging;
pub mod poller;
pub mod process;
pub mod prune;
pub mod relocate;
pub mod remote;
pub mod reporter;
pub mod storage;
pub mod verify;

pub use error::{Error, Result};
