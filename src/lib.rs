pub mod agent;
mod archive;
pub mod bootstrap;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod connectivity;
pub mod deploy;
mod error;
pub mod keyvalue;
pub mod launch;
pub mod pack;
pub mod paths;
pub mod provision;
pub mod retry;
pub mod status;
pub mod validation;

pub use error::{AppError, ErrorKind, Result};

/// Log to stderr at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}
