pub mod clock;
pub mod config;
pub mod error;
pub mod playlist;
pub mod probe;
pub mod progress;
pub mod schedule;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod transcode;

pub use error::{Error, Result};
