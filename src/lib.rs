pub mod acquire;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod encoder;
mod error;
pub mod library;
pub mod log_sink;
pub mod paths;
pub mod supervisor;
pub mod tools;

pub use error::{Result, StreamerError};
