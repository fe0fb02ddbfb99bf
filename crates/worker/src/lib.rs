//! Worker process: service wiring and the operator CLI.

pub mod app;
pub mod cli;

pub use app::{RunOptions, Services};
