pub mod app;
pub mod commands;
pub mod config;
pub mod logging;

pub use app::{AppError, Options, run};
