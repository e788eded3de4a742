//! The berth-cli crate implements the project's CLI tool `db` as well as contains functionality for displaying information in a console UI.

/// Global tracing subscriber setup for the CLI binaries.
pub mod tracing;
/// Utilities for CLIs
pub mod util;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] berth_config::Error),
    #[error("Database error")]
    Database(#[from] sqlx::Error),
    #[error("Filesystem io error")]
    Io(#[from] std::io::Error),
    #[error("Other error")]
    Other(#[from] color_eyre::Report),
}
