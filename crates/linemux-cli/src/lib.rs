//! CLI for the linemux messenger
//!
//! This crate provides the `linemux` command-line interface: a TCP server
//! with built-in handlers and a one-shot request client.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod handlers;

pub use cli::Cli;
pub use error::{CliError, CliResult};
