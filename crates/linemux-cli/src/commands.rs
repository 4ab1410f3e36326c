//! Subcommand implementations.

pub mod config;
pub mod request;
pub mod serve;
