//! Library side of the `nodelink` binary: argument parsing, configuration
//! loading and the subcommands.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod recorder;
