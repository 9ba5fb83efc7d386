//! Command line interface
//!
//! Argument parsing and the runner that turns parsed arguments into a mirror run.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
