//! Image mirroring library
//!
//! Copies container images between registries. A run first plans every copy, reading sources
//! and destinations without writing, then executes the plan in phases so that shared layers
//! are uploaded once per registry and mounted everywhere else.

pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod mirror;
pub mod reference;
pub mod registry;

pub use config::MirrorOptions;
pub use error::{MirrorError, RegistryError, Result};
pub use logging::Logger;
pub use mirror::{Mapping, Mirror};
