//! Prism Config
//!
//! Runtime settings for the query optimizer and workflow engine. Settings are
//! provided once at process start:
//! - built-in defaults for every section
//! - an optional TOML or JSON file (`--config prism.toml`)
//! - `PRISM__<SECTION>__<KEY>` environment variables
//!
//! There is no hot reload; components copy the section they need at construction.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
  CacheSettings, ComplexitySettings, ENV_PREFIX, EngineSettings, OptimizerSettings, Settings,
};
