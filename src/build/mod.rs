//! Build state shared between the pipeline and its plugins.
//!
//! - [`context`] - Build context and package metadata
//! - [`config`] - Per-plugin options and the TOML build file

pub mod config;
pub mod context;
