//! Command-line layer.

pub mod build;

pub use build::{cmd_build, BuildArgs};
