//! IPAACA Tools - Command-line utilities
//!
//! This crate provides:
//! - The shared `--ipaaca-*` argument group
//! - The IU injector: sends one Message and reports what a listener saw

pub mod args;
pub mod injector;

pub use args::*;
pub use injector::*;
