//! patchbench library crate
//!
//! Runs a code-editing agent over benchmark instances: each instance is
//! checked out into disposable sandboxes, attempted across models and
//! retries, and resolved into exactly one prediction in the output file.

pub mod agent;
pub mod config;
pub mod dataset;
pub mod lab;
pub mod patch;
pub mod prompt;
pub mod store;
pub mod util;
