//! Benchmark execution: repo caching, sandboxes, trials, retries and dispatch.

pub mod controller;
pub mod dispatcher;
pub mod executor;
pub mod git;
pub mod record;
pub mod repo_cache;
pub mod sandbox;

pub use controller::{RetryController, RetryPolicy};
pub use dispatcher::{Dispatcher, InstanceSolver, RunSummary};
pub use record::{Prediction, Resolution, RunIdentity, TrialRecord, TrialStatus};
pub use repo_cache::RepoCache;
pub use sandbox::Sandbox;
