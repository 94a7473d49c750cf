pub mod adapters;
pub mod artifacts;
pub mod audit;
pub mod config;
pub mod dom;
pub mod errors;
pub mod hashing;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod platform;
pub mod retry;
pub mod session;
pub mod store;
pub mod urltools;

pub use orchestrator::{Collaborators, RunOptions, RunOrchestrator, RunOutcome};
