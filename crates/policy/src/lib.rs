//! Decision engine for the storefront.
//!
//! This crate provides the exploration policies and the batching decision
//! service that records interactions and rewards for later model training.

/// Default policies and the epsilon-greedy explorer.
pub mod explorer;
/// Batching decision service with background upload.
pub mod service;
/// Utility modules for the decision engine.
pub mod utils;

pub use explorer::{Decision, EpsilonGreedyExplorer, FixedActionPolicy, MartContext, Policy};
pub use service::{
    BatchingConfig, DecisionService, DecisionServiceConfig, EngineEvent, EventObserver,
    UploadRetryPolicy,
};
