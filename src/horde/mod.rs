//! Remote job queue (AI Horde cluster) integration.

pub mod client;
pub mod types;

pub use client::HordeClient;
pub use types::{Job, JobPayload, PopRequest, SubmitRequest, SubmitState};

/// Identifies this bridge to the cluster.
pub const BRIDGE_AGENT: &str = concat!(
    "horde-bridge:",
    env!("CARGO_PKG_VERSION"),
    ":",
    env!("CARGO_PKG_REPOSITORY")
);
