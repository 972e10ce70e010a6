//! Horde bridge: serves text-generation jobs from an AI Horde cluster using
//! a local inference server.

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod horde;
pub mod http;
pub mod moderation;
pub mod poll;
pub mod runtime;
pub mod status;
pub mod throttle;
pub mod worker;

pub use error::{Error, Result};
