#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;
pub mod registry;

pub use client::RedisStore;
pub use local::LocalStore;
pub use registry::{seed_from_json, CachedExperimentProvider, ExperimentRegistry};
