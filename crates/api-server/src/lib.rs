#![warn(clippy::unwrap_used)]

pub mod analysis_rest;
pub mod bandit_rest;
pub mod error;
pub mod experiments_rest;
pub mod rest;
pub mod server;
pub mod stores;

pub use error::{ApiError, ErrorResponse};
pub use rest::AppState;
pub use server::{router, ApiServer};
pub use stores::Stores;
