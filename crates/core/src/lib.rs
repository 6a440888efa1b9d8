pub mod config;
pub mod error;
pub mod hashing;
pub mod sampling;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{PiscesError, PiscesResult};
pub use hashing::partition;
