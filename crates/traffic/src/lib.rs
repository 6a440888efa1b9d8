//! Traffic allocation: routes a visitor into an experiment group under
//! whitelist/blacklist, time-window and traffic-ratio constraints, and keeps
//! the assignment sticky.

pub mod allocator;
pub mod ratio;

pub use allocator::{AssignmentSource, Decision, Exclusion, RandomSource, TrafficAllocator};
