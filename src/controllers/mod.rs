//! Controllers for the build operator
//!
//! One controller drives both queues: the build queue maps builds onto their
//! executor pods, and the build-config queue re-evaluates run policy when a
//! sibling finishes.

mod build;
mod build_config;

pub use build::{BuildController, BuildControllerParams};
