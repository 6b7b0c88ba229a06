//! Timestep producers.
//!
//! Real deployments feed the controller from a pool of simulator workers.
//! [`synthetic`] provides a seeded in-process stand-in with heterogeneous
//! multi-agent episode lengths, used by the `simulate` command and in tests.

pub mod synthetic;

pub use synthetic::{SyntheticEnvConfig, SyntheticEnvPool};
