//! Trajectory types and per-environment trajectory tracking.
//!
//! This module provides:
//! - [`types::Timestep`], [`types::Trajectory`], [`types::FinalObs`] -- the
//!   value objects exchanged with producers and collaborators.
//! - [`env_trajectories::EnvTrajectories`] -- the tracker that accumulates
//!   partial trajectories for every agent of one environment instance.
//! - [`json_float`] -- serde helpers that keep `NaN` and infinities intact in
//!   JSON checkpoints.

pub mod env_trajectories;
pub mod json_float;
pub mod types;

// Re-export the most commonly used items at the module level.
pub use env_trajectories::{EnvTrajectories, EnvTrajectoriesRecord, TrackerError};
pub use types::{Action, AgentId, EnvId, FinalObs, Observation, Timestep, Trajectory};
