//! Trajectory aggregation, iteration scheduling and resumable checkpoints for
//! on-policy multi-agent reinforcement learning.
//!
//! Producers deliver per-environment timestep batches; the
//! [`training::PpoAgentController`] assembles them into per-agent trajectories,
//! answers every environment with reset or step, runs a learning step whenever
//! enough timesteps have accumulated and periodically checkpoints the whole
//! pipeline so a run can resume exactly where it stopped.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod env;
pub mod trajectory;
pub mod training;
