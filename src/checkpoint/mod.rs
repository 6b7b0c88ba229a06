//! Checkpoint persistence for the agent controller.
//!
//! - [`id`] -- [`CheckpointId`], the numeric directory name of a checkpoint.
//! - [`schema`] -- versioned records for the controller's own JSON files.
//! - [`manager`] -- atomic save, load, retention pruning and run-directory
//!   resolution.

pub mod id;
pub mod manager;
pub mod schema;

pub use id::CheckpointId;
pub use manager::{resolve_run_dir, CheckpointManager};
pub use schema::{CheckpointError, CheckpointSnapshot};
