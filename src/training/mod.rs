//! Iteration scheduling for on-policy training.
//!
//! This module provides:
//! - [`state::IterationState`] -- counters, timers and in-flight data.
//! - [`collector::IterationCollector`] -- delivery ingestion and the
//!   reset/step decision, plus the pairwise observation standardization
//!   applied before tracking.
//! - [`backfill`] -- the single batched critic call before each learning step.
//! - [`controller::PpoAgentController`] -- ties ingestion, learning steps and
//!   checkpointing together.

pub mod backfill;
pub mod collector;
pub mod controller;
pub mod state;

pub use backfill::{backfill_values, BackfillError, CriticRequest};
pub use collector::{
    standardize_observations, EnvAction, EnvStepBatch, IngestOutcome, IterationCollector,
};
pub use controller::PpoAgentController;
pub use state::{unix_seconds, IterationState};
