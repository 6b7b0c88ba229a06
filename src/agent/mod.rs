//! Collaborators of the PPO agent controller.
//!
//! - [`traits`] -- the [`Critic`], [`Learner`], [`ExperienceBuffer`],
//!   [`MetricsLogger`], [`ObsStandardizer`] and [`AgentChoice`] seams.
//! - [`experience_buffer`] -- a bounded in-memory [`ExperienceBuffer`].
//! - [`metrics`] -- per-iteration controller data and a JSON-lines logger.
//! - [`mock`] -- deterministic critic and learner for tests and simulation.
//! - [`standardizer`] -- a running mean/std [`ObsStandardizer`].

pub mod experience_buffer;
pub mod metrics;
pub mod mock;
pub mod standardizer;
pub mod traits;

pub use experience_buffer::InMemoryExperienceBuffer;
pub use metrics::{AgentControllerData, JsonlMetricsLogger, MetricsRecord};
pub use mock::{MockCritic, MockLearner};
pub use standardizer::RunningObsStandardizer;
pub use traits::{
    AgentChoice, AllAgents, Critic, ExperienceBuffer, Learner, MetricsLogger, ObsStandardizer,
};
