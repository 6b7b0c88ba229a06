//! Core trajectory data types shared by the collector, the backfiller and the
//! checkpoint schema.
//!
//! Observations and actions are flat `f32` vectors so that checkpoints stay
//! readable outside of this crate; rewards, log-probabilities and value
//! predictions are scalars. Every float field goes through [`json_float`] so
//! that `NaN` and infinities survive a checkpoint.
//!
//! [`json_float`]: super::json_float

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one agent inside an environment.
pub type AgentId = String;
/// Identifier of one environment instance in the worker pool.
pub type EnvId = String;
/// Flat observation vector.
pub type Observation = Vec<f32>;
/// Flat action vector.
pub type Action = Vec<f32>;

// ---------------------------------------------------------------------------
// Timestep
// ---------------------------------------------------------------------------

/// One environment transition for one agent, as delivered by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestep {
    pub agent_id: AgentId,
    #[serde(with = "crate::trajectory::json_float")]
    pub obs: Observation,
    #[serde(with = "crate::trajectory::json_float")]
    pub next_obs: Observation,
    #[serde(with = "crate::trajectory::json_float")]
    pub action: Action,
    #[serde(with = "crate::trajectory::json_float")]
    pub reward: f32,
    /// The episode ended according to the environment dynamics.
    pub terminated: bool,
    /// The episode was cut short by an external limit.
    pub truncated: bool,
}

impl Timestep {
    /// Whether this step ends the agent's episode.
    pub fn is_last(&self) -> bool {
        self.terminated || self.truncated
    }
}

// ---------------------------------------------------------------------------
// Final observation
// ---------------------------------------------------------------------------

/// The observation following an agent's last recorded step.
///
/// `Unset` means the agent has not produced a single step yet, which is
/// distinct from a step whose next observation happens to be all zeros.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "obs", rename_all = "snake_case")]
pub enum FinalObs {
    #[default]
    Unset,
    Set(#[serde(with = "crate::trajectory::json_float")] Observation),
}

impl FinalObs {
    pub fn as_ref(&self) -> Option<&Observation> {
        match self {
            FinalObs::Unset => None,
            FinalObs::Set(obs) => Some(obs),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, FinalObs::Set(_))
    }
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// Raised when a late-filled value field is written twice or with the wrong
/// shape.
#[derive(Debug, Error, PartialEq)]
pub enum ValueFillError {
    #[error("value predictions for agent {agent_id} were already filled")]
    AlreadyFilled { agent_id: AgentId },
    #[error("agent {agent_id}: expected {expected} value predictions, got {got}")]
    WrongLength {
        agent_id: AgentId,
        expected: usize,
        got: usize,
    },
}

/// One agent's complete or forcibly truncated episode for one iteration.
///
/// `obs`, `actions`, `log_probs` and `rewards` always have the same length.
/// `value_predictions` and `final_value_prediction` are filled exactly once by
/// the value backfiller before the learning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub agent_id: AgentId,
    #[serde(with = "crate::trajectory::json_float")]
    pub obs: Vec<Observation>,
    #[serde(with = "crate::trajectory::json_float")]
    pub actions: Vec<Action>,
    #[serde(with = "crate::trajectory::json_float")]
    pub log_probs: Vec<f32>,
    #[serde(with = "crate::trajectory::json_float")]
    pub rewards: Vec<f32>,
    #[serde(default, with = "crate::trajectory::json_float")]
    pub value_predictions: Option<Vec<f32>>,
    #[serde(with = "crate::trajectory::json_float")]
    pub final_obs: Observation,
    #[serde(default, with = "crate::trajectory::json_float")]
    pub final_value_prediction: Option<f32>,
    pub truncated: bool,
}

impl Trajectory {
    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }

    /// Sum of the rewards collected along the trajectory.
    pub fn total_reward(&self) -> f32 {
        self.rewards.iter().sum()
    }

    /// Whether the backfiller has already written the value fields.
    pub fn has_values(&self) -> bool {
        self.value_predictions.is_some()
    }

    /// Write the critic's estimates for every step plus the bootstrap value
    /// of `final_obs`. Single write only.
    pub fn fill_values(
        &mut self,
        values: Vec<f32>,
        final_value: f32,
    ) -> Result<(), ValueFillError> {
        if self.value_predictions.is_some() || self.final_value_prediction.is_some() {
            return Err(ValueFillError::AlreadyFilled {
                agent_id: self.agent_id.clone(),
            });
        }
        if values.len() != self.obs.len() {
            return Err(ValueFillError::WrongLength {
                agent_id: self.agent_id.clone(),
                expected: self.obs.len(),
                got: values.len(),
            });
        }
        self.value_predictions = Some(values);
        self.final_value_prediction = Some(final_value);
        Ok(())
    }
}
