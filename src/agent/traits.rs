//! Collaborator traits the agent controller drives.
//!
//! The controller owns the bookkeeping; everything numeric (value inference,
//! gradient updates, advantage estimation, metric backends) sits behind these
//! traits. Return payloads from the learner and the experience buffer are
//! opaque [`serde_json::Value`]s that are forwarded to the metrics logger
//! without being inspected.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::trajectory::{AgentId, Observation, Trajectory};

use super::metrics::AgentControllerData;

/// Batched value inference.
#[allow(async_fn_in_trait)]
pub trait Critic: Send + Sync {
    /// Return one value per `(agent_id, obs)` pair, in input order.
    async fn predict_values(&self, agent_ids: &[&str], obs: &[&Observation]) -> Result<Vec<f32>>;
}

/// Stores submitted trajectories and turns them into training data.
#[allow(async_fn_in_trait)]
pub trait ExperienceBuffer: Send {
    /// Ingest one iteration's trajectories. Returns diagnostics.
    async fn submit_experience(&mut self, trajectories: Vec<Trajectory>) -> Result<Value>;

    /// Number of timesteps currently held.
    fn num_timesteps(&self) -> usize;

    /// Draw trajectories totalling at least `min_timesteps` steps (or all of
    /// them, if fewer are held).
    fn sample_trajectories(&mut self, min_timesteps: usize) -> Vec<Trajectory>;

    fn save_checkpoint(&self, folder: &Path) -> Result<()>;
    fn load_checkpoint(&mut self, folder: &Path) -> Result<()>;
}

/// The optimizer side of PPO. Owns the critic used for value backfilling.
#[allow(async_fn_in_trait)]
pub trait Learner: Send {
    type Critic: Critic;

    fn critic(&self) -> &Self::Critic;

    /// Run one learning step against the buffer. Returns diagnostics.
    async fn learn<B: ExperienceBuffer>(&mut self, buffer: &mut B) -> Result<Value>;

    fn save_checkpoint(&self, folder: &Path) -> Result<()>;
    fn load_checkpoint(&mut self, folder: &Path) -> Result<()>;
}

/// Metrics backend.
pub trait MetricsLogger: Send {
    /// Condense the controller's per-iteration data into agent metrics.
    fn collect_agent_metrics(&mut self, data: &AgentControllerData) -> Result<Value>;

    /// Condense the per-environment state metrics of one iteration.
    fn collect_state_metrics(&mut self, state_metrics: &[Value]) -> Result<Value>;

    fn report_metrics(
        &mut self,
        controller_name: &str,
        state_metrics: Value,
        agent_metrics: Value,
    ) -> Result<()>;

    /// Identity of the external run, persisted with each checkpoint.
    fn run_id(&self) -> Option<&str> {
        None
    }

    /// Continue the external run recorded in a checkpoint.
    fn resume_run(&mut self, _run_id: &str) {}

    fn save_checkpoint(&self, folder: &Path) -> Result<()>;
    fn load_checkpoint(&mut self, folder: &Path) -> Result<()>;
}

/// Rescales observations before they are tracked.
pub trait ObsStandardizer: Send {
    /// Return one standardized observation per `(agent_id, obs)` pair, in
    /// input order.
    fn standardize(
        &mut self,
        agent_ids: &[&str],
        obs: &[&Observation],
    ) -> Result<Vec<Observation>>;
}

/// Chooses which agents of an environment the policy acts for.
///
/// Input is the ordered agent list; output is an ordered list of selected
/// indices into it. Implementations must not have side effects.
pub trait AgentChoice: Send + Sync {
    fn choose(&self, agent_ids: &[AgentId]) -> Vec<usize>;
}

/// Acts for every agent, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllAgents;

impl AgentChoice for AllAgents {
    fn choose(&self, agent_ids: &[AgentId]) -> Vec<usize> {
        (0..agent_ids.len()).collect()
    }
}

impl<F> AgentChoice for F
where
    F: Fn(&[AgentId]) -> Vec<usize> + Send + Sync,
{
    fn choose(&self, agent_ids: &[AgentId]) -> Vec<usize> {
        self(agent_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_agents() {
        let ids: Vec<AgentId> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(AllAgents.choose(&ids), vec![0, 1, 2]);
        assert!(AllAgents.choose(&[]).is_empty());
    }

    #[test]
    fn test_closure_choice() {
        let blue_only = |ids: &[AgentId]| -> Vec<usize> {
            ids.iter()
                .enumerate()
                .filter(|(_, id)| id.starts_with("blue"))
                .map(|(i, _)| i)
                .collect()
        };
        let ids: Vec<AgentId> = vec!["blue-0".into(), "orange-0".into(), "blue-1".into()];
        assert_eq!(blue_only.choose(&ids), vec![0, 2]);
    }
}
