//! Per-environment accumulation of partial multi-agent trajectories.
//!
//! An [`EnvTrajectories`] is created the first time a batch of timesteps is
//! seen for an environment. The agent ids in that batch become the fixed agent
//! set for the rest of the episode: each id is mapped once to a dense slot and
//! every per-agent sequence lives in a parallel array indexed by slot.
//!
//! Every call to [`EnvTrajectories::add_steps`] appends exactly one
//! log-probability row (one column per slot), whether or not any agent in the
//! call was still active. Agent *i*'s log-probs are the prefix of column *i*
//! covering the rows recorded while it was not yet done.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{Action, AgentId, FinalObs, Observation, Timestep, Trajectory};

/// Faults that indicate the producer broke the per-environment contract.
#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("agent {agent_id} is not part of this environment's agent set")]
    UnknownAgent { agent_id: AgentId },
    #[error("agent {agent_id} appears more than once in the initial agent set")]
    DuplicateAgent { agent_id: AgentId },
    #[error("cannot track an environment with no agents")]
    NoAgents,
    #[error("log-prob row has {got} entries but the environment tracks {expected} agents")]
    RowLength { expected: usize, got: usize },
    #[error("agent {agent_id}: {steps} steps recorded across {rows} active log-prob rows")]
    Misaligned {
        agent_id: AgentId,
        steps: usize,
        rows: usize,
    },
    #[error("agent {agent_id}: inconsistent tracker record ({reason})")]
    InvalidRecord { agent_id: AgentId, reason: String },
}

/// Partial trajectories for every agent of one environment instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvTrajectories {
    agent_ids: Vec<AgentId>,
    slots: HashMap<AgentId, usize>,
    obs: Vec<Vec<Observation>>,
    actions: Vec<Vec<Action>>,
    rewards: Vec<Vec<f32>>,
    final_obs: Vec<FinalObs>,
    dones: Vec<bool>,
    truncateds: Vec<bool>,
    /// Rows appended while the slot's agent was still active.
    active_rows: Vec<usize>,
    /// Row-major log-prob history, `agent_ids.len()` columns.
    log_probs: Vec<f32>,
    num_rows: usize,
}

impl EnvTrajectories {
    /// Create a tracker whose agent set is `agent_ids`, in that column order.
    pub fn new(agent_ids: Vec<AgentId>) -> Result<Self, TrackerError> {
        if agent_ids.is_empty() {
            return Err(TrackerError::NoAgents);
        }
        let mut slots = HashMap::with_capacity(agent_ids.len());
        for (slot, agent_id) in agent_ids.iter().enumerate() {
            if slots.insert(agent_id.clone(), slot).is_some() {
                return Err(TrackerError::DuplicateAgent {
                    agent_id: agent_id.clone(),
                });
            }
        }
        let n = agent_ids.len();
        Ok(Self {
            agent_ids,
            slots,
            obs: vec![Vec::new(); n],
            actions: vec![Vec::new(); n],
            rewards: vec![Vec::new(); n],
            final_obs: vec![FinalObs::Unset; n],
            dones: vec![false; n],
            truncateds: vec![false; n],
            active_rows: vec![0; n],
            log_probs: Vec::new(),
            num_rows: 0,
        })
    }

    /// Create a tracker from the agent ids of a first timestep batch.
    pub fn from_timesteps(timesteps: &[Timestep]) -> Result<Self, TrackerError> {
        Self::new(timesteps.iter().map(|t| t.agent_id.clone()).collect())
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Append one delivery of timesteps plus its log-prob row.
    ///
    /// Steps for agents that are already done are dropped and not counted.
    /// Returns the number of steps accepted. Nothing is mutated when the call
    /// is rejected.
    pub fn add_steps(
        &mut self,
        timesteps: Vec<Timestep>,
        log_prob_row: &[f32],
    ) -> Result<usize, TrackerError> {
        let slots = self.route(&timesteps, log_prob_row)?;

        for (slot, done) in self.dones.iter().enumerate() {
            if !done {
                self.active_rows[slot] += 1;
            }
        }

        let mut steps_added = 0;
        for (slot, timestep) in slots.into_iter().zip(timesteps) {
            if self.dones[slot] {
                continue;
            }
            steps_added += 1;
            let now_done = timestep.is_last();
            self.obs[slot].push(timestep.obs);
            self.actions[slot].push(timestep.action);
            self.rewards[slot].push(timestep.reward);
            self.final_obs[slot] = FinalObs::Set(timestep.next_obs);
            if now_done {
                self.dones[slot] = true;
                self.truncateds[slot] = timestep.truncated;
            }
        }

        self.log_probs.extend_from_slice(log_prob_row);
        self.num_rows += 1;
        Ok(steps_added)
    }

    /// Check that [`add_steps`](Self::add_steps) would accept this delivery,
    /// without recording anything.
    pub fn check_steps(
        &self,
        timesteps: &[Timestep],
        log_prob_row: &[f32],
    ) -> Result<(), TrackerError> {
        self.route(timesteps, log_prob_row).map(|_| ())
    }

    /// Slot of every timestep, in input order.
    fn route(
        &self,
        timesteps: &[Timestep],
        log_prob_row: &[f32],
    ) -> Result<Vec<usize>, TrackerError> {
        if log_prob_row.len() != self.agent_ids.len() {
            return Err(TrackerError::RowLength {
                expected: self.agent_ids.len(),
                got: log_prob_row.len(),
            });
        }
        timesteps
            .iter()
            .map(|timestep| {
                self.slots
                    .get(&timestep.agent_id)
                    .copied()
                    .ok_or_else(|| TrackerError::UnknownAgent {
                        agent_id: timestep.agent_id.clone(),
                    })
            })
            .collect()
    }

    /// Truncate every unfinished agent and mark all agents done. Idempotent.
    pub fn finalize(&mut self) {
        for slot in 0..self.agent_ids.len() {
            if !self.dones[slot] {
                self.truncateds[slot] = true;
                self.dones[slot] = true;
            }
        }
    }

    /// Convert the tracker into one trajectory per agent, in slot order.
    ///
    /// Agents that never produced a step are skipped.
    pub fn into_trajectories(self) -> Result<Vec<Trajectory>, TrackerError> {
        let k = self.agent_ids.len();
        let mut trajectories = Vec::with_capacity(k);
        let columns = self
            .agent_ids
            .into_iter()
            .zip(self.obs)
            .zip(self.actions)
            .zip(self.rewards)
            .zip(self.final_obs)
            .zip(self.truncateds)
            .zip(self.active_rows)
            .enumerate();

        for (slot, ((((((agent_id, obs), actions), rewards), final_obs), truncated), rows)) in
            columns
        {
            if obs.len() != rows {
                return Err(TrackerError::Misaligned {
                    agent_id,
                    steps: obs.len(),
                    rows,
                });
            }
            let final_obs = match final_obs {
                FinalObs::Set(obs) => obs,
                FinalObs::Unset => continue,
            };
            let log_probs = (0..rows).map(|row| self.log_probs[row * k + slot]).collect();
            trajectories.push(Trajectory {
                agent_id,
                obs,
                actions,
                log_probs,
                rewards,
                value_predictions: None,
                final_obs,
                final_value_prediction: None,
                truncated,
            });
        }
        Ok(trajectories)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Whether every agent in the environment has finished.
    pub fn is_done(&self) -> bool {
        self.dones.iter().all(|d| *d)
    }

    pub fn agent_ids(&self) -> &[AgentId] {
        &self.agent_ids
    }

    /// Number of log-prob rows, i.e. number of `add_steps` calls.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Total steps accepted across all agents.
    pub fn num_steps(&self) -> usize {
        self.obs.iter().map(Vec::len).sum()
    }

    /// Row `row` of the log-prob history.
    pub fn log_prob_row(&self, row: usize) -> Option<&[f32]> {
        let k = self.agent_ids.len();
        (row < self.num_rows).then(|| &self.log_probs[row * k..(row + 1) * k])
    }

    /// Read-only view of one agent's partial trajectory.
    pub fn agent(&self, agent_id: &str) -> Option<AgentView<'_>> {
        let slot = *self.slots.get(agent_id)?;
        Some(AgentView {
            obs: &self.obs[slot],
            actions: &self.actions[slot],
            rewards: &self.rewards[slot],
            final_obs: &self.final_obs[slot],
            done: self.dones[slot],
            truncated: self.truncateds[slot],
        })
    }

    // ------------------------------------------------------------------
    // Checkpoint records
    // ------------------------------------------------------------------

    /// Snapshot the tracker into its persisted form.
    pub fn to_record(&self) -> EnvTrajectoriesRecord {
        let k = self.agent_ids.len();
        let agents = (0..k)
            .map(|slot| AgentSlotRecord {
                agent_id: self.agent_ids[slot].clone(),
                obs: self.obs[slot].clone(),
                actions: self.actions[slot].clone(),
                rewards: self.rewards[slot].clone(),
                final_obs: self.final_obs[slot].clone(),
                done: self.dones[slot],
                truncated: self.truncateds[slot],
                active_rows: self.active_rows[slot],
            })
            .collect();
        let log_prob_rows = self.log_probs.chunks(k).map(<[f32]>::to_vec).collect();
        EnvTrajectoriesRecord {
            agents,
            log_prob_rows,
        }
    }

    /// Rebuild a tracker from a persisted record, checking its invariants.
    pub fn from_record(record: EnvTrajectoriesRecord) -> Result<Self, TrackerError> {
        let agent_ids = record.agents.iter().map(|a| a.agent_id.clone()).collect();
        let mut tracker = Self::new(agent_ids)?;
        let k = tracker.agent_ids.len();

        for row in &record.log_prob_rows {
            if row.len() != k {
                return Err(TrackerError::RowLength {
                    expected: k,
                    got: row.len(),
                });
            }
            tracker.log_probs.extend_from_slice(row);
        }
        tracker.num_rows = record.log_prob_rows.len();

        for (slot, agent) in record.agents.into_iter().enumerate() {
            let invalid = |reason: &str| TrackerError::InvalidRecord {
                agent_id: agent.agent_id.clone(),
                reason: reason.to_string(),
            };
            if agent.actions.len() != agent.obs.len() || agent.rewards.len() != agent.obs.len() {
                return Err(invalid("sequence lengths differ"));
            }
            if agent.active_rows > tracker.num_rows {
                return Err(invalid("more active rows than log-prob rows"));
            }
            if agent.final_obs.is_set() == agent.obs.is_empty() {
                return Err(invalid("final observation does not match step count"));
            }
            tracker.obs[slot] = agent.obs;
            tracker.actions[slot] = agent.actions;
            tracker.rewards[slot] = agent.rewards;
            tracker.final_obs[slot] = agent.final_obs;
            tracker.dones[slot] = agent.done;
            tracker.truncateds[slot] = agent.truncated;
            tracker.active_rows[slot] = agent.active_rows;
        }
        Ok(tracker)
    }
}

/// Borrowed view of one agent's slot.
#[derive(Debug, Clone, Copy)]
pub struct AgentView<'a> {
    pub obs: &'a [Observation],
    pub actions: &'a [Action],
    pub rewards: &'a [f32],
    pub final_obs: &'a FinalObs,
    pub done: bool,
    pub truncated: bool,
}

/// Persisted form of one agent slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSlotRecord {
    pub agent_id: AgentId,
    #[serde(with = "crate::trajectory::json_float")]
    pub obs: Vec<Observation>,
    #[serde(with = "crate::trajectory::json_float")]
    pub actions: Vec<Action>,
    #[serde(with = "crate::trajectory::json_float")]
    pub rewards: Vec<f32>,
    pub final_obs: FinalObs,
    pub done: bool,
    pub truncated: bool,
    pub active_rows: usize,
}

/// Persisted form of an [`EnvTrajectories`]; slots are listed in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvTrajectoriesRecord {
    pub agents: Vec<AgentSlotRecord>,
    #[serde(with = "crate::trajectory::json_float")]
    pub log_prob_rows: Vec<Vec<f32>>,
}
