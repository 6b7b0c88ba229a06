//! Seeded multi-agent environments that emit timestep deliveries.
//!
//! Each environment holds a fixed roster of agents for the length of an
//! episode. Agents terminate at independently sampled steps, and the whole
//! episode is truncated once it reaches `max_episode_len`. Like most
//! multi-agent simulators, an environment keeps emitting a timestep for every
//! agent on every step until it is reset, including agents that are already
//! done. The controller is expected to drop those.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::training::{EnvAction, EnvStepBatch};
use crate::trajectory::{AgentId, EnvId, Observation, Timestep};

/// Shape of a [`SyntheticEnvPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticEnvConfig {
    pub n_envs: usize,
    pub agents_per_env: usize,
    pub max_episode_len: u32,
    pub obs_size: usize,
}

impl Default for SyntheticEnvConfig {
    fn default() -> Self {
        Self {
            n_envs: 4,
            agents_per_env: 2,
            max_episode_len: 64,
            obs_size: 8,
        }
    }
}

#[derive(Debug, Clone)]
struct SyntheticAgent {
    id: AgentId,
    obs: Observation,
    terminate_at: u32,
    done: bool,
    truncated: bool,
}

#[derive(Debug, Clone)]
struct SyntheticEnv {
    id: EnvId,
    agents: Vec<SyntheticAgent>,
    step: u32,
    episodes: u64,
}

/// A pool of independent synthetic environments.
#[derive(Debug)]
pub struct SyntheticEnvPool {
    config: SyntheticEnvConfig,
    envs: Vec<SyntheticEnv>,
    rng: StdRng,
}

impl SyntheticEnvPool {
    pub fn new(config: SyntheticEnvConfig, seed: u64) -> Self {
        let mut pool = Self {
            config,
            envs: Vec::with_capacity(config.n_envs),
            rng: StdRng::seed_from_u64(seed),
        };
        for i in 0..config.n_envs {
            let mut env = SyntheticEnv {
                id: format!("env-{i}"),
                agents: Vec::new(),
                step: 0,
                episodes: 0,
            };
            pool.reset(&mut env);
            pool.envs.push(env);
        }
        pool
    }

    pub fn env_ids(&self) -> Vec<EnvId> {
        self.envs.iter().map(|e| e.id.clone()).collect()
    }

    /// Completed episodes across all environments.
    pub fn episodes(&self) -> u64 {
        self.envs.iter().map(|e| e.episodes).sum()
    }

    /// Advance every environment by one step and package the result.
    ///
    /// The log-prob row carries one entry per agent in roster order.
    pub fn collect(&mut self) -> BTreeMap<EnvId, EnvStepBatch> {
        let obs_size = self.config.obs_size;
        let max_len = self.config.max_episode_len;
        let mut batches = BTreeMap::new();

        for env in &mut self.envs {
            env.step += 1;
            let mut timesteps = Vec::with_capacity(env.agents.len());
            let mut log_probs = Vec::with_capacity(env.agents.len());
            let mut reward_sum = 0.0;

            for agent in &mut env.agents {
                let next_obs: Observation = (0..obs_size)
                    .map(|i| agent.obs[i] + self.rng.gen_range(-0.1..0.1))
                    .collect();
                let reward = if agent.done { 0.0 } else { self.rng.gen_range(-1.0..1.0) };
                if !agent.done {
                    if env.step >= agent.terminate_at {
                        agent.done = true;
                    } else if env.step >= max_len {
                        agent.done = true;
                        agent.truncated = true;
                    }
                }
                reward_sum += reward;

                timesteps.push(Timestep {
                    agent_id: agent.id.clone(),
                    obs: std::mem::replace(&mut agent.obs, next_obs.clone()),
                    next_obs,
                    action: vec![self.rng.gen_range(-1.0..1.0)],
                    reward,
                    terminated: agent.done && !agent.truncated,
                    truncated: agent.truncated,
                });
                log_probs.push(-self.rng.gen_range(0.0f32..3.0));
            }

            batches.insert(
                env.id.clone(),
                EnvStepBatch {
                    timesteps,
                    log_probs,
                    state_metrics: json!({
                        "episode_step": env.step,
                        "step_reward": reward_sum,
                    }),
                },
            );
        }
        batches
    }

    /// Apply the controller's decisions. Environments told to reset start a
    /// fresh episode; environments missing from `actions` are left alone.
    pub fn apply(&mut self, actions: &BTreeMap<EnvId, EnvAction>) {
        let mut envs = std::mem::take(&mut self.envs);
        for env in &mut envs {
            if actions.get(&env.id) == Some(&EnvAction::Reset) {
                env.episodes += 1;
                self.reset(env);
            }
        }
        self.envs = envs;
    }

    fn reset(&mut self, env: &mut SyntheticEnv) {
        let max_len = self.config.max_episode_len.max(1);
        env.step = 0;
        env.agents = (0..self.config.agents_per_env)
            .map(|i| SyntheticAgent {
                id: format!("agent-{i}"),
                obs: (0..self.config.obs_size)
                    .map(|_| self.rng.gen_range(-1.0..1.0))
                    .collect(),
                // Past max_len means the episode limit truncates the agent.
                terminate_at: self.rng.gen_range(1..=max_len + max_len / 2),
                done: false,
                truncated: false,
            })
            .collect();
    }
}
