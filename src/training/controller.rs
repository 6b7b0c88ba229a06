//! PPO agent controller: the single mutator of a training run.
//!
//! ```text
//!   delivery ──> ingest ──> reset/step decisions ──> producer
//!                  │
//!                  └─ iteration_timesteps >= threshold?
//!                        1. finalize open trackers
//!                        2. backfill values (one critic call)
//!                        3. submit experience, learn
//!                        4. report metrics
//!                        5. reset iteration scope
//!                     timesteps_since_last_save >= save_every_ts?
//!                        save checkpoint, prune
//! ```
//!
//! Every method takes `&mut self`, so ingestion, decisions, learning steps and
//! checkpoint saves never overlap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::agent::{
    AgentChoice, AgentControllerData, AllAgents, ExperienceBuffer, Learner, MetricsLogger,
    ObsStandardizer,
};
use crate::checkpoint::{resolve_run_dir, CheckpointManager};
use crate::config::AgentControllerConfig;
use crate::trajectory::{AgentId, EnvId};

use super::backfill::backfill_values;
use super::collector::{
    standardize_observations, EnvAction, EnvStepBatch, IngestOutcome, IterationCollector,
};
use super::state::{unix_seconds, IterationState};

pub struct PpoAgentController<L, B, M> {
    config: AgentControllerConfig,
    learner: L,
    experience_buffer: B,
    metrics_logger: Option<M>,
    agent_choice: Box<dyn AgentChoice>,
    obs_standardizer: Option<Box<dyn ObsStandardizer>>,
    collector: IterationCollector,
    checkpoints: CheckpointManager,
}

impl<L, B, M> PpoAgentController<L, B, M>
where
    L: Learner,
    B: ExperienceBuffer,
    M: MetricsLogger,
{
    /// Build a controller, restoring `config.checkpoint_load_folder` into the
    /// collaborators when it is set.
    pub fn new(
        config: AgentControllerConfig,
        mut learner: L,
        mut experience_buffer: B,
        mut metrics_logger: Option<M>,
    ) -> Result<Self> {
        config.validate()?;

        let run_dir = resolve_run_dir(
            &config.save_folder,
            &config.run_name,
            config.add_unix_timestamp,
            config.checkpoint_load_folder.as_deref(),
        )?;
        let checkpoints = CheckpointManager::new(run_dir, config.n_checkpoints_to_keep)?;

        let state = match config.checkpoint_load_folder.as_deref() {
            Some(folder) => {
                let state = CheckpointManager::load(
                    folder,
                    &mut learner,
                    &mut experience_buffer,
                    metrics_logger.as_mut(),
                )
                .with_context(|| format!("Failed to restore checkpoint {}", folder.display()))?;
                if let (Some(logger), Some(token)) =
                    (metrics_logger.as_mut(), state.run_identity_token.as_deref())
                {
                    logger.resume_run(token);
                }
                state
            }
            None => IterationState::new(),
        };

        info!(
            controller = %config.controller_name,
            run_dir = %checkpoints.run_dir().display(),
            iteration = state.cur_iteration,
            cumulative_timesteps = state.cumulative_timesteps,
            "Agent controller ready"
        );

        Ok(Self {
            config,
            learner,
            experience_buffer,
            metrics_logger,
            agent_choice: Box::new(AllAgents),
            obs_standardizer: None,
            collector: IterationCollector::from_state(state),
            checkpoints,
        })
    }

    /// Replace the default act-for-every-agent strategy.
    pub fn with_agent_choice(mut self, choice: impl AgentChoice + 'static) -> Self {
        self.agent_choice = Box::new(choice);
        self
    }

    /// Standardize `obs` and `next_obs` of every delivered timestep before it
    /// is tracked.
    pub fn with_obs_standardizer(mut self, standardizer: impl ObsStandardizer + 'static) -> Self {
        warn!(
            "Observation standardization runs on every delivery and is slow; \
             prefer observations that are already roughly zero-mean and unit-variance"
        );
        self.obs_standardizer = Some(Box::new(standardizer));
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &AgentControllerConfig {
        &self.config
    }

    pub fn state(&self) -> &IterationState {
        self.collector.state()
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn experience_buffer(&self) -> &B {
        &self.experience_buffer
    }

    pub fn metrics_logger(&self) -> Option<&M> {
        self.metrics_logger.as_ref()
    }

    pub fn run_dir(&self) -> &Path {
        self.checkpoints.run_dir()
    }

    // ------------------------------------------------------------------
    // Producer-facing operations
    // ------------------------------------------------------------------

    /// Indices of the agents the policy should act for.
    pub fn choose_agents(&self, agent_ids: &[AgentId]) -> Vec<usize> {
        self.agent_choice.choose(agent_ids)
    }

    /// Ingest one delivery, then run a learning step and a checkpoint save if
    /// their thresholds were crossed.
    pub async fn process_timestep_data(
        &mut self,
        batches: BTreeMap<EnvId, EnvStepBatch>,
    ) -> Result<IngestOutcome> {
        let outcome = self.ingest(batches)?;
        self.run_scheduled_work().await?;
        Ok(outcome)
    }

    /// Reset/step decisions for the given environments.
    pub fn choose_env_actions<'a>(
        &mut self,
        env_ids: impl IntoIterator<Item = &'a EnvId>,
    ) -> Result<BTreeMap<EnvId, EnvAction>> {
        self.collector.choose_env_actions(env_ids)
    }

    /// Full request/response cycle for one delivery.
    ///
    /// Decisions are taken right after ingestion, before any learning step
    /// finalizes the trackers, so an environment whose agents all finished in
    /// this delivery is told to reset.
    pub async fn step(
        &mut self,
        batches: BTreeMap<EnvId, EnvStepBatch>,
    ) -> Result<BTreeMap<EnvId, EnvAction>> {
        let env_ids: Vec<EnvId> = batches.keys().cloned().collect();
        self.ingest(batches)?;
        let actions = self.collector.choose_env_actions(&env_ids)?;
        self.run_scheduled_work().await?;
        Ok(actions)
    }

    /// Persist the controller and its collaborators now.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        let run_id = self
            .metrics_logger
            .as_ref()
            .and_then(|logger| logger.run_id())
            .map(str::to_owned);
        let state = self.collector.state_mut();
        if run_id.is_some() {
            state.run_identity_token = run_id;
        }

        let path = self.checkpoints.save(
            state,
            &self.learner,
            &self.experience_buffer,
            self.metrics_logger.as_ref(),
        )?;
        state.timesteps_since_last_save = 0;
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ingest(&mut self, mut batches: BTreeMap<EnvId, EnvStepBatch>) -> Result<IngestOutcome> {
        if let Some(standardizer) = self.obs_standardizer.as_deref_mut() {
            for (env_id, batch) in &mut batches {
                standardize_observations(standardizer, &mut batch.timesteps).with_context(|| {
                    format!("Failed to standardize observations for env {env_id}")
                })?;
            }
        }
        let envs = batches.len();
        let outcome = self.collector.ingest(batches)?;
        debug!(
            envs,
            timesteps_added = outcome.timesteps_added,
            iteration_timesteps = self.collector.state().iteration_timesteps,
            "Ingested delivery"
        );
        Ok(outcome)
    }

    async fn run_scheduled_work(&mut self) -> Result<()> {
        if self
            .collector
            .reached_iteration_boundary(self.config.timesteps_per_iteration)
        {
            let collection_end = unix_seconds();
            self.learn(collection_end).await?;
        }
        if self.collector.state().timesteps_since_last_save >= self.config.save_every_ts {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    /// One learning step over everything collected this iteration.
    async fn learn(&mut self, collection_end: f64) -> Result<()> {
        let closed = self.collector.finalize_open_trackers()?;
        let state = self.collector.state_mut();

        backfill_values(self.learner.critic(), &mut state.trajectories).await?;

        let trajectories = std::mem::take(&mut state.trajectories);
        let n_trajectories = trajectories.len();
        let experience_data = self
            .experience_buffer
            .submit_experience(trajectories)
            .await
            .context("Experience buffer rejected trajectories")?;
        let learner_data = self
            .learner
            .learn(&mut self.experience_buffer)
            .await
            .context("Learning step failed")?;

        let now = unix_seconds();
        if let Some(logger) = self.metrics_logger.as_mut() {
            let data = AgentControllerData {
                learner_data,
                experience_data,
                cumulative_timesteps: state.cumulative_timesteps,
                iteration_time: now - state.iteration_start_time,
                timesteps_collected: state.iteration_timesteps,
                timestep_collection_time: collection_end - state.timestep_collection_start_time,
            };
            let agent_metrics = logger.collect_agent_metrics(&data)?;
            let state_metrics = logger.collect_state_metrics(&state.iteration_state_metrics)?;
            logger.report_metrics(&self.config.controller_name, state_metrics, agent_metrics)?;
        }

        info!(
            iteration = state.cur_iteration,
            timesteps = state.iteration_timesteps,
            cumulative_timesteps = state.cumulative_timesteps,
            trajectories = n_trajectories,
            truncated_envs = closed,
            "Finished learning step"
        );

        state.finish_iteration(unix_seconds());
        Ok(())
    }
}
