//! rollout-coordinator: drive and inspect the agent controller.
//!
//! - `simulate` -- run synthetic environments through the controller with the
//!   in-crate learner, experience buffer and metrics logger
//! - `inspect`  -- summarise a saved checkpoint directory

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rollout_coordinator::agent::{
    InMemoryExperienceBuffer, JsonlMetricsLogger, MockLearner, RunningObsStandardizer,
};
use rollout_coordinator::checkpoint::{CheckpointManager, CheckpointSnapshot};
use rollout_coordinator::config::AgentControllerConfig;
use rollout_coordinator::env::{SyntheticEnvConfig, SyntheticEnvPool};
use rollout_coordinator::training::PpoAgentController;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Trajectory aggregation and checkpointing for on-policy multi-agent RL.
#[derive(Parser)]
#[command(name = "rollout-coordinator", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run synthetic environments through the controller.
    Simulate {
        /// Number of learning steps to run before stopping.
        #[arg(long, default_value_t = 3)]
        iterations: u64,

        /// Number of parallel environments.
        #[arg(long, default_value_t = 8)]
        envs: usize,

        /// Agents per environment.
        #[arg(long, default_value_t = 2)]
        agents: usize,

        /// Episode length after which every remaining agent is truncated.
        #[arg(long, default_value_t = 200)]
        max_episode_len: u32,

        /// Continue from the newest checkpoint in this run directory.
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Metrics log (defaults to `<save_folder>/metrics.jsonl`).
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Standardize observations with running statistics before tracking.
        #[arg(long)]
        standardize_obs: bool,
    },

    /// Summarise a checkpoint directory.
    Inspect {
        /// Path to a checkpoint directory (`<run_dir>/<id>`).
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AgentControllerConfig::load_from_file(path)?,
        None => AgentControllerConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            iterations,
            envs,
            agents,
            max_episode_len,
            resume,
            metrics,
            standardize_obs,
        } => {
            let env_config = SyntheticEnvConfig {
                n_envs: envs,
                agents_per_env: agents,
                max_episode_len,
                ..Default::default()
            };
            let options = SimulateOptions {
                iterations,
                resume,
                metrics,
                standardize_obs,
            };
            cmd_simulate(config, env_config, options).await
        }
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

struct SimulateOptions {
    iterations: u64,
    resume: Option<PathBuf>,
    metrics: Option<PathBuf>,
    standardize_obs: bool,
}

async fn cmd_simulate(
    mut config: AgentControllerConfig,
    env_config: SyntheticEnvConfig,
    options: SimulateOptions,
) -> Result<()> {
    if env_config.n_envs == 0 || env_config.agents_per_env == 0 {
        bail!("simulate needs at least one environment with at least one agent");
    }

    if let Some(run_dir) = options.resume.as_deref() {
        match CheckpointManager::latest(run_dir)? {
            Some(checkpoint) => {
                tracing::info!(
                    checkpoint = %checkpoint.display(),
                    "Resuming from newest checkpoint"
                );
                config.checkpoint_load_folder = Some(checkpoint);
            }
            None => bail!("No checkpoints found in {}", run_dir.display()),
        }
    }

    let metrics_path = options.metrics.unwrap_or_else(|| config.save_folder.join("metrics.jsonl"));
    let seed = config.random_seed;
    let learner = MockLearner::new(config.experience_buffer.batch_size);
    let buffer = InMemoryExperienceBuffer::new(config.experience_buffer.clone(), seed);
    let logger = JsonlMetricsLogger::new(metrics_path);

    let mut controller = PpoAgentController::new(config, learner, buffer, Some(logger))?;
    if options.standardize_obs {
        controller = controller.with_obs_standardizer(RunningObsStandardizer::default());
    }
    let start_iteration = controller.state().cur_iteration;
    let target_iteration = start_iteration + options.iterations;
    let mut pool = SyntheticEnvPool::new(env_config, seed.wrapping_add(start_iteration));

    tracing::info!(
        envs = env_config.n_envs,
        agents = env_config.agents_per_env,
        from_iteration = start_iteration,
        to_iteration = target_iteration,
        "Starting simulation"
    );

    while controller.state().cur_iteration < target_iteration {
        let batches = pool.collect();
        let actions = controller
            .step(batches)
            .await
            .context("Controller rejected a delivery")?;
        pool.apply(&actions);
    }

    let checkpoint = controller.save_checkpoint()?;
    println!("Simulation finished");
    println!("  Iterations:           {}", controller.state().cur_iteration);
    println!("  Cumulative timesteps: {}", controller.state().cumulative_timesteps);
    println!("  Episodes reset:       {}", pool.episodes());
    println!("  Learner updates:      {}", controller.learner().updates());
    println!("  Final checkpoint:     {}", checkpoint.display());

    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let snapshot = CheckpointSnapshot::read(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let agent = &snapshot.agent;

    println!("Checkpoint: {}", path.display());
    println!("  Schema version:        {}", agent.schema_version);
    println!("  Iteration:             {}", agent.cur_iteration);
    println!("  Iteration timesteps:   {}", agent.iteration_timesteps);
    println!("  Cumulative timesteps:  {}", agent.cumulative_timesteps);
    println!("  Iteration started at:  {}", format_unix(agent.iteration_start_time));
    println!(
        "  Collection started at: {}",
        format_unix(agent.timestep_collection_start_time)
    );
    if let Some(token) = &agent.run_identity_token {
        println!("  Run identity:          {token}");
    }
    println!("  State metrics:         {}", snapshot.state_metrics.metrics.len());
    println!();

    let trackers = &snapshot.trajectories.env_trajectories;
    println!("Open environments ({}):", trackers.len());
    for (env_id, record) in trackers {
        let done = record.agents.iter().filter(|a| a.done).count();
        let steps: usize = record.agents.iter().map(|a| a.obs.len()).sum();
        println!(
            "  {env_id}: {} agents ({done} done), {steps} steps, {} log-prob rows",
            record.agents.len(),
            record.log_prob_rows.len()
        );
    }
    println!();

    let pending = &snapshot.trajectories.trajectories;
    let pending_steps: usize = pending.iter().map(|t| t.len()).sum();
    let truncated = pending.iter().filter(|t| t.truncated).count();
    println!(
        "Pending trajectories: {} ({pending_steps} steps, {truncated} truncated)",
        pending.len()
    );

    Ok(())
}

fn format_unix(seconds: f64) -> String {
    let secs = seconds.floor();
    let nanos = ((seconds - secs) * 1e9) as u32;
    match chrono::DateTime::from_timestamp(secs as i64, nanos) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{seconds}"),
    }
}
