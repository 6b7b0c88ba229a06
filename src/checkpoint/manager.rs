//! Saving, loading and pruning checkpoint directories inside a run directory.
//!
//! A run directory holds one subdirectory per checkpoint, named by its
//! [`CheckpointId`]. Saves are staged in `<id>.partial/` and renamed into
//! place once every file is written, so a crash mid-save never leaves a
//! directory that looks like a complete checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::agent::{ExperienceBuffer, Learner, MetricsLogger};
use crate::training::IterationState;

use super::id::CheckpointId;
use super::schema::{
    CheckpointError, CheckpointSnapshot, EXPERIENCE_BUFFER_FOLDER, LEARNER_FOLDER,
    METRICS_LOGGER_FOLDER,
};

const STAGING_SUFFIX: &str = ".partial";

/// Owns one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_dir: PathBuf,
    keep: usize,
    last_id: Option<CheckpointId>,
}

impl CheckpointManager {
    /// Manage `run_dir`, keeping the newest `keep` checkpoints (0 keeps all).
    pub fn new(run_dir: impl Into<PathBuf>, keep: usize) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;
        let last_id = list_checkpoints(&run_dir)?.last().copied();
        Ok(Self {
            run_dir,
            keep,
            last_id,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Valid checkpoint ids in this run, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointId>> {
        list_checkpoints(&self.run_dir)
    }

    /// Write a checkpoint of `state` and every collaborator, then prune.
    ///
    /// Returns the final checkpoint directory.
    pub fn save<L, B, M>(
        &mut self,
        state: &IterationState,
        learner: &L,
        experience_buffer: &B,
        metrics_logger: Option<&M>,
    ) -> Result<PathBuf>
    where
        L: Learner,
        B: ExperienceBuffer,
        M: MetricsLogger,
    {
        let id = CheckpointId::next_after(self.last_id);
        let staging = self.run_dir.join(format!("{id}{STAGING_SUFFIX}"));
        let target = self.run_dir.join(id.to_string());

        let written = write_checkpoint(&staging, state, learner, experience_buffer, metrics_logger)
            .and_then(|()| {
                fs::rename(&staging, &target).map_err(|e| CheckpointError::io(&target, e).into())
            });
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                debug!(
                    path = %staging.display(),
                    error = %cleanup,
                    "Could not remove staging directory"
                );
            }
            return Err(e.context(format!("Failed to save checkpoint {id}")));
        }

        self.last_id = Some(id);
        info!(
            checkpoint = %target.display(),
            iteration = state.cur_iteration,
            cumulative_timesteps = state.cumulative_timesteps,
            "Saved checkpoint"
        );

        self.prune()?;
        Ok(target)
    }

    /// Delete all but the newest `keep` checkpoints. Returns the ids removed.
    pub fn prune(&self) -> Result<Vec<CheckpointId>> {
        if self.keep == 0 {
            return Ok(Vec::new());
        }
        let ids = self.list()?;
        let excess = ids.len().saturating_sub(self.keep);
        let removed = ids[..excess].to_vec();
        for id in &removed {
            let path = self.run_dir.join(id.to_string());
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove old checkpoint {}", path.display()))?;
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), kept = self.keep, "Pruned old checkpoints");
        }
        Ok(removed)
    }

    /// Restore a checkpoint directory into fresh collaborators and return the
    /// iteration state it holds.
    pub fn load<L, B, M>(
        dir: &Path,
        learner: &mut L,
        experience_buffer: &mut B,
        metrics_logger: Option<&mut M>,
    ) -> Result<IterationState>
    where
        L: Learner,
        B: ExperienceBuffer,
        M: MetricsLogger,
    {
        if !dir.is_dir() {
            return Err(CheckpointError::MissingFile(dir.to_path_buf()).into());
        }

        let learner_dir = require_dir(dir, LEARNER_FOLDER)?;
        learner
            .load_checkpoint(&learner_dir)
            .with_context(|| format!("Failed to load learner from {}", learner_dir.display()))?;

        let buffer_dir = require_dir(dir, EXPERIENCE_BUFFER_FOLDER)?;
        experience_buffer
            .load_checkpoint(&buffer_dir)
            .with_context(|| {
                format!("Failed to load experience buffer from {}", buffer_dir.display())
            })?;

        if let Some(logger) = metrics_logger {
            let logger_dir = require_dir(dir, METRICS_LOGGER_FOLDER)?;
            logger
                .load_checkpoint(&logger_dir)
                .with_context(|| {
                    format!("Failed to load metrics logger from {}", logger_dir.display())
                })?;
        }

        let state = CheckpointSnapshot::read(dir)?.into_state(dir)?;
        info!(
            checkpoint = %dir.display(),
            iteration = state.cur_iteration,
            cumulative_timesteps = state.cumulative_timesteps,
            open_envs = state.env_trajectories.len(),
            "Loaded checkpoint"
        );
        Ok(state)
    }

    /// Newest valid checkpoint directory in `run_dir`, if any.
    pub fn latest(run_dir: &Path) -> Result<Option<PathBuf>> {
        if !run_dir.is_dir() {
            return Ok(None);
        }
        Ok(list_checkpoints(run_dir)?
            .last()
            .map(|id| run_dir.join(id.to_string())))
    }
}

fn write_checkpoint<L, B, M>(
    staging: &Path,
    state: &IterationState,
    learner: &L,
    experience_buffer: &B,
    metrics_logger: Option<&M>,
) -> Result<()>
where
    L: Learner,
    B: ExperienceBuffer,
    M: MetricsLogger,
{
    fs::create_dir_all(staging).map_err(|e| CheckpointError::io(staging, e))?;

    let learner_dir = staging.join(LEARNER_FOLDER);
    learner
        .save_checkpoint(&learner_dir)
        .with_context(|| format!("Failed to save learner to {}", learner_dir.display()))?;

    let buffer_dir = staging.join(EXPERIENCE_BUFFER_FOLDER);
    experience_buffer
        .save_checkpoint(&buffer_dir)
        .with_context(|| format!("Failed to save experience buffer to {}", buffer_dir.display()))?;

    if let Some(logger) = metrics_logger {
        let logger_dir = staging.join(METRICS_LOGGER_FOLDER);
        logger
            .save_checkpoint(&logger_dir)
            .with_context(|| format!("Failed to save metrics logger to {}", logger_dir.display()))?;
    }

    CheckpointSnapshot::from_state(state).write(staging)?;
    Ok(())
}

fn require_dir(dir: &Path, name: &str) -> Result<PathBuf, CheckpointError> {
    let path = dir.join(name);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(CheckpointError::MissingFile(path))
    }
}

/// Valid checkpoint ids under `run_dir`, ascending. Entries whose names are
/// not ids (staging directories, stray files) are skipped.
fn list_checkpoints(run_dir: &Path) -> Result<Vec<CheckpointId>> {
    let entries =
        fs::read_dir(run_dir).map_err(|e| CheckpointError::io(run_dir, e))?;
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CheckpointError::io(run_dir, e))?;
        let name = entry.file_name();
        let parsed = name
            .to_str()
            .and_then(|s| s.parse::<CheckpointId>().ok())
            .filter(|_| entry.path().is_dir());
        match parsed {
            Some(id) => ids.push(id),
            None => warn!(
                entry = %entry.path().display(),
                "Skipping entry that is not a checkpoint directory"
            ),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Run directory resolution
// ---------------------------------------------------------------------------

/// Decide where this run's checkpoints go.
///
/// When the checkpoint being loaded lives two levels below `save_folder`
/// (`save_folder/<run>/<checkpoint>`), the run continues in that same `<run>`
/// directory. Otherwise a new run directory `save_folder/<run_name>` is used,
/// with `-<unix nanos>` appended when `add_unix_timestamp` is set.
pub fn resolve_run_dir(
    save_folder: &Path,
    run_name: &str,
    add_unix_timestamp: bool,
    checkpoint_load_folder: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(load_folder) = checkpoint_load_folder {
        let load_folder = fs::canonicalize(load_folder).with_context(|| {
            format!("Checkpoint load folder {} does not exist", load_folder.display())
        })?;
        if let Some(run_dir) = load_folder.parent() {
            let same_save_folder = run_dir
                .parent()
                .is_some_and(|loaded_save| absolute(save_folder) == loaded_save);
            if same_save_folder {
                info!(run_dir = %run_dir.display(), "Continuing run from loaded checkpoint");
                return Ok(run_dir.to_path_buf());
            }
        }
    }

    let dir_name = if add_unix_timestamp {
        format!("{run_name}-{}", CheckpointId::now())
    } else {
        run_name.to_string()
    };
    let run_dir = save_folder.join(dir_name);
    info!(run_dir = %run_dir.display(), "Starting new run directory");
    Ok(run_dir)
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{InMemoryExperienceBuffer, JsonlMetricsLogger, MockLearner};
    use crate::config::ExperienceBufferConfig;
    use crate::trajectory::{EnvTrajectories, Timestep, Trajectory};
    use serde_json::{json, Value};

    /// Buffer whose checkpoint write fails after creating its folder.
    struct BrokenBuffer;

    impl ExperienceBuffer for BrokenBuffer {
        async fn submit_experience(&mut self, _trajectories: Vec<Trajectory>) -> Result<Value> {
            Ok(Value::Null)
        }

        fn num_timesteps(&self) -> usize {
            0
        }

        fn sample_trajectories(&mut self, _min_timesteps: usize) -> Vec<Trajectory> {
            Vec::new()
        }

        fn save_checkpoint(&self, folder: &Path) -> Result<()> {
            fs::create_dir_all(folder)?;
            anyhow::bail!("disk full")
        }

        fn load_checkpoint(&mut self, _folder: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn step(agent: &str, obs: f32, terminated: bool) -> Timestep {
        Timestep {
            agent_id: agent.into(),
            obs: vec![obs],
            next_obs: vec![obs + 1.0],
            action: vec![0.5],
            reward: 0.25,
            terminated,
            truncated: false,
        }
    }

    fn populated_state() -> IterationState {
        let mut tracker = EnvTrajectories::new(vec!["A".into(), "B".into()]).unwrap();
        tracker
            .add_steps(vec![step("A", 0.0, false), step("B", 0.0, false)], &[-0.5, -0.75])
            .unwrap();
        tracker
            .add_steps(vec![step("A", 1.0, true), step("B", 1.0, false)], &[-0.125, -0.25])
            .unwrap();

        let mut done = EnvTrajectories::new(vec!["C".into()]).unwrap();
        done.add_steps(vec![step("C", 5.0, true)], &[-1.0]).unwrap();

        let mut state = IterationState::new();
        state.cur_iteration = 4;
        state.cumulative_timesteps = 1234;
        state.iteration_timesteps = 34;
        state.iteration_start_time = 1_700_000_000.5;
        state.timestep_collection_start_time = 1_700_000_012.25;
        state.timesteps_since_last_save = 77;
        state.env_trajectories.insert("env-0".into(), tracker);
        state.trajectories = done.into_trajectories().unwrap();
        state.iteration_state_metrics = vec![json!({"goals": 2}), json!(null)];
        state.run_identity_token = Some("run-abc".into());
        state
    }

    fn collaborators(dir: &Path) -> (MockLearner, InMemoryExperienceBuffer, JsonlMetricsLogger) {
        (
            MockLearner::new(8),
            InMemoryExperienceBuffer::new(ExperienceBufferConfig::default(), 3),
            JsonlMetricsLogger::new(dir.join("metrics.jsonl")),
        )
    }

    #[test]
    fn test_round_trip_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, logger) = collaborators(dir.path());
        let mut manager = CheckpointManager::new(dir.path().join("run"), 5).unwrap();
        let state = populated_state();

        let saved = manager.save(&state, &learner, &buffer, Some(&logger)).unwrap();
        assert!(saved.join(LEARNER_FOLDER).is_dir());
        assert!(saved.join(METRICS_LOGGER_FOLDER).is_dir());

        let (mut learner2, mut buffer2, mut logger2) = collaborators(dir.path());
        let restored =
            CheckpointManager::load(&saved, &mut learner2, &mut buffer2, Some(&mut logger2))
                .unwrap();

        let mut expected = state.clone();
        expected.timesteps_since_last_save = 0;
        assert_eq!(restored, expected);
        assert_eq!(logger2.run_id(), logger.run_id());
    }

    #[test]
    fn test_non_finite_floats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, _) = collaborators(dir.path());
        let mut manager = CheckpointManager::new(dir.path().join("run"), 5).unwrap();

        let mut masked = step("A", f32::NEG_INFINITY, false);
        masked.reward = f32::INFINITY;
        let mut tracker = EnvTrajectories::new(vec!["A".into()]).unwrap();
        tracker.add_steps(vec![masked], &[f32::NEG_INFINITY]).unwrap();
        let mut state = IterationState::new();
        state.env_trajectories.insert("env-0".into(), tracker);

        let saved = manager
            .save::<_, _, JsonlMetricsLogger>(&state, &learner, &buffer, None)
            .unwrap();
        let raw = fs::read_to_string(saved.join(super::super::schema::TRAJECTORIES_FILE)).unwrap();
        assert!(raw.contains("\"-inf\""));
        assert!(!raw.contains("null"));

        let (mut learner2, mut buffer2, _) = collaborators(dir.path());
        let restored = CheckpointManager::load::<_, _, JsonlMetricsLogger>(
            &saved,
            &mut learner2,
            &mut buffer2,
            None,
        )
        .unwrap();
        let tracker = &restored.env_trajectories["env-0"];
        assert_eq!(tracker.log_prob_row(0), Some(&[f32::NEG_INFINITY][..]));
        assert_eq!(tracker.agent("A").unwrap().rewards, &[f32::INFINITY]);
        assert_eq!(restored.env_trajectories, state.env_trajectories);
    }

    #[test]
    fn test_failed_save_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, _) = collaborators(dir.path());
        let run_dir = dir.path().join("run");
        let mut manager = CheckpointManager::new(&run_dir, 1).unwrap();

        let good = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();

        let err = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &BrokenBuffer, None)
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk full"));

        assert!(good.is_dir());
        assert_eq!(manager.list().unwrap().len(), 1);
        assert_eq!(CheckpointManager::latest(&run_dir).unwrap(), Some(good.clone()));
        let leftovers: Vec<_> = fs::read_dir(&run_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(STAGING_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());

        // The next successful save supersedes the old checkpoint as usual.
        let next = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();
        assert!(!good.exists());
        assert_eq!(CheckpointManager::latest(&run_dir).unwrap(), Some(next));
    }

    #[test]
    fn test_save_without_logger() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, _) = collaborators(dir.path());
        let mut manager = CheckpointManager::new(dir.path(), 0).unwrap();
        let saved = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();
        assert!(!saved.join(METRICS_LOGGER_FOLDER).exists());
        assert!(!dir.path().read_dir().unwrap().any(|e| e
            .unwrap()
            .file_name()
            .to_string_lossy()
            .ends_with(STAGING_SUFFIX)));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=7 {
            fs::create_dir(dir.path().join(i.to_string())).unwrap();
        }
        let manager = CheckpointManager::new(dir.path(), 5).unwrap();
        let removed = manager.prune().unwrap();
        assert_eq!(
            removed,
            vec![CheckpointId::from_nanos(1), CheckpointId::from_nanos(2)]
        );
        let remaining: Vec<u128> = manager
            .list()
            .unwrap()
            .into_iter()
            .map(CheckpointId::as_nanos)
            .collect();
        assert_eq!(remaining, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_prune_zero_keeps_all() {
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=3 {
            fs::create_dir(dir.path().join(i.to_string())).unwrap();
        }
        let manager = CheckpointManager::new(dir.path(), 0).unwrap();
        assert!(manager.prune().unwrap().is_empty());
        assert_eq!(manager.list().unwrap().len(), 3);
    }

    #[test]
    fn test_listing_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("10")).unwrap();
        fs::create_dir(dir.path().join("9")).unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();
        fs::create_dir(dir.path().join("11.partial")).unwrap();
        fs::write(dir.path().join("12"), b"not a directory").unwrap();

        let manager = CheckpointManager::new(dir.path(), 1).unwrap();
        let ids: Vec<u128> = manager
            .list()
            .unwrap()
            .into_iter()
            .map(CheckpointId::as_nanos)
            .collect();
        assert_eq!(ids, vec![9, 10]);

        manager.prune().unwrap();
        assert!(dir.path().join("notes").is_dir());
        assert!(dir.path().join("11.partial").is_dir());
        assert!(!dir.path().join("9").exists());
        assert_eq!(
            CheckpointManager::latest(dir.path()).unwrap(),
            Some(dir.path().join("10"))
        );
    }

    #[test]
    fn test_ids_advance_past_existing() {
        let dir = tempfile::tempdir().unwrap();
        let far_future = u128::from(u64::MAX) * 4;
        fs::create_dir(dir.path().join(far_future.to_string())).unwrap();
        let (learner, buffer, _) = collaborators(dir.path());

        let mut manager = CheckpointManager::new(dir.path(), 0).unwrap();
        let saved = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();
        assert_eq!(saved, dir.path().join((far_future + 1).to_string()));
    }

    #[test]
    fn test_load_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, _) = collaborators(dir.path());
        let mut manager = CheckpointManager::new(dir.path().join("run"), 5).unwrap();
        let saved = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();
        fs::remove_file(saved.join(super::super::schema::TRAJECTORIES_FILE)).unwrap();

        let (mut learner2, mut buffer2, _) = collaborators(dir.path());
        let err = CheckpointManager::load::<_, _, JsonlMetricsLogger>(
            &saved,
            &mut learner2,
            &mut buffer2,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::MissingFile(_))
        ));
    }

    #[test]
    fn test_load_requires_logger_folder_when_logging() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, buffer, mut logger) = collaborators(dir.path());
        let mut manager = CheckpointManager::new(dir.path().join("run"), 5).unwrap();
        let saved = manager
            .save::<_, _, JsonlMetricsLogger>(&IterationState::new(), &learner, &buffer, None)
            .unwrap();

        let (mut learner2, mut buffer2, _) = collaborators(dir.path());
        let err = CheckpointManager::load(&saved, &mut learner2, &mut buffer2, Some(&mut logger))
            .unwrap_err();
        assert!(err.to_string().contains(METRICS_LOGGER_FOLDER));
    }

    #[test]
    fn test_resolve_continues_run_in_same_save_folder() {
        let dir = tempfile::tempdir().unwrap();
        let save_folder = dir.path().join("agents_checkpoints");
        let checkpoint = save_folder.join("my-run-1").join("123");
        fs::create_dir_all(&checkpoint).unwrap();

        let run_dir = resolve_run_dir(&save_folder, "my-run", true, Some(&checkpoint)).unwrap();
        assert_eq!(run_dir, fs::canonicalize(save_folder.join("my-run-1")).unwrap());
    }

    #[test]
    fn test_resolve_new_run_for_foreign_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("elsewhere").join("run").join("123");
        fs::create_dir_all(&checkpoint).unwrap();
        let save_folder = dir.path().join("agents_checkpoints");

        let run_dir = resolve_run_dir(&save_folder, "fresh", false, Some(&checkpoint)).unwrap();
        assert_eq!(run_dir, save_folder.join("fresh"));

        let stamped = resolve_run_dir(&save_folder, "fresh", true, None).unwrap();
        let name = stamped.file_name().unwrap().to_string_lossy().into_owned();
        let suffix = name.strip_prefix("fresh-").unwrap();
        assert!(suffix.parse::<CheckpointId>().is_ok());
    }

    #[test]
    fn test_resolve_missing_load_folder() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(resolve_run_dir(dir.path(), "run", false, Some(&missing)).is_err());
    }
}
