//! On-disk records for the controller's own checkpoint files.
//!
//! Each file carries a `schema_version`. Decoding first probes the version and
//! only then decodes the full record, so a file written by a newer layout is
//! reported as an unsupported version rather than as a parse error.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::training::IterationState;
use crate::trajectory::{EnvId, EnvTrajectories, EnvTrajectoriesRecord, TrackerError, Trajectory};

pub const SCHEMA_VERSION: u32 = 1;

pub const AGENT_STATE_FILE: &str = "ppo_agent.json";
pub const STATE_METRICS_FILE: &str = "iteration_state_metrics.json";
pub const TRAJECTORIES_FILE: &str = "current_trajectories.json";

pub const LEARNER_FOLDER: &str = "ppo_learner";
pub const EXPERIENCE_BUFFER_FOLDER: &str = "experience_buffer";
pub const METRICS_LOGGER_FOLDER: &str = "metrics_logger";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("required checkpoint entry {} is missing", .0.display())]
    MissingFile(PathBuf),
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} has schema version {found}, this build reads version {expected}", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("tracker for env {env_id} in {} is inconsistent", path.display())]
    InvalidTracker {
        path: PathBuf,
        env_id: EnvId,
        #[source]
        source: TrackerError,
    },
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// `ppo_agent.json`: scalar counters and timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateRecord {
    pub schema_version: u32,
    pub cur_iteration: u64,
    pub iteration_timesteps: u64,
    pub cumulative_timesteps: u64,
    pub iteration_start_time: f64,
    pub timestep_collection_start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_identity_token: Option<String>,
}

/// `iteration_state_metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetricsRecord {
    pub schema_version: u32,
    pub metrics: Vec<Value>,
}

/// `current_trajectories.json`: open trackers and pending trajectories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoriesRecord {
    pub schema_version: u32,
    pub env_trajectories: BTreeMap<EnvId, EnvTrajectoriesRecord>,
    pub trajectories: Vec<Trajectory>,
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

/// The three controller-owned files of one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub agent: AgentStateRecord,
    pub state_metrics: StateMetricsRecord,
    pub trajectories: TrajectoriesRecord,
}

impl CheckpointSnapshot {
    pub fn from_state(state: &IterationState) -> Self {
        Self {
            agent: AgentStateRecord {
                schema_version: SCHEMA_VERSION,
                cur_iteration: state.cur_iteration,
                iteration_timesteps: state.iteration_timesteps,
                cumulative_timesteps: state.cumulative_timesteps,
                iteration_start_time: state.iteration_start_time,
                timestep_collection_start_time: state.timestep_collection_start_time,
                run_identity_token: state.run_identity_token.clone(),
            },
            state_metrics: StateMetricsRecord {
                schema_version: SCHEMA_VERSION,
                metrics: state.iteration_state_metrics.clone(),
            },
            trajectories: TrajectoriesRecord {
                schema_version: SCHEMA_VERSION,
                env_trajectories: state
                    .env_trajectories
                    .iter()
                    .map(|(env_id, tracker)| (env_id.clone(), tracker.to_record()))
                    .collect(),
                trajectories: state.trajectories.clone(),
            },
        }
    }

    /// Rebuild the iteration state. `timesteps_since_last_save` restarts at 0.
    /// `dir` is only used to label errors.
    pub fn into_state(self, dir: &Path) -> Result<IterationState, CheckpointError> {
        let mut env_trajectories = BTreeMap::new();
        for (env_id, record) in self.trajectories.env_trajectories {
            let tracker = EnvTrajectories::from_record(record).map_err(|source| {
                CheckpointError::InvalidTracker {
                    path: dir.join(TRAJECTORIES_FILE),
                    env_id: env_id.clone(),
                    source,
                }
            })?;
            env_trajectories.insert(env_id, tracker);
        }

        Ok(IterationState {
            cur_iteration: self.agent.cur_iteration,
            cumulative_timesteps: self.agent.cumulative_timesteps,
            iteration_timesteps: self.agent.iteration_timesteps,
            timesteps_since_last_save: 0,
            iteration_start_time: self.agent.iteration_start_time,
            timestep_collection_start_time: self.agent.timestep_collection_start_time,
            env_trajectories,
            trajectories: self.trajectories.trajectories,
            iteration_state_metrics: self.state_metrics.metrics,
            run_identity_token: self.agent.run_identity_token,
        })
    }

    pub fn write(&self, dir: &Path) -> Result<(), CheckpointError> {
        write_json(&dir.join(AGENT_STATE_FILE), &self.agent)?;
        write_json(&dir.join(STATE_METRICS_FILE), &self.state_metrics)?;
        write_json(&dir.join(TRAJECTORIES_FILE), &self.trajectories)
    }

    pub fn read(dir: &Path) -> Result<Self, CheckpointError> {
        Ok(Self {
            agent: read_json(&dir.join(AGENT_STATE_FILE))?,
            state_metrics: read_json(&dir.join(STATE_METRICS_FILE))?,
            trajectories: read_json(&dir.join(TRAJECTORIES_FILE))?,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|e| CheckpointError::io(path, e))
}

/// Read a versioned record, checking the version before decoding the rest.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CheckpointError::MissingFile(path.to_path_buf()))
        }
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    let decode_err = |source: serde_json::Error| CheckpointError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let probe: VersionProbe = serde_json::from_slice(&data).map_err(decode_err)?;
    if probe.schema_version != SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: probe.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    serde_json::from_slice(&data).map_err(decode_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            read_json::<StateMetricsRecord>(&dir.path().join(STATE_METRICS_FILE)).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingFile(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_METRICS_FILE);
        std::fs::write(&path, r#"{"schema_version": 99, "something_else": true}"#).unwrap();
        let err = read_json::<StateMetricsRecord>(&path).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::UnsupportedVersion { found: 99, expected: 1, .. }
        ));
    }

    #[test]
    fn test_decode_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AGENT_STATE_FILE);
        std::fs::write(&path, r#"{"schema_version": 1, "cur_iteration": "three"}"#).unwrap();
        let err = read_json::<AgentStateRecord>(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Decode { .. }));
        assert!(err.to_string().contains(AGENT_STATE_FILE));

        let chain = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chain.matches("invalid type").count(), 1);
    }

    #[test]
    fn test_token_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AGENT_STATE_FILE);
        std::fs::write(
            &path,
            r#"{"schema_version": 1, "cur_iteration": 3, "iteration_timesteps": 10,
                "cumulative_timesteps": 500, "iteration_start_time": 1.5,
                "timestep_collection_start_time": 2.5}"#,
        )
        .unwrap();
        let record: AgentStateRecord = read_json(&path).unwrap();
        assert_eq!(record.cur_iteration, 3);
        assert!(record.run_identity_token.is_none());
    }
}
