//! Per-iteration controller data and a JSON-lines metrics logger.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::traits::MetricsLogger;

const LOGGER_STATE_FILE: &str = "metrics_logger.json";

/// Everything the controller knows about one finished iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentControllerData {
    /// Diagnostics returned by the learner.
    pub learner_data: Value,
    /// Diagnostics returned by the experience buffer.
    pub experience_data: Value,
    pub cumulative_timesteps: u64,
    /// Wall-clock seconds from iteration start to the end of the learning step.
    pub iteration_time: f64,
    pub timesteps_collected: u64,
    /// Wall-clock seconds spent collecting timesteps.
    pub timestep_collection_time: f64,
}

/// One line of the metrics log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub logged_at: DateTime<Utc>,
    pub run_id: String,
    pub controller: String,
    pub report: u64,
    pub state_metrics: Value,
    pub agent_metrics: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggerState {
    run_id: String,
    reports: u64,
}

/// Appends one [`MetricsRecord`] per iteration to a `.jsonl` file.
#[derive(Debug, Clone)]
pub struct JsonlMetricsLogger {
    path: PathBuf,
    run_id: String,
    reports: u64,
}

impl JsonlMetricsLogger {
    /// Log to `path`, starting a fresh run.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            run_id: Uuid::new_v4().to_string(),
            reports: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of reports written in this run.
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

impl MetricsLogger for JsonlMetricsLogger {
    fn collect_agent_metrics(&mut self, data: &AgentControllerData) -> Result<Value> {
        let steps_per_second = if data.timestep_collection_time > 0.0 {
            data.timesteps_collected as f64 / data.timestep_collection_time
        } else {
            0.0
        };
        Ok(json!({
            "learner": data.learner_data,
            "experience": data.experience_data,
            "cumulative_timesteps": data.cumulative_timesteps,
            "timesteps_collected": data.timesteps_collected,
            "iteration_time": data.iteration_time,
            "timestep_collection_time": data.timestep_collection_time,
            "steps_per_second": steps_per_second,
        }))
    }

    /// Averages every numeric field that appears in object-shaped state
    /// metrics; other payloads are only counted.
    fn collect_state_metrics(&mut self, state_metrics: &[Value]) -> Result<Value> {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for metrics in state_metrics {
            let Some(fields) = metrics.as_object() else {
                continue;
            };
            for (key, value) in fields {
                if let Some(x) = value.as_f64() {
                    let entry = sums.entry(key.as_str()).or_insert((0.0, 0));
                    entry.0 += x;
                    entry.1 += 1;
                }
            }
        }
        let means: serde_json::Map<String, Value> = sums
            .into_iter()
            .map(|(key, (sum, n))| (format!("mean_{key}"), json!(sum / n as f64)))
            .collect();
        Ok(json!({
            "count": state_metrics.len(),
            "means": means,
        }))
    }

    fn report_metrics(
        &mut self,
        controller_name: &str,
        state_metrics: Value,
        agent_metrics: Value,
    ) -> Result<()> {
        self.reports += 1;
        let record = MetricsRecord {
            logged_at: Utc::now(),
            run_id: self.run_id.clone(),
            controller: controller_name.to_string(),
            report: self.reports,
            state_metrics,
            agent_metrics,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open metrics log {}", self.path.display()))?;
        let line = serde_json::to_string(&record).context("Failed to serialize metrics record")?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        tracing::info!(
            controller = controller_name,
            report = self.reports,
            run_id = %self.run_id,
            "Reported iteration metrics"
        );
        Ok(())
    }

    fn run_id(&self) -> Option<&str> {
        Some(&self.run_id)
    }

    fn resume_run(&mut self, run_id: &str) {
        if self.run_id != run_id {
            tracing::info!(run_id, "Resuming metrics run from checkpoint");
            self.run_id = run_id.to_string();
        }
    }

    fn save_checkpoint(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        let state = LoggerState {
            run_id: self.run_id.clone(),
            reports: self.reports,
        };
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(folder.join(LOGGER_STATE_FILE), json)
            .with_context(|| {
                format!("Failed to write metrics logger state to {}", folder.display())
            })
    }

    fn load_checkpoint(&mut self, folder: &Path) -> Result<()> {
        let path = folder.join(LOGGER_STATE_FILE);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state: LoggerState = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        self.run_id = state.run_id;
        self.reports = state.reports;
        Ok(())
    }
}
