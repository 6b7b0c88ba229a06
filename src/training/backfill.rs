//! Value backfilling: one batched critic call per learning step.
//!
//! Every completed trajectory contributes its observation sequence followed by
//! its final observation to a single flat request. The critic's output is then
//! sliced back by the recorded `[start, stop)` ranges: the first `stop - start
//! - 1` values are the per-step predictions, the last one is the value of the
//! final observation.

use std::ops::Range;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use crate::agent::Critic;
use crate::trajectory::types::ValueFillError;
use crate::trajectory::{Observation, Trajectory};

#[derive(Debug, Error, PartialEq)]
pub enum BackfillError {
    #[error("critic returned {got} values for a request of {expected} observations")]
    LengthMismatch { expected: usize, got: usize },
    #[error("range {start}..{stop} does not fit {len} critic values")]
    RangeOutOfBounds { start: usize, stop: usize, len: usize },
    #[error("failed to fill values of trajectory {index}")]
    Fill {
        index: usize,
        #[source]
        source: ValueFillError,
    },
}

/// Flattened critic input for a list of trajectories.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticRequest<'a> {
    pub agent_ids: Vec<&'a str>,
    pub obs: Vec<&'a Observation>,
    /// One range per trajectory, covering its steps plus its final observation.
    pub ranges: Vec<Range<usize>>,
}

impl<'a> CriticRequest<'a> {
    pub fn build(trajectories: &'a [Trajectory]) -> Self {
        let total: usize = trajectories.iter().map(|t| t.len() + 1).sum();
        let mut agent_ids = Vec::with_capacity(total);
        let mut obs = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(trajectories.len());

        for trajectory in trajectories {
            let start = obs.len();
            for o in &trajectory.obs {
                agent_ids.push(trajectory.agent_id.as_str());
                obs.push(o);
            }
            agent_ids.push(trajectory.agent_id.as_str());
            obs.push(&trajectory.final_obs);
            ranges.push(start..obs.len());
        }

        Self {
            agent_ids,
            obs,
            ranges,
        }
    }

    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }
}

/// Write critic output back into `trajectories` using the request's ranges.
///
/// The length check happens before any trajectory is touched.
pub fn apply_value_predictions(
    trajectories: &mut [Trajectory],
    ranges: &[Range<usize>],
    values: &[f32],
) -> Result<(), BackfillError> {
    let expected = ranges.last().map_or(0, |r| r.end);
    if values.len() != expected {
        return Err(BackfillError::LengthMismatch {
            expected,
            got: values.len(),
        });
    }

    for (index, (trajectory, range)) in trajectories.iter_mut().zip(ranges).enumerate() {
        if range.start >= range.end || range.end > values.len() {
            return Err(BackfillError::RangeOutOfBounds {
                start: range.start,
                stop: range.end,
                len: values.len(),
            });
        }
        let last = range.end - 1;
        trajectory
            .fill_values(values[range.start..last].to_vec(), values[last])
            .map_err(|source| BackfillError::Fill { index, source })?;
    }
    Ok(())
}

/// Predict and attach values for every trajectory in one critic call.
pub async fn backfill_values<C: Critic>(critic: &C, trajectories: &mut [Trajectory]) -> Result<()> {
    if trajectories.is_empty() {
        return Ok(());
    }

    let (ranges, values) = {
        let request = CriticRequest::build(trajectories);
        debug!(
            trajectories = request.ranges.len(),
            observations = request.len(),
            "Requesting value predictions"
        );
        let values = critic
            .predict_values(&request.agent_ids, &request.obs)
            .await
            .context("Critic failed to predict values")?;
        (request.ranges, values)
    };

    apply_value_predictions(trajectories, &ranges, &values)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockCritic;

    fn trajectory(agent: &str, len: usize) -> Trajectory {
        Trajectory {
            agent_id: agent.into(),
            obs: (0..len).map(|i| vec![i as f32]).collect(),
            actions: vec![vec![0.0]; len],
            log_probs: vec![0.0; len],
            rewards: vec![0.0; len],
            value_predictions: None,
            final_obs: vec![len as f32],
            final_value_prediction: None,
            truncated: false,
        }
    }

    #[test]
    fn test_request_ranges_for_mixed_lengths() {
        let trajectories = vec![trajectory("a", 3), trajectory("b", 1), trajectory("c", 5)];
        let request = CriticRequest::build(&trajectories);
        assert_eq!(request.len(), 12);
        assert_eq!(request.ranges, vec![0..4, 4..6, 6..12]);
        assert_eq!(request.agent_ids[4], "b");
        assert_eq!(request.obs[3], &vec![3.0]);
    }

    #[test]
    fn test_apply_slices_by_range() {
        let mut trajectories = vec![trajectory("a", 3), trajectory("b", 1), trajectory("c", 5)];
        let ranges = CriticRequest::build(&trajectories).ranges;
        let values: Vec<f32> = (0..12).map(|i| i as f32).collect();

        apply_value_predictions(&mut trajectories, &ranges, &values).unwrap();

        assert_eq!(trajectories[0].value_predictions, Some(vec![0.0, 1.0, 2.0]));
        assert_eq!(trajectories[0].final_value_prediction, Some(3.0));
        assert_eq!(trajectories[1].value_predictions, Some(vec![4.0]));
        assert_eq!(trajectories[1].final_value_prediction, Some(5.0));
        assert_eq!(
            trajectories[2].value_predictions,
            Some(vec![6.0, 7.0, 8.0, 9.0, 10.0])
        );
        assert_eq!(trajectories[2].final_value_prediction, Some(11.0));
    }

    #[test]
    fn test_apply_rejects_wrong_length() {
        let mut trajectories = vec![trajectory("a", 2)];
        let ranges = CriticRequest::build(&trajectories).ranges;
        let err = apply_value_predictions(&mut trajectories, &ranges, &[0.0; 2]).unwrap_err();
        assert_eq!(err, BackfillError::LengthMismatch { expected: 3, got: 2 });
        assert!(trajectories[0].value_predictions.is_none());
    }

    #[test]
    fn test_apply_rejects_second_fill() {
        let mut trajectories = vec![trajectory("a", 1)];
        let ranges = CriticRequest::build(&trajectories).ranges;
        apply_value_predictions(&mut trajectories, &ranges, &[1.0, 2.0]).unwrap();
        let err = apply_value_predictions(&mut trajectories, &ranges, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, BackfillError::Fill { index: 0, .. }));

        let chain = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chain.matches("already filled").count(), 1);
    }

    #[tokio::test]
    async fn test_backfill_uses_one_critic_call() {
        let critic = MockCritic::new();
        let mut trajectories = vec![trajectory("a", 3), trajectory("b", 1)];
        backfill_values(&critic, &mut trajectories).await.unwrap();

        assert_eq!(critic.calls(), 1);
        assert_eq!(trajectories[0].value_predictions, Some(vec![0.0, 1.0, 2.0]));
        assert_eq!(trajectories[0].final_value_prediction, Some(3.0));
        assert_eq!(trajectories[1].final_value_prediction, Some(1.0));
    }

    #[tokio::test]
    async fn test_backfill_skips_critic_when_empty() {
        let critic = MockCritic::new();
        backfill_values(&critic, &mut []).await.unwrap();
        assert_eq!(critic.calls(), 0);
    }
}
