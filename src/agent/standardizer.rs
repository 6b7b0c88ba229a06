//! Running observation standardizer.
//!
//! Tracks a per-dimension mean and variance with Welford's online update,
//! shared across agents, and maps every observation to
//! `(x - mean) / std`, clipped to `[-clip, clip]`.

use anyhow::{bail, Result};

use crate::trajectory::Observation;

use super::traits::ObsStandardizer;

const EPSILON: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct RunningObsStandardizer {
    mean: Vec<f64>,
    /// Sum of squared deviations per dimension.
    var_sum: Vec<f64>,
    count: u64,
    clip: f32,
}

impl RunningObsStandardizer {
    pub fn new(clip: f32) -> Self {
        Self {
            mean: Vec::new(),
            var_sum: Vec::new(),
            count: 0,
            clip,
        }
    }

    /// Observations folded into the statistics so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    fn update(&mut self, obs: &[f32]) -> Result<()> {
        if self.count == 0 {
            self.mean = vec![0.0; obs.len()];
            self.var_sum = vec![0.0; obs.len()];
        } else if obs.len() != self.mean.len() {
            bail!(
                "Observation has {} values, standardizer tracks {}",
                obs.len(),
                self.mean.len()
            );
        }
        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in obs.iter().enumerate() {
            let x = x as f64;
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            self.var_sum[i] += delta * (x - self.mean[i]);
        }
        Ok(())
    }

    fn std(&self, i: usize) -> f64 {
        let var = if self.count > 1 {
            self.var_sum[i] / self.count as f64
        } else {
            1.0
        };
        var.sqrt().max(EPSILON)
    }

    fn normalize(&self, obs: &[f32]) -> Observation {
        obs.iter()
            .enumerate()
            .map(|(i, &x)| {
                let z = ((x as f64 - self.mean[i]) / self.std(i)) as f32;
                z.clamp(-self.clip, self.clip)
            })
            .collect()
    }
}

impl Default for RunningObsStandardizer {
    fn default() -> Self {
        Self::new(5.0)
    }
}

impl ObsStandardizer for RunningObsStandardizer {
    fn standardize(
        &mut self,
        _agent_ids: &[&str],
        obs: &[&Observation],
    ) -> Result<Vec<Observation>> {
        for o in obs {
            self.update(o)?;
        }
        Ok(obs.iter().map(|o| self.normalize(o)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardizes_batch() {
        let mut standardizer = RunningObsStandardizer::default();
        let a = vec![1.0, 10.0];
        let b = vec![3.0, 10.0];
        let out = standardizer.standardize(&["x", "y"], &[&a, &b]).unwrap();

        assert_eq!(standardizer.count(), 2);
        assert_eq!(standardizer.mean(), &[2.0, 10.0]);
        assert!((out[0][0] + 1.0).abs() < 1e-6);
        assert!((out[1][0] - 1.0).abs() < 1e-6);
        assert_eq!(out[0][1], 0.0);
    }

    #[test]
    fn test_clips_outliers() {
        let mut standardizer = RunningObsStandardizer::new(1.5);
        let batch: Vec<Observation> = (0..20).map(|_| vec![0.0]).chain([vec![100.0]]).collect();
        let refs: Vec<&Observation> = batch.iter().collect();
        let out = standardizer.standardize(&vec!["a"; refs.len()], &refs).unwrap();
        assert_eq!(out[20], vec![1.5]);
    }

    #[test]
    fn test_rejects_dimension_change() {
        let mut standardizer = RunningObsStandardizer::default();
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert!(standardizer.standardize(&["a", "a"], &[&a, &b]).is_err());
    }
}
