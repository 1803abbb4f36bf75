use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{samples_for, Sample, WcsError};

/// Plausibility ceiling for human running speed (m/s).
pub const DEFAULT_VELOCITY_CEILING_MPS: f64 = 20.0;

/// Allowed deviation of a timestamp step, as a fraction of the sample interval.
const INTERVAL_TOLERANCE: f64 = 1e-3;

/// Preprocessing policy.
///
/// Samples above `velocity_ceiling` are replaced by the ceiling and counted in
/// [`CleanSeries::clipped_samples`]; `None` keeps every finite, non-negative
/// value as supplied. A series shorter than `min_samples` is rejected.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessOptions {
    pub velocity_ceiling: Option<f64>,
    pub min_samples: usize,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            velocity_ceiling: Some(DEFAULT_VELOCITY_CEILING_MPS),
            min_samples: 1,
        }
    }
}

impl PreprocessOptions {
    pub(crate) fn validate(&self) -> Result<(), WcsError> {
        match self.velocity_ceiling {
            Some(c) if !c.is_finite() || c <= 0.0 => Err(WcsError::InvalidParameter(format!(
                "velocity ceiling must be positive, got {}",
                c
            ))),
            _ => Ok(()),
        }
    }
}

/// Validated velocity series at a fixed sampling rate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CleanSeries {
    velocity: Array1<f64>,
    sampling_rate: f64,
    clipped_samples: usize,
    velocity_ceiling: Option<f64>,
}

impl CleanSeries {
    pub fn velocity(&self) -> &Array1<f64> {
        &self.velocity
    }

    pub fn len(&self) -> usize {
        self.velocity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.velocity.is_empty()
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn sample_interval_s(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    pub fn duration_s(&self) -> f64 {
        self.len() as f64 / self.sampling_rate
    }

    /// Number of samples replaced by the velocity ceiling.
    pub fn clipped_samples(&self) -> usize {
        self.clipped_samples
    }

    pub fn velocity_ceiling(&self) -> Option<f64> {
        self.velocity_ceiling
    }

    pub fn samples_for(&self, epoch_s: f64) -> usize {
        samples_for(epoch_s, self.sampling_rate)
    }
}

fn check_rate(sampling_rate: f64) -> Result<(), WcsError> {
    if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
        return Err(WcsError::InvalidSeries(format!(
            "sampling rate must be positive, got {}",
            sampling_rate
        )));
    }
    Ok(())
}

/// Validate a raw velocity slice and copy it into a [`CleanSeries`].
pub fn prepare(
    raw: &[f64],
    sampling_rate: f64,
    options: &PreprocessOptions,
) -> Result<CleanSeries, WcsError> {
    check_rate(sampling_rate)?;
    options.validate()?;
    if raw.is_empty() {
        return Err(WcsError::InvalidSeries("series is empty".into()));
    }
    let min_samples = options.min_samples.max(1);
    if raw.len() < min_samples {
        return Err(WcsError::InvalidSeries(format!(
            "series has {} samples but the shortest epoch needs {}",
            raw.len(),
            min_samples
        )));
    }

    let mut clipped = 0usize;
    let mut velocity = Vec::with_capacity(raw.len());
    for (idx, &v) in raw.iter().enumerate() {
        if !v.is_finite() {
            return Err(WcsError::InvalidSeries(format!(
                "non-finite velocity at sample {}",
                idx
            )));
        }
        if v < 0.0 {
            return Err(WcsError::InvalidSeries(format!(
                "negative velocity {} at sample {}",
                v, idx
            )));
        }
        match options.velocity_ceiling {
            Some(ceiling) if v > ceiling => {
                clipped += 1;
                velocity.push(ceiling);
            }
            _ => velocity.push(v),
        }
    }

    if clipped > 0 {
        warn!(
            clipped,
            ceiling = options.velocity_ceiling.unwrap_or_default(),
            "clipped velocity samples above the plausibility ceiling"
        );
    }

    Ok(CleanSeries {
        velocity: Array1::from_vec(velocity),
        sampling_rate,
        clipped_samples: clipped,
        velocity_ceiling: options.velocity_ceiling,
    })
}

/// Like [`prepare`], but first checks that timestamps advance by exactly one
/// sample interval.
pub fn prepare_samples(
    samples: &[Sample],
    sampling_rate: f64,
    options: &PreprocessOptions,
) -> Result<CleanSeries, WcsError> {
    check_rate(sampling_rate)?;
    let interval = 1.0 / sampling_rate;
    let tolerance = interval * INTERVAL_TOLERANCE;
    for (idx, pair) in samples.windows(2).enumerate() {
        let step = pair[1].timestamp_s - pair[0].timestamp_s;
        if !step.is_finite() || (step - interval).abs() > tolerance {
            return Err(WcsError::InvalidSeries(format!(
                "irregular sampling at sample {}: step {:.6} s, expected {:.6} s",
                idx + 1,
                step,
                interval
            )));
        }
    }
    let velocity: Vec<f64> = samples.iter().map(|s| s.velocity).collect();
    prepare(&velocity, sampling_rate, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_copies_clean_input() {
        let raw = vec![0.0, 1.5, 3.0, 4.5];
        let series = prepare(&raw, 10.0, &PreprocessOptions::default()).unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series.velocity().to_vec(), raw);
        assert_eq!(series.clipped_samples(), 0);
        assert!((series.duration_s() - 0.4).abs() < 1e-12);
        assert_eq!(series.samples_for(0.25), 3);
    }

    #[test]
    fn prepare_rejects_malformed_series() {
        let opts = PreprocessOptions::default();
        assert!(matches!(prepare(&[], 10.0, &opts), Err(WcsError::InvalidSeries(_))));
        assert!(matches!(
            prepare(&[1.0, -0.1], 10.0, &opts),
            Err(WcsError::InvalidSeries(_))
        ));
        assert!(matches!(
            prepare(&[1.0, f64::NAN], 10.0, &opts),
            Err(WcsError::InvalidSeries(_))
        ));
        assert!(matches!(
            prepare(&[1.0, f64::INFINITY], 10.0, &opts),
            Err(WcsError::InvalidSeries(_))
        ));
        assert!(matches!(
            prepare(&[1.0, 2.0], 0.0, &opts),
            Err(WcsError::InvalidSeries(_))
        ));
    }

    #[test]
    fn prepare_enforces_minimum_length() {
        let opts = PreprocessOptions {
            min_samples: 5,
            ..PreprocessOptions::default()
        };
        assert!(matches!(
            prepare(&[1.0; 4], 1.0, &opts),
            Err(WcsError::InvalidSeries(_))
        ));
        assert!(prepare(&[1.0; 5], 1.0, &opts).is_ok());
    }

    #[test]
    fn spikes_are_clipped_and_counted() {
        let raw = [3.0, 45.0, 4.0, 21.0];
        let series = prepare(&raw, 10.0, &PreprocessOptions::default()).unwrap();
        assert_eq!(series.velocity().to_vec(), vec![3.0, 20.0, 4.0, 20.0]);
        assert_eq!(series.clipped_samples(), 2);
        // caller's buffer is untouched
        assert_eq!(raw[1], 45.0);

        let unclipped = PreprocessOptions {
            velocity_ceiling: None,
            ..PreprocessOptions::default()
        };
        let series = prepare(&raw, 10.0, &unclipped).unwrap();
        assert_eq!(series.clipped_samples(), 0);
        assert_eq!(series.velocity()[1], 45.0);
    }

    #[test]
    fn prepare_samples_checks_spacing() {
        let regular: Vec<Sample> = (0..6).map(|i| Sample::new(i as f64 * 0.1, 2.0)).collect();
        let series = prepare_samples(&regular, 10.0, &PreprocessOptions::default()).unwrap();
        assert_eq!(series.len(), 6);

        let mut irregular = regular.clone();
        irregular[3].timestamp_s = 0.35;
        assert!(matches!(
            prepare_samples(&irregular, 10.0, &PreprocessOptions::default()),
            Err(WcsError::InvalidSeries(_))
        ));

        let mut reversed = regular;
        reversed.swap(1, 2);
        assert!(prepare_samples(&reversed, 10.0, &PreprocessOptions::default()).is_err());
    }
}
