//! Kinematic channels derived from a velocity series: acceleration,
//! deceleration, cumulative distance, power and jerk, plus their summary
//! statistics.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Finite-difference derivative: forward at the first sample, central inside,
/// backward at the last. Series shorter than two samples yield zeros.
pub fn acceleration(velocity: ArrayView1<'_, f64>, sampling_rate: f64) -> Array1<f64> {
    let n = velocity.len();
    if n < 2 {
        return Array1::zeros(n);
    }
    let dt = 1.0 / sampling_rate;
    let mut out = Array1::zeros(n);
    out[0] = (velocity[1] - velocity[0]) / dt;
    for i in 1..n - 1 {
        out[i] = (velocity[i + 1] - velocity[i - 1]) / (2.0 * dt);
    }
    out[n - 1] = (velocity[n - 1] - velocity[n - 2]) / dt;
    out
}

/// Trapezoidal running distance, starting at 0 m.
pub fn cumulative_distance(velocity: ArrayView1<'_, f64>, sampling_rate: f64) -> Array1<f64> {
    let dt = 1.0 / sampling_rate;
    let mut out = Vec::with_capacity(velocity.len());
    let mut total = 0.0;
    let mut prev: Option<f64> = None;
    for &v in velocity.iter() {
        if let Some(p) = prev {
            total += (v + p) / 2.0 * dt;
        }
        out.push(total);
        prev = Some(v);
    }
    Array1::from_vec(out)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KinematicSeries {
    pub acceleration: Array1<f64>,
    /// `max(-acceleration, 0)`
    pub deceleration: Array1<f64>,
    pub distance: Array1<f64>,
    /// `|acceleration| * velocity`, unit mass.
    pub power: Array1<f64>,
    pub jerk: Array1<f64>,
}

impl KinematicSeries {
    pub fn derive(velocity: ArrayView1<'_, f64>, sampling_rate: f64) -> Self {
        let acceleration = acceleration(velocity, sampling_rate);
        let deceleration = acceleration.mapv(|a| if a < 0.0 { -a } else { 0.0 });
        let distance = cumulative_distance(velocity, sampling_rate);
        let power = &acceleration.mapv(f64::abs) * &velocity;
        let jerk = if acceleration.len() > 2 {
            self::acceleration(acceleration.view(), sampling_rate)
        } else {
            Array1::zeros(acceleration.len())
        };
        Self {
            acceleration,
            deceleration,
            distance,
            power,
            jerk,
        }
    }

    pub fn total_distance(&self) -> f64 {
        self.distance.last().copied().unwrap_or(0.0)
    }

    pub fn stats(&self, duration_s: f64) -> KinematicStats {
        let positive = subset(self.acceleration.view(), |a| a > 0.0);
        let negative = subset(self.acceleration.view(), |a| a < 0.0);
        let braking = subset(self.deceleration.view(), |d| d > 0.0);
        let total = self.total_distance();

        KinematicStats {
            acceleration: AccelerationStats {
                mean_positive: mean_or_zero(positive.view()),
                mean_negative: mean_or_zero(negative.view()),
                mean: mean_or_zero(self.acceleration.view()),
                min: min_or_zero(self.acceleration.view()),
                max: max_or_zero(self.acceleration.view()),
                std: std_or_zero(self.acceleration.view()),
                positive_count: positive.len(),
                negative_count: negative.len(),
            },
            deceleration: DecelerationStats {
                mean: mean_or_zero(braking.view()),
                max: max_or_zero(self.deceleration.view()),
                std: std_or_zero(braking.view()),
                count: braking.len(),
            },
            distance: DistanceStats {
                total_m: total,
                mean_rate_mps: if duration_s > 0.0 { total / duration_s } else { 0.0 },
            },
            power: PowerStats {
                mean: mean_or_zero(self.power.view()),
                min: min_or_zero(self.power.view()),
                max: max_or_zero(self.power.view()),
                std: std_or_zero(self.power.view()),
            },
        }
    }
}

fn subset(values: ArrayView1<'_, f64>, keep: impl Fn(f64) -> bool) -> Array1<f64> {
    values.iter().copied().filter(|&v| keep(v)).collect()
}

// Empty channels summarise to zero rather than NaN or infinities.

pub(crate) fn mean_or_zero(values: ArrayView1<'_, f64>) -> f64 {
    values.mean().unwrap_or(0.0)
}

/// Population standard deviation.
pub(crate) fn std_or_zero(values: ArrayView1<'_, f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.std(0.0)
    }
}

pub(crate) fn min_or_zero(values: ArrayView1<'_, f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.fold(f64::INFINITY, |m, &v| m.min(v))
    }
}

pub(crate) fn max_or_zero(values: ArrayView1<'_, f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.fold(f64::NEG_INFINITY, |m, &v| m.max(v))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AccelerationStats {
    pub mean_positive: f64,
    pub mean_negative: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub positive_count: usize,
    pub negative_count: usize,
}

/// Mean and spread are taken over braking samples only.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DecelerationStats {
    pub mean: f64,
    pub max: f64,
    pub std: f64,
    pub count: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DistanceStats {
    pub total_m: f64,
    pub mean_rate_mps: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PowerStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct KinematicStats {
    pub acceleration: AccelerationStats,
    pub deceleration: DecelerationStats,
    pub distance: DistanceStats,
    pub power: PowerStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn acceleration_uses_edge_and_central_differences() {
        let v = array![0.0, 1.0, 3.0, 6.0];
        let a = acceleration(v.view(), 1.0);
        assert_eq!(a, array![1.0, 1.5, 2.5, 3.0]);

        let a = acceleration(v.view(), 10.0);
        assert_relative_eq!(a[0], 10.0);
        assert_relative_eq!(a[1], 15.0);

        assert_eq!(acceleration(array![4.0].view(), 10.0), array![0.0]);
        assert!(acceleration(Array1::<f64>::zeros(0).view(), 10.0).is_empty());
    }

    #[test]
    fn distance_is_trapezoidal() {
        let v = array![0.0, 2.0, 2.0, 4.0];
        let d = cumulative_distance(v.view(), 2.0);
        assert_eq!(d, array![0.0, 0.5, 1.5, 3.0]);
    }

    #[test]
    fn derived_channels_and_stats() {
        let v = array![2.0, 4.0, 4.0, 2.0, 2.0];
        let k = KinematicSeries::derive(v.view(), 1.0);
        assert_eq!(k.acceleration, array![2.0, 1.0, -1.0, -1.0, 0.0]);
        assert_eq!(k.deceleration, array![0.0, 0.0, 1.0, 1.0, 0.0]);
        assert_eq!(k.power, array![4.0, 4.0, 4.0, 2.0, 0.0]);
        assert_eq!(k.jerk.len(), 5);
        assert_relative_eq!(k.total_distance(), 12.0);

        let stats = k.stats(5.0);
        assert_eq!(stats.acceleration.positive_count, 2);
        assert_eq!(stats.acceleration.negative_count, 2);
        assert_relative_eq!(stats.acceleration.mean_positive, 1.5);
        assert_relative_eq!(stats.acceleration.mean_negative, -1.0);
        assert_relative_eq!(stats.acceleration.max, 2.0);
        assert_relative_eq!(stats.acceleration.min, -1.0);
        assert_eq!(stats.deceleration.count, 2);
        assert_relative_eq!(stats.deceleration.mean, 1.0);
        assert_relative_eq!(stats.deceleration.std, 0.0);
        assert_relative_eq!(stats.distance.mean_rate_mps, 12.0 / 5.0);
        assert_relative_eq!(stats.power.max, 4.0);
        assert_relative_eq!(stats.power.min, 0.0);
    }

    #[test]
    fn empty_channels_summarise_to_zero() {
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(mean_or_zero(empty.view()), 0.0);
        assert_eq!(std_or_zero(empty.view()), 0.0);
        assert_eq!(min_or_zero(empty.view()), 0.0);
        assert_eq!(max_or_zero(empty.view()), 0.0);

        let pair = array![1.0, 3.0];
        assert_relative_eq!(mean_or_zero(pair.view()), 2.0);
        assert_relative_eq!(std_or_zero(pair.view()), 1.0);

        let flat = KinematicSeries::derive(array![2.0, 2.0, 2.0].view(), 1.0);
        let stats = flat.stats(3.0);
        assert_eq!(stats.acceleration.positive_count, 0);
        assert_eq!(stats.acceleration.mean_positive, 0.0);
        assert_eq!(stats.deceleration, DecelerationStats::default());
    }
}
