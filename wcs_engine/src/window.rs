//! Rolling and contiguous window search over a banded contribution series.
//!
//! Both evaluators read from the same [`PrefixSums`], built once per
//! (series, band) pair, so every candidate window costs O(1).

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::WcsError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rolling,
    Contiguous,
}

impl WindowKind {
    /// Reporting order: rolling before contiguous.
    pub const ALL: [WindowKind; 2] = [WindowKind::Rolling, WindowKind::Contiguous];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Rolling => "rolling",
            WindowKind::Contiguous => "contiguous",
        }
    }
}

/// Running totals of the contribution series and of in-band sample counts.
#[derive(Clone, Debug)]
pub struct PrefixSums {
    sums: Array1<f64>,
    counts: Array1<usize>,
    sampling_rate: f64,
    tie_tolerance: f64,
}

/// Relative slack on window comparisons, in units of the largest running
/// total. Covers the rounding of two compensated prefix sums per window.
const TIE_ULPS: f64 = 16.0;

impl PrefixSums {
    /// `sums[0] = 0`, `sums[k] = sums[k - 1] + contributions[k - 1]`.
    ///
    /// Totals are accumulated with Neumaier compensation so that windows of
    /// equal exact sum stay within [`PrefixSums::tie_tolerance`] of each other.
    pub fn build(
        contributions: ArrayView1<'_, f64>,
        in_band: ArrayView1<'_, bool>,
        sampling_rate: f64,
    ) -> Self {
        debug_assert_eq!(contributions.len(), in_band.len());
        let n = contributions.len();
        let mut sums = Vec::with_capacity(n + 1);
        let mut counts = Vec::with_capacity(n + 1);
        let mut total = 0.0f64;
        let mut compensation = 0.0f64;
        let mut scale = 0.0f64;
        let mut count = 0usize;
        sums.push(total);
        counts.push(count);
        for (&c, &inside) in contributions.iter().zip(in_band.iter()) {
            let next = total + c;
            if total.abs() >= c.abs() {
                compensation += (total - next) + c;
            } else {
                compensation += (c - next) + total;
            }
            total = next;
            if inside {
                count += 1;
            }
            let corrected = total + compensation;
            scale = scale.max(corrected.abs());
            sums.push(corrected);
            counts.push(count);
        }
        Self {
            sums: Array1::from_vec(sums),
            counts: Array1::from_vec(counts),
            sampling_rate,
            tie_tolerance: scale * TIE_ULPS * f64::EPSILON,
        }
    }

    /// Window sums closer than this are treated as equal.
    pub fn tie_tolerance(&self) -> f64 {
        self.tie_tolerance
    }

    /// Whether `candidate` beats `best` by more than rounding noise.
    #[inline]
    fn improves(&self, candidate: f64, best: f64) -> bool {
        candidate > best + self.tie_tolerance
    }

    /// Number of samples in the underlying series.
    pub fn len(&self) -> usize {
        self.sums.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn total(&self) -> f64 {
        self.sums[self.len()]
    }

    pub fn in_band_total(&self) -> usize {
        self.counts[self.len()]
    }

    /// Sum of contributions over `[start, end)`.
    #[inline]
    pub fn range_sum(&self, start: usize, end: usize) -> f64 {
        self.sums[end] - self.sums[start]
    }

    #[inline]
    pub fn range_in_band(&self, start: usize, end: usize) -> usize {
        self.counts[end] - self.counts[start]
    }

    fn check_window(&self, window_samples: usize) -> Result<(), WcsError> {
        if window_samples == 0 {
            return Err(WcsError::InvalidParameter(
                "window must span at least one sample".into(),
            ));
        }
        if window_samples > self.len() {
            return Err(WcsError::DurationExceedsSeries {
                window_samples,
                series_len: self.len(),
            });
        }
        Ok(())
    }

    fn peak(
        &self,
        start: usize,
        window_samples: usize,
        sample_sum: f64,
        candidates: usize,
        trailing: Option<TrailingBlock>,
    ) -> WindowPeak {
        let end = start + window_samples;
        let rate = self.sampling_rate;
        let value = sample_sum / rate;
        let span_s = window_samples as f64 / rate;
        WindowPeak {
            value,
            sample_sum,
            mean_rate: value / span_s,
            time_in_band_s: self.range_in_band(start, end) as f64 / rate,
            start_index: start,
            end_index: end,
            start_s: start as f64 / rate,
            end_s: end as f64 / rate,
            candidates,
            trailing,
        }
    }
}

/// Best window of one kind for one (band, epoch) pair.
///
/// `value` is the banded distance in metres (`sample_sum / sampling_rate`)
/// and `mean_rate` is `value` over the window span in m/s. `end_index` is
/// exclusive.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowPeak {
    pub value: f64,
    pub sample_sum: f64,
    pub mean_rate: f64,
    pub time_in_band_s: f64,
    pub start_index: usize,
    pub end_index: usize,
    pub start_s: f64,
    pub end_s: f64,
    /// Number of windows that were compared.
    pub candidates: usize,
    /// Contiguous only: the leftover samples after the last complete block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing: Option<TrailingBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrailingBlock {
    pub start_index: usize,
    pub len: usize,
    pub sample_sum: f64,
}

pub fn evaluate(
    kind: WindowKind,
    prefix: &PrefixSums,
    window_samples: usize,
) -> Result<WindowPeak, WcsError> {
    match kind {
        WindowKind::Rolling => evaluate_rolling(prefix, window_samples),
        WindowKind::Contiguous => evaluate_contiguous(prefix, window_samples),
    }
}

/// Maximum window sum over every start offset in `[0, n - w]`. Ties, including
/// sums that differ only by rounding, keep the earliest start.
pub fn evaluate_rolling(prefix: &PrefixSums, window_samples: usize) -> Result<WindowPeak, WcsError> {
    prefix.check_window(window_samples)?;
    let n = prefix.len();
    let mut best_start = 0usize;
    let mut best_sum = prefix.range_sum(0, window_samples);
    let mut end = window_samples + 1;
    while end <= n {
        let start = end - window_samples;
        let sum = prefix.range_sum(start, end);
        if prefix.improves(sum, best_sum) {
            best_sum = sum;
            best_start = start;
        }
        end += 1;
    }
    Ok(prefix.peak(best_start, window_samples, best_sum, n - window_samples + 1, None))
}

/// Maximum over the blocks `[k * w, (k + 1) * w)`. A trailing partial block is
/// reported on the result but never competes. Ties keep the earliest block.
pub fn evaluate_contiguous(
    prefix: &PrefixSums,
    window_samples: usize,
) -> Result<WindowPeak, WcsError> {
    prefix.check_window(window_samples)?;
    let n = prefix.len();
    let blocks = n / window_samples;
    let mut best_start = 0usize;
    let mut best_sum = prefix.range_sum(0, window_samples);
    for block in 1..blocks {
        let start = block * window_samples;
        let sum = prefix.range_sum(start, start + window_samples);
        if prefix.improves(sum, best_sum) {
            best_sum = sum;
            best_start = start;
        }
    }
    let covered = blocks * window_samples;
    let trailing = (covered < n).then(|| TrailingBlock {
        start_index: covered,
        len: n - covered,
        sample_sum: prefix.range_sum(covered, n),
    });
    Ok(prefix.peak(best_start, window_samples, best_sum, blocks, trailing))
}

/// Sums of every complete contiguous block, in order.
pub fn block_sums(prefix: &PrefixSums, window_samples: usize) -> Result<Vec<f64>, WcsError> {
    prefix.check_window(window_samples)?;
    let blocks = prefix.len() / window_samples;
    Ok((0..blocks)
        .map(|k| prefix.range_sum(k * window_samples, (k + 1) * window_samples))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn prefix_of(values: &[f64], rate: f64) -> PrefixSums {
        let contributions = Array1::from_vec(values.to_vec());
        let mask = contributions.mapv(|v| v > 0.0);
        PrefixSums::build(contributions.view(), mask.view(), rate)
    }

    #[test]
    fn prefix_sums_accumulate() {
        let prefix = prefix_of(&[1.0, 2.0, 0.0, 4.0], 1.0);
        assert_eq!(prefix.len(), 4);
        assert_eq!(prefix.total(), 7.0);
        assert_eq!(prefix.in_band_total(), 3);
        assert_eq!(prefix.range_sum(1, 4), 6.0);
        assert_eq!(prefix.range_in_band(1, 3), 1);
    }

    #[test]
    fn rolling_finds_burst() {
        let prefix = prefix_of(&[0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 0.0], 1.0);
        let peak = evaluate_rolling(&prefix, 3).unwrap();
        assert_eq!(peak.value, 30.0);
        assert_eq!(peak.start_index, 2);
        assert_eq!(peak.end_index, 5);
        assert_eq!(peak.candidates, 5);
        assert_relative_eq!(peak.mean_rate, 10.0);
        assert_relative_eq!(peak.time_in_band_s, 3.0);
    }

    #[test]
    fn contiguous_reports_trailing_block() {
        let prefix = prefix_of(&[0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 0.0], 1.0);
        let peak = evaluate_contiguous(&prefix, 3).unwrap();
        assert_eq!(peak.value, 20.0);
        assert_eq!(peak.start_index, 3);
        assert_eq!(peak.candidates, 2);
        assert_eq!(
            peak.trailing,
            Some(TrailingBlock {
                start_index: 6,
                len: 1,
                sample_sum: 0.0
            })
        );
        assert_eq!(block_sums(&prefix, 3).unwrap(), vec![10.0, 20.0]);
    }

    #[test]
    fn ties_resolve_to_earliest_window() {
        let prefix = prefix_of(&[5.0, 5.0, 0.0, 5.0, 5.0, 0.0], 1.0);
        let rolling = evaluate_rolling(&prefix, 2).unwrap();
        assert_eq!(rolling.start_index, 0);
        let contiguous = evaluate_contiguous(&prefix, 3).unwrap();
        assert_eq!(contiguous.start_index, 0);
        assert_eq!(contiguous.trailing, None);

        let flat = prefix_of(&[0.0; 6], 1.0);
        assert_eq!(evaluate_rolling(&flat, 4).unwrap().start_index, 0);
        assert_eq!(evaluate_rolling(&flat, 4).unwrap().value, 0.0);
    }

    #[test]
    fn constant_plateau_keeps_earliest_start() {
        let prefix = prefix_of(&[3.47; 100], 1.0);
        let rolling = evaluate_rolling(&prefix, 10).unwrap();
        let contiguous = evaluate_contiguous(&prefix, 10).unwrap();
        assert_eq!(rolling.start_index, 0);
        assert_eq!(contiguous.start_index, 0);
        assert_relative_eq!(rolling.value, 34.7, epsilon = 1e-9);

        // one hour at 10 Hz, 30 s window
        let prefix = prefix_of(&vec![4.13; 36_000], 10.0);
        assert_eq!(evaluate_rolling(&prefix, 300).unwrap().start_index, 0);
        assert_eq!(evaluate_contiguous(&prefix, 300).unwrap().start_index, 0);
    }

    #[test]
    fn plateau_after_ramp_starts_at_plateau_edge() {
        let mut values = vec![0.0, 1.1, 2.2];
        values.extend(std::iter::repeat(5.3).take(50));
        let prefix = prefix_of(&values, 1.0);
        let rolling = evaluate_rolling(&prefix, 5).unwrap();
        assert_eq!(rolling.start_index, 3);
        assert!(prefix.tie_tolerance() > 0.0);
        assert!(prefix.tie_tolerance() < 1e-9);
    }

    #[test]
    fn values_scale_with_sampling_rate() {
        // 10 Hz: each sample covers 0.1 s
        let prefix = prefix_of(&[6.0; 20], 10.0);
        let peak = evaluate_rolling(&prefix, 10).unwrap();
        assert_relative_eq!(peak.sample_sum, 60.0);
        assert_relative_eq!(peak.value, 6.0);
        assert_relative_eq!(peak.mean_rate, 6.0);
        assert_relative_eq!(peak.time_in_band_s, 1.0);
        assert_relative_eq!(peak.end_s, 1.0);
    }

    #[test]
    fn oversized_window_is_reported() {
        let prefix = prefix_of(&[1.0; 5], 1.0);
        for kind in WindowKind::ALL {
            let err = evaluate(kind, &prefix, 10).unwrap_err();
            assert_eq!(
                err,
                WcsError::DurationExceedsSeries {
                    window_samples: 10,
                    series_len: 5
                }
            );
        }
        assert!(matches!(
            evaluate_rolling(&prefix, 0),
            Err(WcsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn exact_length_series_has_single_candidate() {
        let values = array![1.0, 3.0, 2.0];
        let mask = values.mapv(|_| true);
        let prefix = PrefixSums::build(values.view(), mask.view(), 1.0);
        let rolling = evaluate_rolling(&prefix, 3).unwrap();
        let contiguous = evaluate_contiguous(&prefix, 3).unwrap();
        assert_eq!(rolling.candidates, 1);
        assert_eq!(contiguous.candidates, 1);
        assert_eq!(rolling, contiguous);
    }
}
