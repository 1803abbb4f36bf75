use std::fmt;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::band::{self, IntensityBand};
use crate::kinematics::{self, KinematicSeries, KinematicStats};
use crate::preprocess::{self, CleanSeries};
use crate::window::{self, PrefixSums, WindowKind, WindowPeak};
use crate::{AnalysisConfig, SeriesFailure, SeriesMetadata, SignalGate, WcsError};

/// Why a (band, epoch, kind) combination has no peak.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DurationExceedsSeries {
        epoch_s: f64,
        window_samples: usize,
        series_len: usize,
    },
    InvalidBand {
        message: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DurationExceedsSeries {
                epoch_s,
                window_samples,
                series_len,
            } => write!(
                f,
                "epoch of {epoch_s} s ({window_samples} samples) exceeds series of {series_len} samples"
            ),
            SkipReason::InvalidBand { message } => f.write_str(message),
        }
    }
}

impl SkipReason {
    pub fn to_error(&self, band: &IntensityBand) -> WcsError {
        match self {
            SkipReason::DurationExceedsSeries {
                window_samples,
                series_len,
                ..
            } => WcsError::DurationExceedsSeries {
                window_samples: *window_samples,
                series_len: *series_len,
            },
            SkipReason::InvalidBand { .. } => WcsError::InvalidBand {
                name: band.name.clone(),
                lower: band.lower,
                upper: band.upper,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WindowOutcome {
    Evaluated(WindowPeak),
    Skipped(SkipReason),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowResult {
    pub band: IntensityBand,
    pub epoch_s: f64,
    pub window_samples: usize,
    pub kind: WindowKind,
    pub outcome: WindowOutcome,
}

impl WindowResult {
    pub fn peak(&self) -> Option<&WindowPeak> {
        match &self.outcome {
            WindowOutcome::Evaluated(peak) => Some(peak),
            WindowOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.outcome {
            WindowOutcome::Evaluated(_) => None,
            WindowOutcome::Skipped(reason) => Some(reason),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason().is_some()
    }
}

/// Whole-series velocity summary, computed before any gate is applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VelocityStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub sample_count: usize,
    pub duration_s: f64,
    pub total_distance_m: f64,
}

impl VelocityStats {
    pub fn compute(series: &CleanSeries, derived: &KinematicSeries) -> Self {
        let velocity = series.velocity().view();
        Self {
            min: kinematics::min_or_zero(velocity),
            max: kinematics::max_or_zero(velocity),
            mean: kinematics::mean_or_zero(velocity),
            std: kinematics::std_or_zero(velocity),
            sample_count: velocity.len(),
            duration_s: series.duration_s(),
            total_distance_m: derived.total_distance(),
        }
    }
}

/// How much of the (gated) series falls inside a valid band.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BandCoverage {
    pub band: IntensityBand,
    pub in_band_samples: usize,
    pub in_band_fraction: f64,
    pub time_in_band_s: f64,
    pub banded_distance_m: f64,
}

impl BandCoverage {
    fn from_prefix(band: &IntensityBand, prefix: &PrefixSums) -> Self {
        let rate = prefix.sampling_rate();
        let inside = prefix.in_band_total();
        Self {
            band: band.clone(),
            in_band_samples: inside,
            in_band_fraction: if prefix.is_empty() {
                0.0
            } else {
                inside as f64 / prefix.len() as f64
            },
            time_in_band_s: inside as f64 / rate,
            banded_distance_m: prefix.total() / rate,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GateReport {
    pub gate: SignalGate,
    pub zeroed_samples: usize,
    /// Percentage of moving (non-zero) samples that the gate zeroed.
    pub data_reduction_percent: f64,
}

/// Per (band, kind) roll-up across all epochs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KindSummary {
    pub band: String,
    pub kind: WindowKind,
    pub evaluated: usize,
    pub skipped: usize,
    pub max_value: f64,
    pub max_time_in_band_s: f64,
    pub mean_value: f64,
}

/// Output of one analysis. Read-only once built.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ResultSet {
    metadata: SeriesMetadata,
    config: AnalysisConfig,
    results: Vec<WindowResult>,
    velocity_stats: VelocityStats,
    kinematic_stats: KinematicStats,
    coverage: Vec<BandCoverage>,
    clipped_samples: usize,
    gate: Option<GateReport>,
    #[serde(skip)]
    series: CleanSeries,
    #[serde(skip)]
    kinematics: KinematicSeries,
}

impl ResultSet {
    pub fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Ordered by band declaration, ascending epoch, rolling before contiguous.
    pub fn results(&self) -> &[WindowResult] {
        &self.results
    }

    pub fn velocity_stats(&self) -> &VelocityStats {
        &self.velocity_stats
    }

    pub fn kinematic_stats(&self) -> &KinematicStats {
        &self.kinematic_stats
    }

    pub fn coverage(&self) -> &[BandCoverage] {
        &self.coverage
    }

    pub fn clipped_samples(&self) -> usize {
        self.clipped_samples
    }

    pub fn gate(&self) -> Option<&GateReport> {
        self.gate.as_ref()
    }

    pub fn series(&self) -> &CleanSeries {
        &self.series
    }

    pub fn kinematics(&self) -> &KinematicSeries {
        &self.kinematics
    }

    pub fn get(&self, band: &str, epoch_s: f64, kind: WindowKind) -> Option<&WindowResult> {
        self.results
            .iter()
            .find(|r| r.band.name == band && r.epoch_s == epoch_s && r.kind == kind)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &WindowResult> {
        self.results.iter().filter(|r| r.is_skipped())
    }

    pub fn evaluated_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_skipped()).count()
    }

    pub fn summary(&self) -> Vec<KindSummary> {
        let mut out = Vec::with_capacity(self.config.bands().len() * WindowKind::ALL.len());
        for band in self.config.bands() {
            for kind in WindowKind::ALL {
                let matching = self
                    .results
                    .iter()
                    .filter(|r| r.band.name == band.name && r.kind == kind);
                let mut evaluated = 0usize;
                let mut skipped = 0usize;
                let mut max_value = 0.0_f64;
                let mut max_time = 0.0_f64;
                let mut total = 0.0;
                for result in matching {
                    match result.peak() {
                        Some(peak) => {
                            evaluated += 1;
                            max_value = max_value.max(peak.value);
                            max_time = max_time.max(peak.time_in_band_s);
                            total += peak.value;
                        }
                        None => skipped += 1,
                    }
                }
                out.push(KindSummary {
                    band: band.name.clone(),
                    kind,
                    evaluated,
                    skipped,
                    max_value,
                    max_time_in_band_s: max_time,
                    mean_value: if evaluated > 0 {
                        total / evaluated as f64
                    } else {
                        0.0
                    },
                });
            }
        }
        out
    }
}

/// Zero the samples that fail the gate. Returns the signal to band and, for
/// an active gate, its report.
fn apply_gate(
    series: &CleanSeries,
    kinematics: &KinematicSeries,
    gate: &SignalGate,
) -> (Array1<f64>, Option<GateReport>) {
    let velocity = series.velocity();
    let gated = match gate {
        SignalGate::None => return (velocity.clone(), None),
        SignalGate::Velocity { threshold } => {
            velocity.mapv(|v| if v > *threshold { v } else { 0.0 })
        }
        SignalGate::Acceleration { threshold } => {
            let mut out = velocity.clone();
            for (v, a) in out.iter_mut().zip(kinematics.acceleration.iter()) {
                if a.abs() <= *threshold {
                    *v = 0.0;
                }
            }
            out
        }
    };
    let moving_before = velocity.iter().filter(|&&v| v > 0.0).count();
    let moving_after = gated.iter().filter(|&&v| v > 0.0).count();
    let zeroed = moving_before - moving_after;
    let report = GateReport {
        gate: gate.clone(),
        zeroed_samples: zeroed,
        data_reduction_percent: if moving_before == 0 {
            0.0
        } else {
            zeroed as f64 / moving_before as f64 * 100.0
        },
    };
    (gated, Some(report))
}

/// Run both evaluators for every (band, epoch) pair of `config` over an
/// already prepared series.
pub fn aggregate(series: CleanSeries, config: &AnalysisConfig) -> Result<ResultSet, WcsError> {
    aggregate_with_metadata(SeriesMetadata::default(), series, config)
}

pub fn aggregate_with_metadata(
    metadata: SeriesMetadata,
    series: CleanSeries,
    config: &AnalysisConfig,
) -> Result<ResultSet, WcsError> {
    let rate = config.sampling_rate();
    if (series.sampling_rate() - rate).abs() > f64::EPSILON * rate {
        return Err(WcsError::InvalidParameter(format!(
            "series is sampled at {} Hz but the configuration expects {} Hz",
            series.sampling_rate(),
            rate
        )));
    }

    // Bands are checked before any window is computed.
    let checks: Vec<Result<(), WcsError>> = config.bands().iter().map(|b| b.validate()).collect();
    if let Some(first) = checks.iter().find_map(|c| c.as_ref().err()) {
        if checks.iter().all(|c| c.is_err()) {
            return Err(first.clone());
        }
    }

    let kinematics = KinematicSeries::derive(series.velocity().view(), rate);
    let (signal, gate) = apply_gate(&series, &kinematics, config.gate());
    if let Some(report) = gate.as_ref() {
        debug!(
            zeroed = report.zeroed_samples,
            reduction_pct = report.data_reduction_percent,
            "signal gate applied"
        );
    }

    let epochs = config.epoch_durations();
    let mut results = Vec::with_capacity(config.bands().len() * epochs.len() * 2);
    let mut coverage = Vec::with_capacity(config.bands().len());
    let mut evaluated = 0usize;

    for (band, check) in config.bands().iter().zip(checks) {
        if let Err(err) = check {
            warn!(band = %band.name, error = %err, "skipping invalid intensity band");
            let reason = SkipReason::InvalidBand {
                message: err.to_string(),
            };
            for &epoch_s in epochs {
                for kind in WindowKind::ALL {
                    results.push(WindowResult {
                        band: band.clone(),
                        epoch_s,
                        window_samples: config.epoch_samples(epoch_s),
                        kind,
                        outcome: WindowOutcome::Skipped(reason.clone()),
                    });
                }
            }
            continue;
        }

        let contributions = band::apply(signal.view(), band)?;
        let mask = band::in_band_mask(signal.view(), band)?;
        let prefix = PrefixSums::build(contributions.view(), mask.view(), rate);
        coverage.push(BandCoverage::from_prefix(band, &prefix));

        for &epoch_s in epochs {
            let window_samples = config.epoch_samples(epoch_s);
            for kind in WindowKind::ALL {
                let outcome = match window::evaluate(kind, &prefix, window_samples) {
                    Ok(peak) => {
                        evaluated += 1;
                        WindowOutcome::Evaluated(peak)
                    }
                    Err(WcsError::DurationExceedsSeries {
                        window_samples,
                        series_len,
                    }) => {
                        debug!(
                            band = %band.name,
                            epoch_s,
                            kind = kind.as_str(),
                            window_samples,
                            series_len,
                            "epoch longer than series, skipped"
                        );
                        WindowOutcome::Skipped(SkipReason::DurationExceedsSeries {
                            epoch_s,
                            window_samples,
                            series_len,
                        })
                    }
                    Err(other) => return Err(other),
                };
                results.push(WindowResult {
                    band: band.clone(),
                    epoch_s,
                    window_samples,
                    kind,
                    outcome,
                });
            }
        }
    }

    if evaluated == 0 {
        return Err(WcsError::NoEvaluableEpochs);
    }

    let velocity_stats = VelocityStats::compute(&series, &kinematics);
    let kinematic_stats = kinematics.stats(series.duration_s());

    Ok(ResultSet {
        metadata,
        config: config.clone(),
        results,
        velocity_stats,
        kinematic_stats,
        coverage,
        clipped_samples: series.clipped_samples(),
        gate,
        series,
        kinematics,
    })
}

/// Preprocess `raw` and aggregate it in one call. The series must cover at
/// least the shortest configured epoch.
pub fn analyze(raw: &[f64], config: &AnalysisConfig) -> Result<ResultSet, WcsError> {
    analyze_with_metadata(SeriesMetadata::default(), raw, config)
}

pub fn analyze_with_metadata(
    metadata: SeriesMetadata,
    raw: &[f64],
    config: &AnalysisConfig,
) -> Result<ResultSet, WcsError> {
    let mut options = config.preprocess().clone();
    options.min_samples = options.min_samples.max(config.min_epoch_samples());
    let series = preprocess::prepare(raw, config.sampling_rate(), &options)?;
    aggregate_with_metadata(metadata, series, config)
}

/// [`analyze_with_metadata`] with the error labelled by the series it came from.
pub fn analyze_labeled(
    metadata: SeriesMetadata,
    raw: &[f64],
    config: &AnalysisConfig,
) -> Result<ResultSet, SeriesFailure> {
    let label = metadata.label();
    analyze_with_metadata(metadata, raw, config).map_err(|error| SeriesFailure { label, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessOptions;
    use approx::assert_relative_eq;

    fn config(rate: f64, epochs: Vec<f64>, bands: Vec<IntensityBand>) -> AnalysisConfig {
        AnalysisConfig::new(rate, epochs, bands).unwrap()
    }

    #[test]
    fn results_follow_band_epoch_kind_order() {
        let cfg = config(
            1.0,
            vec![3.0, 2.0],
            vec![
                IntensityBand::new("b", 5.0, 100.0),
                IntensityBand::new("a", 0.0, 100.0),
            ],
        );
        let rs = analyze(&[0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 0.0], &cfg).unwrap();
        let order: Vec<(&str, f64, WindowKind)> = rs
            .results()
            .iter()
            .map(|r| (r.band.name.as_str(), r.epoch_s, r.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("b", 2.0, WindowKind::Rolling),
                ("b", 2.0, WindowKind::Contiguous),
                ("b", 3.0, WindowKind::Rolling),
                ("b", 3.0, WindowKind::Contiguous),
                ("a", 2.0, WindowKind::Rolling),
                ("a", 2.0, WindowKind::Contiguous),
                ("a", 3.0, WindowKind::Rolling),
                ("a", 3.0, WindowKind::Contiguous),
            ]
        );
    }

    #[test]
    fn velocity_stats_describe_whole_series() {
        let cfg = config(2.0, vec![1.0], vec![IntensityBand::new("all", 0.0, 100.0)]);
        let rs = analyze(&[2.0, 4.0, 4.0, 2.0], &cfg).unwrap();
        let stats = rs.velocity_stats();
        assert_eq!(stats.sample_count, 4);
        assert_relative_eq!(stats.mean, 3.0);
        assert_relative_eq!(stats.min, 2.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.std, 1.0);
        assert_relative_eq!(stats.duration_s, 2.0);
        assert_relative_eq!(stats.total_distance_m, 5.0);
    }

    #[test]
    fn mismatched_sampling_rate_is_rejected() {
        let series = preprocess::prepare(&[1.0; 20], 10.0, &PreprocessOptions::default()).unwrap();
        let cfg = config(1.0, vec![5.0], vec![IntensityBand::new("all", 0.0, 100.0)]);
        assert!(matches!(
            aggregate(series, &cfg),
            Err(WcsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn invalid_band_only_disqualifies_itself() {
        let cfg = config(
            1.0,
            vec![2.0],
            vec![
                IntensityBand::new("inverted", 100.0, 50.0),
                IntensityBand::new("hsr", 5.0, 100.0),
            ],
        );
        let rs = analyze(&[0.0, 6.0, 6.0, 0.0], &cfg).unwrap();
        let inverted: Vec<_> = rs
            .results()
            .iter()
            .filter(|r| r.band.name == "inverted")
            .collect();
        assert_eq!(inverted.len(), 2);
        assert!(inverted
            .iter()
            .all(|r| matches!(r.skip_reason(), Some(SkipReason::InvalidBand { .. }))));
        let hsr = rs.get("hsr", 2.0, WindowKind::Rolling).unwrap();
        assert_relative_eq!(hsr.peak().unwrap().value, 12.0);
        assert_eq!(rs.coverage().len(), 1);
        assert_eq!(
            rs.skipped().next().unwrap().skip_reason().unwrap().to_error(&cfg.bands()[0]),
            WcsError::InvalidBand {
                name: "inverted".into(),
                lower: 100.0,
                upper: 50.0
            }
        );
    }

    #[test]
    fn prepared_series_too_short_for_every_epoch() {
        let series = preprocess::prepare(&[1.0; 4], 1.0, &PreprocessOptions::default()).unwrap();
        let cfg = config(1.0, vec![5.0, 10.0], vec![IntensityBand::new("all", 0.0, 100.0)]);
        assert_eq!(aggregate(series, &cfg), Err(WcsError::NoEvaluableEpochs));
    }

    #[test]
    fn velocity_gate_zeroes_slow_samples() {
        let cfg = config(1.0, vec![2.0], vec![IntensityBand::new("all", 0.0, 100.0)])
            .with_gate(SignalGate::Velocity { threshold: 5.0 })
            .unwrap();
        let rs = analyze(&[2.0, 6.0, 7.0, 3.0], &cfg).unwrap();
        let gate = rs.gate().unwrap();
        assert_eq!(gate.zeroed_samples, 2);
        assert_relative_eq!(gate.data_reduction_percent, 50.0);
        let peak = rs.get("all", 2.0, WindowKind::Rolling).unwrap().peak().unwrap();
        assert_relative_eq!(peak.value, 13.0);
        // stats are taken before gating
        assert_relative_eq!(rs.velocity_stats().min, 2.0);
    }

    #[test]
    fn acceleration_gate_keeps_changing_samples() {
        let cfg = config(1.0, vec![1.0], vec![IntensityBand::new("all", 0.0, 100.0)])
            .with_gate(SignalGate::Acceleration { threshold: 0.5 })
            .unwrap();
        // accelerations: [0, 0, 1.5, 1.5, 0]
        let rs = analyze(&[4.0, 4.0, 4.0, 7.0, 7.0], &cfg).unwrap();
        let gate = rs.gate().unwrap();
        assert_eq!(gate.zeroed_samples, 3);
        let peak = rs.get("all", 1.0, WindowKind::Rolling).unwrap().peak().unwrap();
        assert_relative_eq!(peak.value, 7.0);
        assert_eq!(peak.start_index, 3);
    }

    #[test]
    fn summary_rolls_up_per_band_and_kind() {
        let cfg = config(1.0, vec![2.0, 3.0, 10.0], vec![IntensityBand::new("hsr", 5.0, 100.0)]);
        let rs = analyze(&[0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 0.0], &cfg).unwrap();
        let summary = rs.summary();
        assert_eq!(summary.len(), 2);
        let rolling = &summary[0];
        assert_eq!(rolling.kind, WindowKind::Rolling);
        assert_eq!(rolling.evaluated, 2);
        assert_eq!(rolling.skipped, 1);
        assert_relative_eq!(rolling.max_value, 30.0);
        assert_relative_eq!(rolling.mean_value, 25.0);
        assert_relative_eq!(rolling.max_time_in_band_s, 3.0);
        let contiguous = &summary[1];
        assert_eq!(contiguous.kind, WindowKind::Contiguous);
        assert_relative_eq!(contiguous.max_value, 20.0);
    }

    #[test]
    fn labeled_failure_names_the_series() {
        let cfg = AnalysisConfig::default();
        let meta = SeriesMetadata::new("match.csv", Some("player-3".into()));
        let err = analyze_labeled(meta, &[1.0, -2.0], &cfg).unwrap_err();
        assert_eq!(err.label, "player-3 (match.csv)");
        assert!(matches!(err.error, WcsError::InvalidSeries(_)));
    }
}
