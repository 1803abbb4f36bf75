//! Worst-case-scenario (WCS) epoch analysis for GPS-derived velocity series.
//!
//! The engine takes a uniformly sampled velocity series, a catalogue of epoch
//! durations and a list of named intensity bands, and locates the most
//! demanding window for every (band, duration) pair under two window
//! definitions: rolling (every start offset) and contiguous (fixed
//! non-overlapping blocks).

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod band;
pub mod kinematics;
pub mod preprocess;
pub mod window;

pub use aggregate::{
    aggregate, aggregate_with_metadata, analyze, analyze_labeled, analyze_with_metadata,
    BandCoverage, GateReport, KindSummary, ResultSet, SkipReason, VelocityStats, WindowOutcome,
    WindowResult,
};
pub use band::IntensityBand;
pub use kinematics::{KinematicSeries, KinematicStats};
pub use preprocess::{prepare, prepare_samples, CleanSeries, PreprocessOptions};
pub use window::{
    evaluate_contiguous, evaluate_rolling, PrefixSums, TrailingBlock, WindowKind, WindowPeak,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WcsError {
    #[error("invalid series: {0}")]
    InvalidSeries(String),
    #[error("invalid band '{name}': lower {lower}, upper {upper}")]
    InvalidBand { name: String, lower: f64, upper: f64 },
    #[error("window of {window_samples} samples exceeds series of {series_len} samples")]
    DurationExceedsSeries {
        window_samples: usize,
        series_len: usize,
    },
    #[error("no epoch duration could be evaluated for any band")]
    NoEvaluableEpochs,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// A per-series failure labelled with the series it belongs to, so a batch
/// caller can report it and move on to the next input.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{label}: {error}")]
pub struct SeriesFailure {
    pub label: String,
    #[source]
    pub error: WcsError,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp_s: f64,
    pub velocity: f64,
}

impl Sample {
    pub fn new(timestamp_s: f64, velocity: f64) -> Self {
        Self {
            timestamp_s,
            velocity,
        }
    }
}

/// Provenance supplied by the ingestion side; carried through untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesMetadata {
    pub source: String,
    pub subject: Option<String>,
}

impl SeriesMetadata {
    pub fn new(source: impl Into<String>, subject: Option<String>) -> Self {
        Self {
            source: source.into(),
            subject,
        }
    }

    pub fn label(&self) -> String {
        match (&self.subject, self.source.is_empty()) {
            (Some(subject), true) => subject.clone(),
            (Some(subject), false) => format!("{} ({})", subject, self.source),
            (None, false) => self.source.clone(),
            (None, true) => "<unnamed series>".to_string(),
        }
    }
}

/// Optional pre-filter applied to the clean series before banding. Samples
/// failing the gate are zeroed, not removed, so indices stay aligned.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalGate {
    #[default]
    None,
    /// Keep samples whose velocity is strictly above `threshold` (m/s).
    Velocity { threshold: f64 },
    /// Keep samples whose absolute acceleration is strictly above `threshold` (m/s²).
    Acceleration { threshold: f64 },
}

impl SignalGate {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SignalGate::None)
    }

    pub fn threshold(&self) -> Option<f64> {
        match self {
            SignalGate::None => None,
            SignalGate::Velocity { threshold } | SignalGate::Acceleration { threshold } => {
                Some(*threshold)
            }
        }
    }

    fn validate(&self) -> Result<(), WcsError> {
        match self.threshold() {
            Some(t) if !t.is_finite() || t < 0.0 => Err(WcsError::InvalidParameter(format!(
                "gate threshold must be a non-negative number, got {}",
                t
            ))),
            _ => Ok(()),
        }
    }
}

pub const DEFAULT_SAMPLING_RATE_HZ: f64 = 10.0;
pub const DEFAULT_EPOCHS_S: [f64; 3] = [30.0, 60.0, 90.0];

/// Immutable analysis parameters. Construct through [`AnalysisConfig::new`]
/// (or deserialize, which runs the same validation).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "ConfigFile")]
pub struct AnalysisConfig {
    sampling_rate: f64,
    epoch_durations: Vec<f64>,
    bands: Vec<IntensityBand>,
    preprocess: PreprocessOptions,
    gate: SignalGate,
}

impl AnalysisConfig {
    /// Durations are sorted ascending and de-duplicated. Band bounds are not
    /// checked here: a malformed band only disqualifies itself during
    /// aggregation.
    pub fn new(
        sampling_rate: f64,
        epoch_durations: impl IntoIterator<Item = f64>,
        bands: Vec<IntensityBand>,
    ) -> Result<Self, WcsError> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(WcsError::InvalidParameter(format!(
                "sampling rate must be positive, got {}",
                sampling_rate
            )));
        }
        let epoch_durations = normalize_durations(epoch_durations, sampling_rate)?;
        if bands.is_empty() {
            return Err(WcsError::InvalidParameter(
                "at least one intensity band is required".into(),
            ));
        }
        let mut names = BTreeSet::new();
        for band in &bands {
            if !names.insert(band.name.as_str()) {
                return Err(WcsError::InvalidParameter(format!(
                    "duplicate band name '{}'",
                    band.name
                )));
            }
        }
        Ok(Self {
            sampling_rate,
            epoch_durations,
            bands,
            preprocess: PreprocessOptions::default(),
            gate: SignalGate::None,
        })
    }

    pub fn with_preprocess(mut self, preprocess: PreprocessOptions) -> Result<Self, WcsError> {
        preprocess.validate()?;
        self.preprocess = preprocess;
        Ok(self)
    }

    pub fn with_gate(mut self, gate: SignalGate) -> Result<Self, WcsError> {
        gate.validate()?;
        self.gate = gate;
        Ok(self)
    }

    pub fn from_json_str(text: &str) -> Result<Self, WcsError> {
        serde_json::from_str(text).map_err(|e| WcsError::InvalidParameter(e.to_string()))
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn epoch_durations(&self) -> &[f64] {
        &self.epoch_durations
    }

    pub fn bands(&self) -> &[IntensityBand] {
        &self.bands
    }

    pub fn preprocess(&self) -> &PreprocessOptions {
        &self.preprocess
    }

    pub fn gate(&self) -> &SignalGate {
        &self.gate
    }

    /// Window length in samples for an epoch, `round(epoch_s * rate)`.
    pub fn epoch_samples(&self, epoch_s: f64) -> usize {
        samples_for(epoch_s, self.sampling_rate)
    }

    pub fn min_epoch_samples(&self) -> usize {
        self.epoch_durations
            .first()
            .map(|&d| self.epoch_samples(d))
            .unwrap_or(1)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sampling_rate: DEFAULT_SAMPLING_RATE_HZ,
            epoch_durations: DEFAULT_EPOCHS_S.to_vec(),
            bands: vec![
                IntensityBand::new("th0", 0.0, 100.0),
                IntensityBand::new("th1", 5.0, 100.0),
            ],
            preprocess: PreprocessOptions::default(),
            gate: SignalGate::None,
        }
    }
}

/// On-disk mirror of [`AnalysisConfig`]; missing keys fall back to defaults.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    sampling_rate: f64,
    epoch_durations: Vec<f64>,
    bands: Vec<IntensityBand>,
    preprocess: PreprocessOptions,
    gate: SignalGate,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let base = AnalysisConfig::default();
        Self {
            sampling_rate: base.sampling_rate,
            epoch_durations: base.epoch_durations,
            bands: base.bands,
            preprocess: base.preprocess,
            gate: base.gate,
        }
    }
}

impl TryFrom<ConfigFile> for AnalysisConfig {
    type Error = WcsError;

    fn try_from(raw: ConfigFile) -> Result<Self, Self::Error> {
        AnalysisConfig::new(raw.sampling_rate, raw.epoch_durations, raw.bands)?
            .with_preprocess(raw.preprocess)?
            .with_gate(raw.gate)
    }
}

pub(crate) fn samples_for(epoch_s: f64, sampling_rate: f64) -> usize {
    (epoch_s * sampling_rate).round() as usize
}

fn normalize_durations(
    durations: impl IntoIterator<Item = f64>,
    sampling_rate: f64,
) -> Result<Vec<f64>, WcsError> {
    let mut set = BTreeSet::new();
    for duration in durations {
        if !duration.is_finite() || duration <= 0.0 {
            return Err(WcsError::InvalidParameter(format!(
                "epoch durations must be positive seconds, got {}",
                duration
            )));
        }
        if samples_for(duration, sampling_rate) == 0 {
            return Err(WcsError::InvalidParameter(format!(
                "epoch of {} s is shorter than one sample at {} Hz",
                duration, sampling_rate
            )));
        }
        set.insert(OrderedFloat(duration));
    }
    if set.is_empty() {
        return Err(WcsError::InvalidParameter(
            "at least one epoch duration is required".into(),
        ));
    }
    Ok(set.into_iter().map(OrderedFloat::into_inner).collect())
}

/// Parse a duration token such as `90`, `90s`, `1.5m`, `2min` or `0.5h` into seconds.
pub fn parse_duration_token(token: &str) -> Option<f64> {
    let lowered = token.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let (number, scale) = if let Some(v) = lowered.strip_suffix("min") {
        (v, 60.0)
    } else if let Some(v) = lowered.strip_suffix('h') {
        (v, 3600.0)
    } else if let Some(v) = lowered.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = lowered.strip_suffix('s') {
        (v, 1.0)
    } else {
        (lowered.as_str(), 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if value.is_finite() {
        Some(value * scale)
    } else {
        None
    }
}
