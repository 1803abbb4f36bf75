use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::WcsError;

/// Named inclusive velocity range (m/s) whose samples count toward a WCS metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntensityBand {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
}

impl IntensityBand {
    pub fn new(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
        }
    }

    pub fn validate(&self) -> Result<(), WcsError> {
        let finite = self.lower.is_finite() && self.upper.is_finite();
        if !finite || self.lower < 0.0 || self.lower > self.upper {
            return Err(WcsError::InvalidBand {
                name: self.name.clone(),
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, velocity: f64) -> bool {
        velocity >= self.lower && velocity <= self.upper
    }
}

/// Contribution series: each sample keeps its value inside the band, else 0.
pub fn apply(series: ArrayView1<'_, f64>, band: &IntensityBand) -> Result<Array1<f64>, WcsError> {
    band.validate()?;
    Ok(series.mapv(|v| if band.contains(v) { v } else { 0.0 }))
}

pub fn in_band_mask(
    series: ArrayView1<'_, f64>,
    band: &IntensityBand,
) -> Result<Array1<bool>, WcsError> {
    band.validate()?;
    Ok(series.mapv(|v| band.contains(v)))
}
