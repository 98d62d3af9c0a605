use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aligned per-field series keyed by field name.
///
/// Every list has the same length as `time`; fields discovered after the
/// first sample are back-filled with zeros so indices stay aligned.
pub type SeriesMap = BTreeMap<String, Vec<f64>>;

/// Time-series snapshot of a case, as served by `/api/plot_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlotData(pub SeriesMap);

impl PlotData {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn series(&self, name: &str) -> Option<&[f64]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Length of the `time` axis (zero when no samples exist).
    pub fn len(&self) -> usize {
        self.series("time").map(<[f64]>::len).unwrap_or(0)
    }
}

/// Residual history extracted from a solver log, as served by
/// `/api/residuals`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResidualData(pub SeriesMap);

impl ResidualData {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn series(&self, name: &str) -> Option<&[f64]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.series("time").map(<[f64]>::len).unwrap_or(0)
    }
}

/// One sample per field at a single simulated time, as served by
/// `/api/latest_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlotPoint(pub BTreeMap<String, f64>);

impl PlotPoint {
    pub fn time(&self) -> Option<f64> {
        self.0.get("time").copied()
    }
}
