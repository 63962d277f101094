use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of every feature vector produced by the detector.
pub const FEATURE_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("expected {FEATURE_DIM}-dim feature vector, got {0}")]
    WrongLength(usize),
    #[error("feature vector component {index} is not finite ({value})")]
    NotFinite { index: usize, value: f32 },
}

/// Strong identifier of an enrolled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier assigned by the store to a persisted attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Face feature vector (128-dimensional, produced by the external detector).
///
/// Immutable once constructed. Construction rejects wrong lengths and
/// non-finite components so distances are always well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Result<Self, VectorError> {
        if values.len() != FEATURE_DIM {
            return Err(VectorError::WrongLength(values.len()));
        }
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(VectorError::NotFinite { index, value });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Compute Euclidean distance between two feature vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for FeatureVector {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FeatureVector> for Vec<f32> {
    fn from(vector: FeatureVector) -> Self {
        vector.values
    }
}

/// One raw enrollment row as handed out by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub vector: FeatureVector,
}

/// Result of matching one query vector against a gallery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, `None` when the query is unknown.
    pub identity_id: Option<IdentityId>,
    pub display_name: String,
    /// Distance to the nearest enrolled vector (infinite for an empty gallery).
    pub distance: f32,
    /// 0–100, higher is more similar. Reported for unknown results too.
    pub confidence: u8,
}

impl MatchResult {
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    pub fn unknown(distance: f32, confidence: u8) -> Self {
        Self {
            identity_id: None,
            display_name: Self::UNKNOWN_NAME.to_string(),
            distance,
            confidence,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// A recorded attendance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub timestamp: DateTime<Local>,
    pub confidence: u8,
    /// Reference to an externally stored snapshot image, if the UI captured one.
    pub snapshot_ref: Option<String>,
}

#[cfg(test)]
impl FeatureVector {
    /// Zero vector with a single non-zero component.
    pub(crate) fn axis(index: usize, value: f32) -> Self {
        let mut values = vec![0.0; FEATURE_DIM];
        values[index] = value;
        Self { values }
    }
}
