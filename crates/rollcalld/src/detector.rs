//! Detector seam and the NDJSON replay implementation.
//!
//! Frame acquisition and embedding extraction happen outside this daemon.
//! A detector hands over the feature vectors of the next available frame.

use rollcall_core::FeatureVector;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

#[derive(Error, Debug)]
pub enum DetectorError {
    /// One tick lost; the session keeps running.
    #[error("detection failed: {0}")]
    Transient(String),
    /// Camera or detector is gone; the session must end.
    #[error("feature source unavailable: {0}")]
    Unavailable(String),
    #[error("feature source exhausted")]
    Exhausted,
}

pub trait Detector: Send {
    /// Feature vectors of the next frame (zero or more, order not significant).
    fn detect(&mut self) -> impl Future<Output = Result<Vec<FeatureVector>, DetectorError>> + Send;
}

/// Opens a fresh detector for each scanning session.
pub trait DetectorSource: Send + Sync + 'static {
    type Detector: Detector + 'static;

    fn open(&self) -> impl Future<Output = Result<Self::Detector, DetectorError>> + Send;
}

/// Replays pre-computed vectors from an NDJSON file.
///
/// Each line is one frame: a JSON array of 128-float arrays. A blank line or
/// `[]` is a frame with no faces.
pub struct ReplayDetector {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl ReplayDetector {
    pub async fn open(path: &Path) -> Result<Self, DetectorError> {
        let file = File::open(path)
            .await
            .map_err(|e| DetectorError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "replay feature source opened");
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

impl Detector for ReplayDetector {
    async fn detect(&mut self) -> Result<Vec<FeatureVector>, DetectorError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| DetectorError::Unavailable(format!("read failed: {e}")))?
            .ok_or(DetectorError::Exhausted)?;
        self.line_no += 1;

        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(line)
            .map_err(|e| DetectorError::Transient(format!("line {}: {e}", self.line_no)))
    }
}

/// Session source for [`ReplayDetector`]; reopens the file for every session.
pub struct ReplaySource {
    path: Option<PathBuf>,
}

impl ReplaySource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl DetectorSource for ReplaySource {
    type Detector = ReplayDetector;

    async fn open(&self) -> Result<ReplayDetector, DetectorError> {
        match &self.path {
            Some(path) => ReplayDetector::open(path).await,
            None => Err(DetectorError::Unavailable(
                "no feature source configured (set ROLLCALL_FEATURE_SOURCE)".into(),
            )),
        }
    }
}
