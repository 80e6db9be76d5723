//! Detection source backed by a JSON observation file.
//!
//! An external detector process owns the camera and the embedding model and
//! rewrites `feed_path` every frame with `{"faces": [[f32, ...], ...]}`.

use faceguard_core::{DetectionError, Descriptor, FaceDetector};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

#[derive(Debug, Deserialize)]
struct FeedFrame {
    faces: Vec<Descriptor>,
}

pub struct FeedDetector {
    path: PathBuf,
    max_age: Option<Duration>,
    dimension: usize,
}

impl FeedDetector {
    pub fn new(path: PathBuf, max_age: Option<Duration>, dimension: usize) -> Self {
        Self {
            path,
            max_age,
            dimension,
        }
    }

    fn read(&self) -> Result<FeedFrame, DetectionError> {
        let unavailable =
            |e: std::io::Error| DetectionError::Unavailable(format!("{}: {e}", self.path.display()));

        let metadata = std::fs::metadata(&self.path).map_err(unavailable)?;
        if let Some(max_age) = self.max_age {
            let modified = metadata.modified().map_err(unavailable)?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                return Err(DetectionError::Unavailable(format!(
                    "feed stale: last frame {}ms ago",
                    age.as_millis()
                )));
            }
        }

        let bytes = std::fs::read(&self.path).map_err(unavailable)?;
        let frame: FeedFrame = serde_json::from_slice(&bytes)
            .map_err(|e| DetectionError::Fault(format!("malformed feed frame: {e}")))?;

        if let Some(bad) = frame.faces.iter().find(|d| d.dimension() != self.dimension) {
            return Err(DetectionError::Fault(format!(
                "feed descriptor has dimension {}, expected {}",
                bad.dimension(),
                self.dimension
            )));
        }

        Ok(frame)
    }
}

impl FaceDetector for FeedDetector {
    fn open(&mut self) -> Result<(), DetectionError> {
        std::fs::metadata(&self.path).map_err(|e| {
            DetectionError::Unavailable(format!("detector feed {}: {e}", self.path.display()))
        })?;
        tracing::info!(path = %self.path.display(), "detector feed attached");
        Ok(())
    }

    fn close(&mut self) {
        tracing::debug!(path = %self.path.display(), "detector feed detached");
    }

    fn detect_one(&mut self) -> Result<Option<Descriptor>, DetectionError> {
        Ok(self.read()?.faces.into_iter().next())
    }

    fn detect_all(&mut self) -> Result<Vec<Descriptor>, DetectionError> {
        Ok(self.read()?.faces)
    }
}
