//! Per-frame identification pipeline with inference throttling.
//!
//! Oracle inference dominates the cost of a cycle, so the engine only
//! runs it on a subset of frames: every `detect_stride`-th call, and
//! never more often than `min_detect_interval`. Calls in between replay
//! the cached results from the last inference so overlay consumers
//! always have something current-ish to draw.

use crate::gallery::EmbeddingGallery;
use crate::types::{
    FaceObservation, FaceOracle, Identification, OracleError, UNKNOWN_LABEL,
};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Tuning knobs for the identification pipeline.
#[derive(Debug, Clone)]
pub struct IdentifySettings {
    /// Maximum gallery distance for a face to count as a match.
    pub match_threshold: f32,
    /// Factor in (0, 1] applied to both frame dimensions before
    /// detection.
    pub downscale_factor: f32,
    /// Run inference on every n-th call.
    pub detect_stride: u32,
    /// Minimum wall-clock gap between two inference runs.
    pub min_detect_interval: Duration,
}

/// A borrowed RGB24 frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Explicit record of the throttling decision inputs.
#[derive(Debug)]
struct ThrottleState {
    /// Total calls with a frame present.
    calls: u64,
    /// Calls that actually ran inference.
    heavy_runs: u64,
    last_heavy_run: Option<Instant>,
    cached: Vec<Identification>,
}

impl ThrottleState {
    fn new() -> Self {
        ThrottleState {
            calls: 0,
            heavy_runs: 0,
            last_heavy_run: None,
            cached: Vec::new(),
        }
    }
}

/// Matches faces in frames against a gallery of known identities.
pub struct IdentificationEngine {
    oracle: Box<dyn FaceOracle>,
    settings: IdentifySettings,
    state: ThrottleState,
}

impl IdentificationEngine {
    pub fn new(oracle: Box<dyn FaceOracle>, settings: IdentifySettings) -> Self {
        IdentificationEngine {
            oracle,
            settings,
            state: ThrottleState::new(),
        }
    }

    /// The oracle backing this engine, for registration flows that want
    /// to reuse the already-loaded models.
    pub fn oracle_mut(&mut self) -> &mut dyn FaceOracle {
        self.oracle.as_mut()
    }

    /// Calls made with a frame present.
    pub fn calls(&self) -> u64 {
        self.state.calls
    }

    /// Calls that ran oracle inference rather than replaying the cache.
    pub fn heavy_runs(&self) -> u64 {
        self.state.heavy_runs
    }

    /// Identifies every face visible in `frame`.
    ///
    /// `None` means the capture side has not published a frame; that
    /// returns no identifications and leaves the throttle state alone,
    /// so a camera dropout never replays stale matches.
    ///
    /// Oracle errors propagate and also leave the cache untouched.
    pub fn identify(
        &mut self,
        frame: Option<FrameRef<'_>>,
        gallery: &EmbeddingGallery,
    ) -> Result<Vec<Identification>, OracleError> {
        let Some(frame) = frame else {
            return Ok(Vec::new());
        };

        self.state.calls += 1;
        let stride = self.settings.detect_stride.max(1) as u64;
        let counter_due = (self.state.calls - 1) % stride == 0;
        let interval_ok = match self.state.last_heavy_run {
            None => true,
            Some(at) => at.elapsed() >= self.settings.min_detect_interval,
        };
        if !(counter_due && interval_ok) {
            trace!(
                calls = self.state.calls,
                counter_due,
                interval_ok,
                "replaying cached identifications"
            );
            return Ok(self.state.cached.clone());
        }

        let results = self.run_inference(frame, gallery)?;
        self.state.heavy_runs += 1;
        self.state.last_heavy_run = Some(Instant::now());
        self.state.cached = results.clone();
        Ok(results)
    }

    fn run_inference(
        &mut self,
        frame: FrameRef<'_>,
        gallery: &EmbeddingGallery,
    ) -> Result<Vec<Identification>, OracleError> {
        let factor = self.settings.downscale_factor;
        let (scaled, width, height, inverse) = if factor > 0.0 && factor < 1.0 {
            let (data, w, h) = downscale_rgb(frame, factor)?;
            (Some(data), w, h, 1.0 / factor)
        } else {
            (None, frame.width, frame.height, 1.0)
        };
        let rgb: &[u8] = scaled.as_deref().unwrap_or(frame.data);

        let boxes = self.oracle.detect_faces(rgb, width, height)?;
        let embeddings = self.oracle.compute_embeddings(rgb, width, height, &boxes)?;

        let results: Vec<Identification> = boxes
            .into_iter()
            .zip(embeddings)
            .map(|(bbox, embedding)| {
                let observation = FaceObservation { bbox, embedding };
                self.match_observation(observation, gallery, inverse)
            })
            .collect();
        debug!(faces = results.len(), "inference cycle complete");
        Ok(results)
    }

    fn match_observation(
        &self,
        observation: FaceObservation,
        gallery: &EmbeddingGallery,
        inverse: f32,
    ) -> Identification {
        let bbox = observation.bbox.scaled(inverse);
        match gallery.nearest(&observation.embedding.values) {
            Some(hit) if hit.distance < self.settings.match_threshold => Identification {
                student_id: Some(hit.student_id),
                display_name: gallery.display_name(hit.row).to_string(),
                distance: Some(hit.distance),
                bbox,
            },
            Some(hit) => Identification {
                student_id: None,
                display_name: UNKNOWN_LABEL.to_string(),
                distance: Some(hit.distance),
                bbox,
            },
            None => Identification {
                student_id: None,
                display_name: UNKNOWN_LABEL.to_string(),
                distance: None,
                bbox,
            },
        }
    }
}

/// Resizes a packed RGB24 buffer by `factor` in both dimensions.
fn downscale_rgb(frame: FrameRef<'_>, factor: f32) -> Result<(Vec<u8>, u32, u32), OracleError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(OracleError::InvalidImage {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        });
    }
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec()).ok_or(
        OracleError::InvalidImage {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        },
    )?;
    let width = ((frame.width as f32 * factor).round() as u32).max(1);
    let height = ((frame.height as f32 * factor).round() as u32).max(1);
    let small = imageops::resize(&image, width, height, FilterType::Triangle);
    Ok((small.into_raw(), width, height))
}
