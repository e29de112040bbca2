//! ONNX Runtime face oracle.
//!
//! Implements [`FaceOracle`] against a pair of exported models: a
//! single-output detector whose tensor is `[N, 5]` rows of
//! `x1, y1, x2, y2, score` in model-input pixel coordinates (anchor
//! decoding and NMS baked into the export), and an embedder producing
//! one fixed-length vector per face crop. This adapter only maps
//! tensors, scales coordinates and crops faces.

use crate::types::{Embedding, FaceBox, FaceOracle, OracleError};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// --- Detector model contract ---
const DETECTOR_INPUT_SIZE: u32 = 320;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_MIN_CONFIDENCE: f32 = 0.6;
const DETECTOR_ROW_LEN: usize = 5; // x1, y1, x2, y2, score

// --- Embedder model contract ---
const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5; // symmetric normalization, unlike the detector

/// Face oracle backed by ONNX Runtime sessions.
pub struct OnnxOracle {
    detector: Session,
    embedder: Session,
    model_version: Option<String>,
}

impl OnnxOracle {
    /// Load the detector and embedder models from disk.
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, OracleError> {
        for path in [detector_path, embedder_path] {
            if !path.exists() {
                return Err(OracleError::ModelNotFound(path.display().to_string()));
            }
        }

        let detector = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(detector_path)?;
        let embedder = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(embedder_path)?;

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            "loaded face models"
        );

        let model_version = embedder_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        Ok(OnnxOracle {
            detector,
            embedder,
            model_version,
        })
    }
}

impl FaceOracle for OnnxOracle {
    fn detect_faces(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceBox>, OracleError> {
        let image = rgb_image(rgb, width, height)?;
        let resized = imageops::resize(
            &image,
            DETECTOR_INPUT_SIZE,
            DETECTOR_INPUT_SIZE,
            FilterType::Triangle,
        );
        let input = preprocess(&resized, DETECTOR_MEAN, DETECTOR_STD);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OracleError::InferenceFailed(format!("detector output: {e}")))?;

        let scale_x = width as f32 / DETECTOR_INPUT_SIZE as f32;
        let scale_y = height as f32 / DETECTOR_INPUT_SIZE as f32;
        Ok(decode_detections(
            data,
            scale_x,
            scale_y,
            width as f32,
            height as f32,
        ))
    }

    fn compute_embeddings(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        faces: &[FaceBox],
    ) -> Result<Vec<Embedding>, OracleError> {
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let image = rgb_image(rgb, width, height)?;

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in faces {
            let (x, y, w, h) = crop_rect(face, width, height);
            let crop = imageops::crop_imm(&image, x, y, w, h).to_image();
            let resized = imageops::resize(
                &crop,
                EMBEDDER_INPUT_SIZE,
                EMBEDDER_INPUT_SIZE,
                FilterType::Triangle,
            );
            let input = preprocess(&resized, EMBEDDER_MEAN, EMBEDDER_STD);

            let outputs = self
                .embedder
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, raw) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| OracleError::InferenceFailed(format!("embedding extraction: {e}")))?;

            embeddings.push(Embedding {
                values: l2_normalize(raw.to_vec()),
                model_version: self.model_version.clone(),
            });
        }
        Ok(embeddings)
    }
}

fn rgb_image(rgb: &[u8], width: u32, height: u32) -> Result<RgbImage, OracleError> {
    let expected = width as usize * height as usize * 3;
    if width == 0 || height == 0 || rgb.len() != expected {
        return Err(OracleError::InvalidImage {
            width,
            height,
            len: rgb.len(),
        });
    }
    RgbImage::from_raw(width, height, rgb.to_vec()).ok_or(OracleError::InvalidImage {
        width,
        height,
        len: rgb.len(),
    })
}

/// Decode `[N, 5]` detector output into frame-coordinate boxes, best
/// first. Rows below the confidence floor or degenerate after clamping
/// are dropped.
fn decode_detections(
    data: &[f32],
    scale_x: f32,
    scale_y: f32,
    frame_w: f32,
    frame_h: f32,
) -> Vec<FaceBox> {
    let mut faces = Vec::new();
    for row in data.chunks_exact(DETECTOR_ROW_LEN) {
        let confidence = row[4];
        if confidence < DETECTOR_MIN_CONFIDENCE {
            continue;
        }
        let x1 = (row[0] * scale_x).clamp(0.0, frame_w);
        let y1 = (row[1] * scale_y).clamp(0.0, frame_h);
        let x2 = (row[2] * scale_x).clamp(0.0, frame_w);
        let y2 = (row[3] * scale_y).clamp(0.0, frame_h);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        faces.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        });
    }
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    faces
}

/// Integer crop rectangle for a face, clamped inside the image and at
/// least one pixel in each dimension.
fn crop_rect(face: &FaceBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x = (face.x.max(0.0) as u32).min(width.saturating_sub(1));
    let y = (face.y.max(0.0) as u32).min(height.saturating_sub(1));
    let w = (face.width.round() as u32).clamp(1, width - x);
    let h = (face.height.round() as u32).clamp(1, height - y);
    (x, y, w, h)
}

/// Pack an RGB image into a normalized NCHW float tensor.
fn preprocess(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
