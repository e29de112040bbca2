//! Core types shared across the identification pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label reported for a face that matched nothing in the gallery.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Axis-aligned face bounding box in pixel coordinates of the image it
/// was detected in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceBox {
    /// Returns a copy with all coordinates multiplied by `factor`.
    ///
    /// Used to map detections made on a downscaled frame back into
    /// full-frame coordinates.
    pub fn scaled(&self, factor: f32) -> FaceBox {
        FaceBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }
}

/// A face embedding vector produced by an oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// The embedding vector values.
    pub values: Vec<f32>,
    /// Version or name of the model that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Computes the Euclidean distance between two embeddings.
    ///
    /// Returns `f32::INFINITY` if the embeddings have different lengths.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// A detected face paired with its embedding, before gallery matching.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// The outcome of matching one observed face against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    /// Roster id of the matched student, `None` for an unknown face.
    pub student_id: Option<i64>,
    /// Display name of the match, or [`UNKNOWN_LABEL`].
    pub display_name: String,
    /// Distance to the nearest gallery entry, `None` when the gallery
    /// was empty.
    pub distance: Option<f32>,
    /// Bounding box in full-frame coordinates.
    pub bbox: FaceBox,
}

/// Errors from a face oracle backend.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),

    #[error("image buffer of {len} bytes does not match {width}x{height} RGB24")]
    InvalidImage { width: u32, height: u32, len: usize },

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects faces and computes their embeddings.
///
/// Images are tightly packed RGB24 buffers. Implementations may hold
/// mutable inference state, so both methods take `&mut self`.
pub trait FaceOracle: Send {
    /// Finds faces in the given image, best first.
    fn detect_faces(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceBox>, OracleError>;

    /// Computes one embedding per face, in the same order as `faces`.
    fn compute_embeddings(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        faces: &[FaceBox],
    ) -> Result<Vec<Embedding>, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: None,
        }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = embedding(vec![1.0, 2.0, 3.0]);
        let b = embedding(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.euclidean_distance(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = embedding(vec![0.0, 0.0]);
        let b = embedding(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), 5.0);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = embedding(vec![0.5, -1.5, 2.0]);
        let b = embedding(vec![-0.5, 1.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
    }

    #[test]
    fn test_euclidean_distance_length_mismatch() {
        let a = embedding(vec![1.0, 2.0]);
        let b = embedding(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.euclidean_distance(&b), f32::INFINITY);
    }

    #[test]
    fn test_face_box_scaled() {
        let b = FaceBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
        };
        let s = b.scaled(4.0);
        assert_eq!(s.x, 40.0);
        assert_eq!(s.y, 80.0);
        assert_eq!(s.width, 120.0);
        assert_eq!(s.height, 160.0);
        assert_eq!(s.confidence, 0.9);
    }
}
