//! Photo registration for new identities.

use crate::gallery::{write_embedding_file, EmbeddingFileError};
use crate::types::{Embedding, FaceOracle};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("no usable face found in the supplied images")]
    NoFaceDetected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write embedding: {0}")]
    Write(#[from] EmbeddingFileError),
}

/// File name a registered identity's embedding is stored under.
pub fn embedding_filename(external_id: &str, display_name: &str) -> String {
    format!("{}_{}.json", external_id, display_name.replace(' ', "_"))
}

/// Builds one stored embedding for a person from registration photos.
///
/// Each photo is decoded, the best face detected and embedded, and the
/// resulting vectors averaged element-wise into a single reference
/// embedding. Photos that fail to decode, contain no face, or trip the
/// oracle are skipped with a warning; only if nothing usable remains
/// does this fail with [`EnrollError::NoFaceDetected`].
///
/// The embedding is written to `embeddings_dir` under
/// [`embedding_filename`] and the path returned. The caller is expected
/// to reload any live gallery afterwards.
pub fn register_identity(
    oracle: &mut dyn FaceOracle,
    image_paths: &[PathBuf],
    display_name: &str,
    external_id: &str,
    embeddings_dir: &Path,
) -> Result<PathBuf, EnrollError> {
    let mut collected: Vec<Vec<f32>> = Vec::new();
    let mut model_version: Option<String> = None;

    for path in image_paths {
        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping undecodable photo");
                continue;
            }
        };
        let (width, height) = image.dimensions();

        let boxes = match oracle.detect_faces(image.as_raw(), width, height) {
            Ok(boxes) => boxes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "detection failed for photo");
                continue;
            }
        };
        let Some(best) = boxes.first() else {
            debug!(path = %path.display(), "no face in photo");
            continue;
        };

        let embeddings = match oracle.compute_embeddings(
            image.as_raw(),
            width,
            height,
            std::slice::from_ref(best),
        ) {
            Ok(embeddings) => embeddings,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "embedding failed for photo");
                continue;
            }
        };
        let Some(embedding) = embeddings.into_iter().next() else {
            continue;
        };

        if let Some(first) = collected.first() {
            if embedding.values.len() != first.len() {
                warn!(
                    path = %path.display(),
                    got = embedding.values.len(),
                    expected = first.len(),
                    "skipping embedding with inconsistent dimension"
                );
                continue;
            }
        }
        if model_version.is_none() {
            model_version = embedding.model_version.clone();
        }
        collected.push(embedding.values);
    }

    if collected.is_empty() {
        return Err(EnrollError::NoFaceDetected);
    }

    let dim = collected[0].len();
    let mut averaged = vec![0.0f32; dim];
    for values in &collected {
        for (acc, v) in averaged.iter_mut().zip(values) {
            *acc += v;
        }
    }
    let count = collected.len() as f32;
    for acc in &mut averaged {
        *acc /= count;
    }

    fs::create_dir_all(embeddings_dir)?;
    let path = embeddings_dir.join(embedding_filename(external_id, display_name));
    write_embedding_file(
        &path,
        &Embedding {
            values: averaged,
            model_version,
        },
    )?;
    info!(
        name = display_name,
        used = collected.len(),
        total = image_paths.len(),
        path = %path.display(),
        "registered identity"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::read_embedding_file;
    use crate::types::{FaceBox, OracleError};
    use image::{Rgb, RgbImage};

    /// Oracle that reports a face whenever the top-left pixel is
    /// non-black and embeds it as that pixel's RGB values.
    struct PixelOracle;

    impl FaceOracle for PixelOracle {
        fn detect_faces(
            &mut self,
            rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<FaceBox>, OracleError> {
            if rgb[..3] == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![FaceBox {
                x: 0.0,
                y: 0.0,
                width: 2.0,
                height: 2.0,
                confidence: 1.0,
            }])
        }

        fn compute_embeddings(
            &mut self,
            rgb: &[u8],
            _width: u32,
            _height: u32,
            faces: &[FaceBox],
        ) -> Result<Vec<Embedding>, OracleError> {
            Ok(faces
                .iter()
                .map(|_| Embedding {
                    values: vec![rgb[0] as f32, rgb[1] as f32, rgb[2] as f32],
                    model_version: Some("pixel".into()),
                })
                .collect())
        }
    }

    fn write_photo(dir: &Path, name: &str, color: Rgb<u8>) -> PathBuf {
        let mut image = RgbImage::new(4, 4);
        for pixel in image.pixels_mut() {
            *pixel = color;
        }
        let path = dir.join(name);
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn test_register_averages_across_photos() {
        let dir = tempfile::tempdir().unwrap();
        let photos = vec![
            write_photo(dir.path(), "a.png", Rgb([2, 0, 0])),
            write_photo(dir.path(), "b.png", Rgb([4, 0, 0])),
        ];

        let out = dir.path().join("embeddings");
        let path = register_identity(&mut PixelOracle, &photos, "Ada Lovelace", "CS-101", &out)
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "CS-101_Ada_Lovelace.json");

        let stored = read_embedding_file(&path, 3).unwrap();
        assert_eq!(stored.values, vec![3.0, 0.0, 0.0]);
        assert_eq!(stored.model_version.as_deref(), Some("pixel"));
    }

    #[test]
    fn test_register_skips_faceless_and_undecodable_photos() {
        let dir = tempfile::tempdir().unwrap();
        let faceless = write_photo(dir.path(), "dark.png", Rgb([0, 0, 0]));
        let garbage = dir.path().join("broken.png");
        fs::write(&garbage, b"this is not a png").unwrap();
        let good_a = write_photo(dir.path(), "a.png", Rgb([2, 0, 0]));
        let good_b = write_photo(dir.path(), "b.png", Rgb([6, 0, 0]));

        let out = dir.path().join("embeddings");
        let path = register_identity(
            &mut PixelOracle,
            &[faceless, garbage, good_a, good_b],
            "Grace",
            "CS-102",
            &out,
        )
        .unwrap();

        // Only the two usable photos contribute to the average.
        let stored = read_embedding_file(&path, 3).unwrap();
        assert_eq!(stored.values, vec![4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_register_fails_when_nothing_usable() {
        let dir = tempfile::tempdir().unwrap();
        let faceless = write_photo(dir.path(), "dark.png", Rgb([0, 0, 0]));

        let out = dir.path().join("embeddings");
        let err = register_identity(&mut PixelOracle, &[faceless], "Grace", "CS-102", &out)
            .unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceDetected));
        assert!(!out.exists(), "no embedding file should be written");
    }

    #[test]
    fn test_embedding_filename_replaces_spaces() {
        assert_eq!(
            embedding_filename("7", "Edsger W Dijkstra"),
            "7_Edsger_W_Dijkstra.json"
        );
    }
}
