//! In-memory gallery of known-identity embeddings.
//!
//! The gallery is loaded once from per-student embedding files and kept
//! as a contiguous matrix so a probe can be compared against every
//! stored vector in one pass. It is rebuilt from disk on roster reload
//! rather than mutated in place.

use crate::types::Embedding;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reading or writing a single embedding file.
#[derive(Debug, Error)]
pub enum EmbeddingFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed embedding file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("embedding has {actual} values, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
}

/// On-disk representation of one stored embedding.
#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingFile {
    values: Vec<f32>,
    #[serde(default)]
    model_version: Option<String>,
}

/// Reads an embedding file and validates its dimensionality.
pub fn read_embedding_file(
    path: &Path,
    expected_dim: usize,
) -> Result<Embedding, EmbeddingFileError> {
    let raw = fs::read(path)?;
    let file: EmbeddingFile = serde_json::from_slice(&raw)?;
    if file.values.len() != expected_dim {
        return Err(EmbeddingFileError::WrongDimension {
            expected: expected_dim,
            actual: file.values.len(),
        });
    }
    Ok(Embedding {
        values: file.values,
        model_version: file.model_version,
    })
}

/// Writes an embedding file, overwriting any previous registration.
pub fn write_embedding_file(path: &Path, embedding: &Embedding) -> Result<(), EmbeddingFileError> {
    let file = EmbeddingFile {
        values: embedding.values.clone(),
        model_version: embedding.model_version.clone(),
    };
    let raw = serde_json::to_vec_pretty(&file)?;
    fs::write(path, raw)?;
    Ok(())
}

/// One roster row the gallery can load an embedding for.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub student_id: i64,
    pub display_name: String,
    /// Path of the student's embedding file, `None` if never registered.
    pub embedding_path: Option<PathBuf>,
}

/// The nearest gallery entry to a probe vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    /// Row index inside the gallery, stable for one loaded generation.
    pub row: usize,
    pub student_id: i64,
    pub distance: f32,
}

/// All known embeddings packed into one `(entries, dim)` matrix.
pub struct EmbeddingGallery {
    dim: usize,
    ids: Vec<i64>,
    names: Vec<String>,
    matrix: Array2<f32>,
}

impl EmbeddingGallery {
    /// Creates a gallery with no entries.
    pub fn empty(dim: usize) -> Self {
        EmbeddingGallery {
            dim,
            ids: Vec::new(),
            names: Vec::new(),
            matrix: Array2::zeros((0, dim)),
        }
    }

    /// Loads embeddings for every registered roster entry.
    ///
    /// Entries without a stored embedding are skipped silently; entries
    /// whose file is missing, malformed, or of the wrong dimension are
    /// skipped with a warning so one bad file cannot take down startup.
    pub fn load(dim: usize, roster: &[RosterEntry]) -> Self {
        let mut ids = Vec::new();
        let mut names = Vec::new();
        let mut values = Vec::new();

        for entry in roster {
            let Some(path) = &entry.embedding_path else {
                continue;
            };
            match read_embedding_file(path, dim) {
                Ok(embedding) => {
                    ids.push(entry.student_id);
                    names.push(entry.display_name.clone());
                    values.extend_from_slice(&embedding.values);
                }
                Err(err) => {
                    warn!(
                        student = %entry.display_name,
                        path = %path.display(),
                        error = %err,
                        "skipping unloadable embedding"
                    );
                }
            }
        }

        let rows = ids.len();
        let matrix = Array2::from_shape_vec((rows, dim), values)
            .expect("embedding rows validated against dim on load");
        debug!(entries = rows, dim, "gallery loaded");
        EmbeddingGallery {
            dim,
            ids,
            names,
            matrix,
        }
    }

    /// Number of stored embeddings.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Embedding dimensionality this gallery was loaded with.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Display name for a gallery row returned by [`nearest`].
    ///
    /// [`nearest`]: EmbeddingGallery::nearest
    pub fn display_name(&self, row: usize) -> &str {
        &self.names[row]
    }

    /// Builds a gallery directly from rows, bypassing the filesystem.
    #[cfg(test)]
    pub(crate) fn from_rows(dim: usize, rows: Vec<(i64, String, Vec<f32>)>) -> Self {
        let mut ids = Vec::new();
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (id, name, vec) in rows {
            assert_eq!(vec.len(), dim);
            ids.push(id);
            names.push(name);
            values.extend_from_slice(&vec);
        }
        let matrix = Array2::from_shape_vec((ids.len(), dim), values).unwrap();
        EmbeddingGallery {
            dim,
            ids,
            names,
            matrix,
        }
    }

    /// Finds the stored embedding closest to `probe` by Euclidean
    /// distance.
    ///
    /// Returns `None` for an empty gallery or a probe of the wrong
    /// dimension. Ties are broken by the lowest row index, so repeated
    /// calls with the same probe always name the same identity.
    pub fn nearest(&self, probe: &[f32]) -> Option<Nearest> {
        if self.ids.is_empty() {
            return None;
        }
        if probe.len() != self.dim {
            warn!(
                probe_len = probe.len(),
                dim = self.dim,
                "probe dimension does not match gallery"
            );
            return None;
        }

        let diff = &self.matrix - &ArrayView1::from(probe);
        let squared = diff.mapv(|v| v * v).sum_axis(Axis(1));

        let mut best: Option<(usize, f32)> = None;
        for (row, &d2) in squared.iter().enumerate() {
            match best {
                Some((_, min)) if d2 >= min => {}
                _ => best = Some((row, d2)),
            }
        }
        best.map(|(row, d2)| Nearest {
            row,
            student_id: self.ids[row],
            distance: d2.sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gallery_of(dim: usize, entries: &[(i64, &str, Vec<f32>)]) -> EmbeddingGallery {
        EmbeddingGallery::from_rows(
            dim,
            entries
                .iter()
                .map(|(id, name, vec)| (*id, name.to_string(), vec.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_nearest_empty_gallery() {
        let gallery = EmbeddingGallery::empty(4);
        assert!(gallery.nearest(&[0.0, 0.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_nearest_picks_closest() {
        let gallery = gallery_of(
            4,
            &[
                (1, "Ada", vec![0.0, 0.0, 0.0, 0.0]),
                (2, "Grace", vec![1.0, 1.0, 1.0, 1.0]),
            ],
        );
        let hit = gallery.nearest(&[0.9, 0.9, 0.9, 0.9]).unwrap();
        assert_eq!(hit.student_id, 2);
        assert_eq!(gallery.display_name(hit.row), "Grace");
        assert!((hit.distance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_tie_prefers_lowest_row() {
        let gallery = gallery_of(
            2,
            &[
                (7, "First", vec![1.0, 0.0]),
                (8, "Second", vec![-1.0, 0.0]),
            ],
        );
        // Probe equidistant from both entries.
        let hit = gallery.nearest(&[0.0, 0.0]).unwrap();
        assert_eq!(hit.row, 0);
        assert_eq!(hit.student_id, 7);
    }

    #[test]
    fn test_nearest_rejects_wrong_probe_dimension() {
        let gallery = gallery_of(3, &[(1, "Ada", vec![0.0, 0.0, 0.0])]);
        assert!(gallery.nearest(&[0.0, 0.0]).is_none());
    }

    #[test]
    fn test_load_skips_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("1_Ada.json");
        write_embedding_file(
            &good,
            &Embedding {
                values: vec![0.1, 0.2, 0.3],
                model_version: Some("r50".into()),
            },
        )
        .unwrap();

        let bad = dir.path().join("2_Grace.json");
        fs::write(&bad, b"not json at all").unwrap();

        let wrong_dim = dir.path().join("3_Edsger.json");
        write_embedding_file(
            &wrong_dim,
            &Embedding {
                values: vec![1.0, 2.0],
                model_version: None,
            },
        )
        .unwrap();

        let roster = vec![
            RosterEntry {
                student_id: 1,
                display_name: "Ada".into(),
                embedding_path: Some(good),
            },
            RosterEntry {
                student_id: 2,
                display_name: "Grace".into(),
                embedding_path: Some(bad),
            },
            RosterEntry {
                student_id: 3,
                display_name: "Edsger".into(),
                embedding_path: Some(wrong_dim),
            },
            RosterEntry {
                student_id: 4,
                display_name: "Barbara".into(),
                embedding_path: Some(dir.path().join("missing.json")),
            },
            RosterEntry {
                student_id: 5,
                display_name: "Unregistered".into(),
                embedding_path: None,
            },
        ];

        let gallery = EmbeddingGallery::load(3, &roster);
        assert_eq!(gallery.len(), 1);
        let hit = gallery.nearest(&[0.1, 0.2, 0.3]).unwrap();
        assert_eq!(hit.student_id, 1);
        assert_eq!(hit.distance, 0.0);
    }

    #[test]
    fn test_embedding_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9_Alan.json");
        let original = Embedding {
            values: vec![0.5, -0.5, 0.25, 0.0],
            model_version: Some("r50".into()),
        };
        write_embedding_file(&path, &original).unwrap();
        let loaded = read_embedding_file(&path, 4).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_read_embedding_file_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_Ada.json");
        write_embedding_file(
            &path,
            &Embedding {
                values: vec![1.0, 2.0, 3.0],
                model_version: None,
            },
        )
        .unwrap();
        match read_embedding_file(&path, 128) {
            Err(EmbeddingFileError::WrongDimension { expected, actual }) => {
                assert_eq!(expected, 128);
                assert_eq!(actual, 3);
            }
            other => panic!("expected WrongDimension, got {other:?}"),
        }
    }
}
