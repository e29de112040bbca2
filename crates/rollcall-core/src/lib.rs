//! rollcall-core — Face identification engine.
//!
//! Matches faces in camera frames against a gallery of registered
//! embeddings. Detection and embedding extraction run behind the
//! [`FaceOracle`] trait, with an ONNX Runtime implementation in
//! [`onnx`].

pub mod enroll;
pub mod gallery;
pub mod identify;
pub mod onnx;
pub mod types;

pub use gallery::{EmbeddingGallery, RosterEntry};
pub use identify::{FrameRef, IdentificationEngine, IdentifySettings};
pub use types::{Embedding, FaceBox, FaceOracle, Identification, OracleError};
