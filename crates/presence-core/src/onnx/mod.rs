//! ONNX Runtime extractor: SCRFD detection, five-point alignment, ArcFace.

pub mod align;
pub mod detector;
pub mod recognizer;

use crate::extractor::{EmbeddingExtractor, ExtractError, Extraction};
use detector::FaceDetector;
use recognizer::FaceRecognizer;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}; download it from insightface and place it in the model directory")]
    ModelNotFound(PathBuf),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_FILE))?,
            recognizer: FaceRecognizer::load(&model_dir.join(RECOGNIZER_FILE))?,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn model_version(&self) -> &str {
        recognizer::MODEL_VERSION
    }

    fn extract(&mut self, image: &[u8]) -> Result<Extraction, ExtractError> {
        let rgb = image::load_from_memory(image)
            .map_err(|e| ExtractError::InvalidImage(e.to_string()))?
            .to_rgb8();

        let faces = self
            .detector
            .detect(&rgb)
            .map_err(|e| ExtractError::Failed(e.to_string()))?;
        let face = faces.into_iter().next().ok_or(ExtractError::NoFace)?;
        tracing::debug!(score = face.score, width = face.width, height = face.height, "face detected");

        let aligned = align::align_face(&rgb, &face.landmarks);
        let embedding = self
            .recognizer
            .embed(&aligned)
            .map_err(|e| ExtractError::Failed(e.to_string()))?;

        Ok(Extraction {
            embedding,
            quality: face.score.clamp(0.0, 1.0),
        })
    }
}
