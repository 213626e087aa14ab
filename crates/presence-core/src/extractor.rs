//! Embedding extractor capability.
//!
//! The pipeline sees only "image bytes in, embedding or no-face out".
//! Variants are chosen by configuration at startup, never by inspecting
//! the extractor at runtime.

use crate::types::Embedding;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Benign: the image simply has no usable face.
    #[error("no face found")]
    NoFace,
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// A face embedding plus the detector's quality signal in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Embedding,
    pub quality: f32,
}

pub trait EmbeddingExtractor: Send {
    /// Short provider name for logs ("mock", "onnx").
    fn name(&self) -> &'static str;

    /// Version tag stamped on every embedding this extractor produces.
    fn model_version(&self) -> &str;

    fn extract(&mut self, image: &[u8]) -> Result<Extraction, ExtractError>;
}

/// Configured extractor variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Mock,
    Onnx,
}

impl FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "onnx" => Ok(Self::Onnx),
            other => Err(format!("unknown extractor {other:?} (expected mock or onnx)")),
        }
    }
}

pub const MOCK_MODEL_VERSION: &str = "mock-v1";
const MOCK_COMPONENT: f32 = 0.1;
const MOCK_QUALITY: f32 = 0.85;

/// Model-free extractor for development and demos.
///
/// Every recognisable image yields the same constant vector, so a single
/// enrolled mock embedding matches everything.
#[derive(Debug, Clone)]
pub struct MockExtractor {
    dimension: usize,
}

impl MockExtractor {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// The vector every recognisable image maps to.
    pub fn reference_embedding(&self) -> Embedding {
        Embedding::new(vec![MOCK_COMPONENT; self.dimension], MOCK_MODEL_VERSION)
    }
}

impl EmbeddingExtractor for MockExtractor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model_version(&self) -> &str {
        MOCK_MODEL_VERSION
    }

    fn extract(&mut self, image: &[u8]) -> Result<Extraction, ExtractError> {
        if image.is_empty() || image::guess_format(image).is_err() {
            return Err(ExtractError::NoFace);
        }
        Ok(Extraction {
            embedding: self.reference_embedding(),
            quality: MOCK_QUALITY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::new(8, 8).write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_mock_returns_constant_vector() {
        let mut mock = MockExtractor::new(128);
        let extraction = mock.extract(&png_bytes()).unwrap();
        assert_eq!(extraction.embedding.dimension(), 128);
        assert!(extraction.embedding.values.iter().all(|&v| v == 0.1));
        assert_eq!(extraction.embedding.model_version.as_deref(), Some(MOCK_MODEL_VERSION));
        assert!((extraction.quality - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_mock_empty_payload_has_no_face() {
        let mut mock = MockExtractor::new(4);
        assert_eq!(mock.extract(&[]), Err(ExtractError::NoFace));
    }

    #[test]
    fn test_mock_garbage_payload_has_no_face() {
        let mut mock = MockExtractor::new(4);
        assert_eq!(mock.extract(b"definitely not an image"), Err(ExtractError::NoFace));
    }

    #[test]
    fn test_extractor_kind_parse() {
        assert_eq!("mock".parse::<ExtractorKind>(), Ok(ExtractorKind::Mock));
        assert_eq!(" ONNX ".parse::<ExtractorKind>(), Ok(ExtractorKind::Onnx));
        assert!("dlib".parse::<ExtractorKind>().is_err());
    }
}
