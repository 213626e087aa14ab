use presence_core::onnx::OnnxExtractor;
use presence_core::{EmbeddingExtractor, ExtractError, Extraction, ExtractorKind, MockExtractor};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("model load failed: {0}")]
    Load(#[from] presence_core::onnx::OnnxError),
    #[error("engine needs at least one extractor")]
    NoExtractors,
    #[error("extractors disagree on model version: {0} vs {1}")]
    MixedVersions(String, String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the pipeline to the engine workers.
struct ExtractRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Extraction, ExtractError>>,
}

/// Clone-safe handle to the engine worker threads.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ExtractRequest>,
    provider: &'static str,
    model_version: Arc<str>,
}

impl EngineHandle {
    /// Extract an embedding from encoded image bytes.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Extraction, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ExtractRequest { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Extractor variant name ("mock", "onnx").
    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Model version stamped on every embedding the engine produces.
    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Build `count` extractors of the configured kind.
///
/// ONNX sessions are loaded synchronously so a missing model file stops the
/// daemon at startup instead of failing the first snapshot.
pub fn load_extractors(
    kind: ExtractorKind,
    model_dir: &Path,
    dimension: usize,
    count: usize,
) -> Result<Vec<Box<dyn EmbeddingExtractor>>, EngineError> {
    (0..count.max(1))
        .map(|_| -> Result<Box<dyn EmbeddingExtractor>, EngineError> {
            match kind {
                ExtractorKind::Mock => Ok(Box::new(MockExtractor::new(dimension))),
                ExtractorKind::Onnx => Ok(Box::new(OnnxExtractor::load(model_dir)?)),
            }
        })
        .collect()
}

/// Spawn one OS thread per extractor, all fed from a single queue.
pub fn spawn_engine(extractors: Vec<Box<dyn EmbeddingExtractor>>) -> Result<EngineHandle, EngineError> {
    let first = extractors.first().ok_or(EngineError::NoExtractors)?;
    let provider = first.name();
    let model_version: Arc<str> = Arc::from(first.model_version());
    if let Some(other) = extractors.iter().find(|e| e.model_version() != &*model_version) {
        return Err(EngineError::MixedVersions(
            model_version.to_string(),
            other.model_version().to_string(),
        ));
    }

    let workers = extractors.len();
    let (tx, rx) = mpsc::channel::<ExtractRequest>(workers * 4);
    let rx = Arc::new(Mutex::new(rx));

    for (index, extractor) in extractors.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("presence-engine-{index}"))
            .spawn(move || run_worker(index, extractor, &rx))
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(provider, model_version = %model_version, workers, "extraction engine started");
    Ok(EngineHandle {
        tx,
        provider,
        model_version,
    })
}

fn run_worker(index: usize, mut extractor: Box<dyn EmbeddingExtractor>, rx: &Mutex<mpsc::Receiver<ExtractRequest>>) {
    tracing::debug!(worker = index, "engine worker started");
    loop {
        let request = match rx.lock() {
            Ok(mut rx) => rx.blocking_recv(),
            Err(_) => None,
        };
        let Some(ExtractRequest { image, reply }) = request else {
            break;
        };

        let started = std::time::Instant::now();
        let result = extractor.extract(&image);
        tracing::debug!(
            worker = index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "extraction finished"
        );
        // Receiver is gone when the caller timed out.
        let _ = reply.send(result);
    }
    tracing::debug!(worker = index, "engine worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use presence_core::Embedding;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    fn png() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::new(120, 120).write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    struct Sleepy {
        delay: Duration,
    }

    impl EmbeddingExtractor for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn model_version(&self) -> &str {
            "sleepy-v1"
        }

        fn extract(&mut self, _image: &[u8]) -> Result<Extraction, ExtractError> {
            std::thread::sleep(self.delay);
            Ok(Extraction {
                embedding: Embedding::new(vec![1.0, 0.0], "sleepy-v1"),
                quality: 1.0,
            })
        }
    }

    #[tokio::test]
    async fn test_mock_engine_extracts() {
        let engine = spawn_engine(load_extractors(ExtractorKind::Mock, Path::new("/nonexistent"), 8, 2).unwrap()).unwrap();
        assert_eq!(engine.provider(), "mock");
        assert_eq!(engine.model_version(), presence_core::extractor::MOCK_MODEL_VERSION);

        let extraction = engine.extract(png()).await.unwrap();
        assert_eq!(extraction.embedding.dimension(), 8);
    }

    #[tokio::test]
    async fn test_no_face_is_propagated() {
        let engine = spawn_engine(vec![Box::new(MockExtractor::new(4))]).unwrap();
        let err = engine.extract(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::NoFace)));
    }

    #[test]
    fn test_missing_onnx_models_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_extractors(ExtractorKind::Onnx, dir.path(), 512, 1);
        assert!(matches!(result, Err(EngineError::Load(_))));
    }

    #[test]
    fn test_empty_engine_rejected() {
        assert!(matches!(spawn_engine(Vec::new()), Err(EngineError::NoExtractors)));
    }

    #[test]
    fn test_mixed_versions_rejected() {
        let extractors: Vec<Box<dyn EmbeddingExtractor>> = vec![
            Box::new(MockExtractor::new(4)),
            Box::new(Sleepy {
                delay: Duration::ZERO,
            }),
        ];
        assert!(matches!(spawn_engine(extractors), Err(EngineError::MixedVersions(..))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_run_in_parallel() {
        let delay = Duration::from_millis(300);
        let extractors: Vec<Box<dyn EmbeddingExtractor>> =
            (0..4).map(|_| Box::new(Sleepy { delay }) as Box<dyn EmbeddingExtractor>).collect();
        let engine = spawn_engine(extractors).unwrap();

        let started = Instant::now();
        let calls = (0..4).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.extract(vec![0]).await })
        });
        for call in calls.collect::<Vec<_>>() {
            call.await.unwrap().unwrap();
        }
        // four sequential extractions would take 1.2s
        assert!(started.elapsed() < Duration::from_millis(1100));
    }
}
