use image::RgbImage;
use rollcall_core::{
    enroll, Descriptor, Embedder, EmbedderSpec, Enrollment, EnrollmentError, ExtractError, Extractor,
    FaceDetector, OnnxEmbedder, ScrfdDetector,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::detector::DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] rollcall_core::embedder::EmbedderError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the service to the engine thread.
enum EngineRequest {
    Extract {
        image: RgbImage,
        reply: oneshot::Sender<Result<Descriptor, EngineError>>,
    },
    Enroll {
        images: Vec<RgbImage>,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    dimension: usize,
}

impl EngineHandle {
    /// Descriptor dimensionality of the loaded embedder.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Request one descriptor for the primary face in `image`.
    pub async fn extract(&self, image: RgbImage) -> Result<Descriptor, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request an enrollment descriptor averaged over `images`.
    pub async fn enroll(&self, images: Vec<RgbImage>) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { images, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the SCRFD detector and the ONNX embedder. Fails fast on a missing model.
pub fn load_models(
    detector_path: &str,
    embedder_path: &str,
    spec: EmbedderSpec,
) -> Result<Extractor<ScrfdDetector, OnnxEmbedder>, EngineError> {
    let detector = ScrfdDetector::load(detector_path)?;
    tracing::info!(path = detector_path, "SCRFD detector loaded");

    let embedder = OnnxEmbedder::load(embedder_path, spec)?;
    tracing::info!(
        path = embedder_path,
        dimension = spec.dimension,
        normalization = ?spec.normalization,
        "embedder loaded"
    );

    Ok(Extractor::new(detector, embedder))
}

/// Move `extractor` onto a dedicated OS thread and return a handle to it.
///
/// Requests are served one at a time; concurrent callers queue on the channel.
pub fn spawn_engine<D, E>(mut extractor: Extractor<D, E>) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + Send + 'static,
    E: Embedder + Send + 'static,
{
    let dimension = extractor.dimension();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = extractor.extract(&image).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll { images, reply } => {
                        tracing::debug!(images = images.len(), "enroll request");
                        let result = enroll(&mut extractor, &images).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, dimension })
}
