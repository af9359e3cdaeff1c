use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veriface_core::{Descriptor, FaceMatcher, Frame, LandmarkOracle, OracleError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of checking a login snapshot against a stored descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyOutcome {
    NoFace,
    Spoof { score: f32 },
    Mismatch { distance: Option<f32> },
    Match { distance: f32 },
}

enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Descriptor, EngineError>>,
    },
    Verify {
        image: Vec<u8>,
        reference: Descriptor,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Compute the reference descriptor for a signup image.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<Descriptor, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn verify(
        &self,
        image: Vec<u8>,
        reference: Descriptor,
    ) -> Result<VerifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                image,
                reference,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Oracle calls block, so they are serialized here instead of occupying
/// runtime workers. The thread exits when every handle is dropped.
pub fn spawn_engine(
    oracle: Box<dyn LandmarkOracle>,
    matcher: FaceMatcher,
    antispoof_threshold: f32,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("veriface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let _ = reply.send(run_enroll(oracle.as_ref(), image));
                    }
                    EngineRequest::Verify {
                        image,
                        reference,
                        reply,
                    } => {
                        let result = run_verify(
                            oracle.as_ref(),
                            &matcher,
                            antispoof_threshold,
                            image,
                            &reference,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_enroll(oracle: &dyn LandmarkOracle, image: Vec<u8>) -> Result<Descriptor, EngineError> {
    let descriptor = oracle.describe(&image)?.ok_or(EngineError::NoFaceDetected)?;
    tracing::debug!(dim = descriptor.len(), "enroll: descriptor computed");
    Ok(descriptor)
}

fn run_verify(
    oracle: &dyn LandmarkOracle,
    matcher: &FaceMatcher,
    antispoof_threshold: f32,
    image: Vec<u8>,
    reference: &Descriptor,
) -> Result<VerifyOutcome, EngineError> {
    let Some(face) = oracle.detect(&Frame::new(image))? else {
        return Ok(VerifyOutcome::NoFace);
    };

    // Frames without a score pass; the sidecar may run without an antispoof model.
    if let Some(score) = face.spoof_score {
        if score < antispoof_threshold {
            tracing::info!(score, threshold = antispoof_threshold, "verify: spoof rejected");
            return Ok(VerifyOutcome::Spoof { score });
        }
    }

    let result = matcher.compare(&face.descriptor, reference);
    tracing::debug!(matched = result.matched, distance = ?result.distance, "verify: compared");
    Ok(match (result.matched, result.distance) {
        (true, Some(distance)) => VerifyOutcome::Match { distance },
        (_, distance) => VerifyOutcome::Mismatch { distance },
    })
}
