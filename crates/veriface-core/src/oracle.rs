//! Boundaries to the opaque collaborators: landmark/embedding model, camera
//! and speech-to-text.
//!
//! Model inference is blocking and is always driven from
//! `tokio::task::spawn_blocking`. The camera is only touched by the liveness
//! owner task, through a [`CameraGuard`] that releases it exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Descriptor, LandmarkFrame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("landmark oracle unavailable: {0}")]
    Unavailable(String),
    #[error("frame could not be decoded: {0}")]
    InvalidFrame(String),
    #[error("oracle protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera I/O error: {0}")]
    Io(String),
}

/// One encoded image (PNG or JPEG) pulled from the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub captured_at: DateTime<Utc>,
    pub image: Vec<u8>,
}

impl Frame {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            captured_at: Utc::now(),
            image,
        }
    }
}

/// Face landmark, embedding and antispoof model.
///
/// Returns zero or one detection per frame. Implementations block.
pub trait LandmarkOracle: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkFrame>, OracleError>;

    /// Embedding of the single face in a stored image, used to build the
    /// reference descriptor at the start of the liveness phase.
    fn describe(&self, image: &[u8]) -> Result<Option<Descriptor>, OracleError> {
        let frame = Frame::new(image.to_vec());
        Ok(self.detect(&frame)?.map(|f| f.descriptor))
    }
}

pub trait Camera: Send {
    fn open(&mut self) -> Result<(), CameraError>;

    /// Grab the current frame. `Ok(None)` when no frame is ready yet.
    fn capture(&mut self) -> Result<Option<Frame>, CameraError>;

    fn release(&mut self);
}

/// Holds an opened camera and releases it on every exit path.
pub struct CameraGuard {
    camera: Box<dyn Camera>,
    released: bool,
}

impl CameraGuard {
    pub fn acquire(mut camera: Box<dyn Camera>) -> Result<Self, CameraError> {
        camera.open()?;
        tracing::debug!("camera acquired");
        Ok(Self {
            camera,
            released: false,
        })
    }

    pub fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.released {
            return Err(CameraError::Unavailable("camera already released".into()));
        }
        self.camera.capture()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if !self.released {
            self.camera.release();
            self.released = true;
            tracing::debug!("camera released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CameraGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Stream of best-guess transcripts from a speech recogniser.
#[async_trait]
pub trait SpeechOracle: Send {
    /// Next transcript, or `None` once the recogniser has stopped for good.
    async fn next_transcript(&mut self) -> Option<String>;
}

#[async_trait]
impl SpeechOracle for mpsc::Receiver<String> {
    async fn next_transcript(&mut self) -> Option<String> {
        self.recv().await
    }
}
