//! Audio capture for voice input.
//!
//! Capture hardware is behind the [`Microphone`] trait so the pipeline
//! works the same over a real device, a file, or a test double. The
//! recognizer is chosen once at startup: server-side transcription when
//! the backend supports it, a local engine otherwise, or nothing.

use std::io::Read;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no audio input available")]
    Unavailable,
    #[error("audio capture failed: {0}")]
    Io(#[from] std::io::Error),
}

/// An audio input device that can be opened for one recording at a time.
pub trait Microphone: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// One in-progress recording. Dropping it discards the capture.
pub trait CaptureStream: Send {
    /// Stop recording and return the encoded audio.
    fn finish(self: Box<Self>) -> Result<Bytes, CaptureError>;
}

/// Reads pre-encoded audio from a path (a file or a FIFO fed by an
/// external capture tool).
pub struct FileMicrophone {
    path: PathBuf,
}

impl FileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Microphone for FileMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        debug!(path = %self.path.display(), "opening audio input");
        Ok(Box::new(FileCapture {
            path: self.path.clone(),
        }))
    }
}

struct FileCapture {
    path: PathBuf,
}

impl CaptureStream for FileCapture {
    fn finish(self: Box<Self>) -> Result<Bytes, CaptureError> {
        let mut file = std::fs::File::open(&self.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Err(CaptureError::Unavailable);
        }
        Ok(Bytes::from(buf))
    }
}

/// Local speech recognizer producing exactly one finalized transcript
/// per recording.
pub trait LocalRecognizer: Send {
    fn recognize(&mut self, audio: &[u8]) -> Result<String, CaptureError>;
}

/// Where transcription happens. Selected once at startup.
pub enum Transcriber {
    /// Upload to the backend's transcription endpoint.
    Server,
    /// Run a local recognizer over the captured bytes.
    Local(Box<dyn LocalRecognizer>),
    /// No transcription path; recording is disabled.
    Unavailable,
}

/// Owns the microphone and the active recording, and enforces one
/// capture at a time.
pub struct AudioPipeline {
    microphone: Option<Box<dyn Microphone>>,
    pub transcriber: Transcriber,
    active: Option<Box<dyn CaptureStream>>,
}

impl AudioPipeline {
    pub fn new(microphone: Box<dyn Microphone>, transcriber: Transcriber) -> Self {
        Self {
            microphone: Some(microphone),
            transcriber,
            active: None,
        }
    }

    /// A pipeline with no input device. `start` always fails.
    pub fn unavailable() -> Self {
        Self {
            microphone: None,
            transcriber: Transcriber::Unavailable,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Ok(());
        }
        if matches!(self.transcriber, Transcriber::Unavailable) {
            return Err(CaptureError::Unavailable);
        }
        let microphone = self.microphone.as_ref().ok_or(CaptureError::Unavailable)?;
        self.active = Some(microphone.open()?);
        Ok(())
    }

    /// Stop the active recording and return the captured audio.
    /// The device is released on every path, including errors.
    pub fn stop(&mut self) -> Result<Bytes, CaptureError> {
        let stream = self.active.take().ok_or(CaptureError::Unavailable)?;
        stream.finish()
    }

    /// Discard the active recording without transcribing.
    pub fn abort(&mut self) {
        self.active = None;
    }
}
