#[cfg(feature = "camera")]
pub mod device;
pub mod mjpeg;

use async_trait::async_trait;
use sightline_common::frame::Frame;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open frame source: {0}")]
    Open(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("HTTP stream error: {0}")]
    HttpStream(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("preview error: {0}")]
    Preview(String),
}

/// Pull-based producer of camera frames.
///
/// `read_frame` returning `Ok(None)` means the source is exhausted. An `Err`
/// is a transient failure: the caller skips the tick and reads again later.
#[async_trait]
pub trait FrameSource: Send {
    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying device. Safe to call more than once.
    fn close(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewEvent {
    Continue,
    /// The operator asked to quit (e.g. pressed `q` in the preview window).
    Quit,
}

/// Consumer that displays each captured frame.
pub trait Preview: Send {
    fn show(&mut self, frame: &Frame) -> Result<PreviewEvent, CaptureError>;

    fn close(&mut self) {}
}

/// Preview for headless runs: frames are dropped after the cadence check.
pub struct Headless;

impl Preview for Headless {
    fn show(&mut self, _frame: &Frame) -> Result<PreviewEvent, CaptureError> {
        Ok(PreviewEvent::Continue)
    }
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame().await
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: Preview + ?Sized> Preview for Box<T> {
    fn show(&mut self, frame: &Frame) -> Result<PreviewEvent, CaptureError> {
        (**self).show(frame)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
