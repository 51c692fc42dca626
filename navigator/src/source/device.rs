//! Local capture devices and the preview window, through OpenCV.

use async_trait::async_trait;
use opencv::core::{Mat, Vec3b};
use opencv::prelude::*;
use opencv::videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH};
use opencv::highgui;
use sightline_common::frame::{Frame, PixelLayout};
use tracing::{debug, info, warn};

use super::{CaptureError, FrameSource, Preview, PreviewEvent};

const WINDOW_NAME: &str = "Sightline";

/// Camera opened by device index.
pub struct DeviceSource {
    index: i32,
    capture: Option<VideoCapture>,
    seq: u64,
}

impl DeviceSource {
    /// Open the device and request a resolution and frame rate. The device is
    /// free to pick something else; what it actually reports is logged.
    pub fn open(index: i32, width: u32, height: u32, fps: f64) -> Result<Self, CaptureError> {
        let mut capture = VideoCapture::new(index, CAP_ANY)
            .map_err(|e| CaptureError::Open(format!("camera {index}: {e}")))?;

        let opened = capture
            .is_opened()
            .map_err(|e| CaptureError::Open(format!("camera {index}: {e}")))?;
        if !opened {
            return Err(CaptureError::Open(format!("camera {index} could not be opened")));
        }

        for (prop, value, label) in [
            (CAP_PROP_FRAME_WIDTH, width as f64, "width"),
            (CAP_PROP_FRAME_HEIGHT, height as f64, "height"),
            (CAP_PROP_FPS, fps, "fps"),
        ] {
            match capture.set(prop, value) {
                Ok(true) => {}
                Ok(false) => warn!(camera = index, property = label, value, "camera ignored setting"),
                Err(e) => warn!(camera = index, property = label, error = %e, "failed to set camera property"),
            }
        }

        info!(
            camera = index,
            width = capture.get(CAP_PROP_FRAME_WIDTH).unwrap_or_default(),
            height = capture.get(CAP_PROP_FRAME_HEIGHT).unwrap_or_default(),
            fps = capture.get(CAP_PROP_FPS).unwrap_or_default(),
            "camera opened"
        );

        Ok(Self {
            index,
            capture: Some(capture),
            seq: 0,
        })
    }
}

/// Blocking read of one BGR frame.
fn grab(capture: &mut VideoCapture) -> Result<(u32, u32, Vec<u8>), CaptureError> {
    let mut mat = Mat::default();
    let grabbed = capture
        .read(&mut mat)
        .map_err(|e| CaptureError::Read(e.to_string()))?;
    if !grabbed || mat.empty() {
        return Err(CaptureError::Read("device returned no frame".into()));
    }
    if mat.channels() != 3 {
        return Err(CaptureError::Read(format!(
            "expected 3 channels, got {}",
            mat.channels()
        )));
    }
    let pixels = mat
        .data_bytes()
        .map_err(|e| CaptureError::Read(e.to_string()))?
        .to_vec();
    Ok((mat.cols() as u32, mat.rows() as u32, pixels))
}

#[async_trait]
impl FrameSource for DeviceSource {
    /// The OpenCV read blocks until the driver delivers a frame, so it runs on
    /// the blocking pool. The device travels with the read and comes back
    /// afterwards; if the caller gives up on the read, the device is
    /// released when the read finishes.
    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(mut capture) = self.capture.take() else {
            return Ok(None);
        };

        let (capture, grabbed) = tokio::task::spawn_blocking(move || {
            let grabbed = grab(&mut capture);
            (capture, grabbed)
        })
        .await
        .map_err(|e| CaptureError::Read(format!("capture task failed: {e}")))?;
        self.capture = Some(capture);

        let (width, height, pixels) = grabbed?;
        let seq = self.seq;
        self.seq += 1;
        Ok(Some(Frame::new(width, height, PixelLayout::Bgr8, pixels, seq)))
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!(camera = self.index, error = %e, "failed to release camera");
            }
            info!(camera = self.index, "camera released");
        }
    }

    fn name(&self) -> &str {
        "device"
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// HighGUI window showing the live feed. Pressing `q` requests shutdown.
pub struct WindowPreview {
    open: bool,
}

impl WindowPreview {
    pub fn new() -> Result<Self, CaptureError> {
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)
            .map_err(|e| CaptureError::Preview(e.to_string()))?;
        Ok(Self { open: true })
    }
}

impl Preview for WindowPreview {
    fn show(&mut self, frame: &Frame) -> Result<PreviewEvent, CaptureError> {
        let bgr: Vec<Vec3b> = frame
            .pixels
            .chunks_exact(3)
            .map(|px| match frame.layout {
                PixelLayout::Bgr8 => Vec3b::from([px[0], px[1], px[2]]),
                PixelLayout::Rgb8 => Vec3b::from([px[2], px[1], px[0]]),
            })
            .collect();
        let mat = Mat::from_slice_rows_cols(&bgr, frame.height as usize, frame.width as usize)
            .map_err(|e| CaptureError::Preview(e.to_string()))?;
        highgui::imshow(WINDOW_NAME, &mat).map_err(|e| CaptureError::Preview(e.to_string()))?;

        let key = highgui::wait_key(1).map_err(|e| CaptureError::Preview(e.to_string()))?;
        if key >= 0 && (key & 0xFF) == i32::from(b'q') {
            debug!("quit key pressed");
            return Ok(PreviewEvent::Quit);
        }
        Ok(PreviewEvent::Continue)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = highgui::destroy_all_windows() {
                warn!(error = %e, "failed to close preview window");
            }
        }
    }
}

impl Drop for WindowPreview {
    fn drop(&mut self) {
        self.close();
    }
}
