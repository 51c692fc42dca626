use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use image::ImageReader;
use sightline_common::frame::{Frame, PixelLayout};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptureError, FrameSource};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
/// Longest silence tolerated between two chunks before reconnecting.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse state for a multipart JPEG stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--{boundary}\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
///
/// Bytes are pushed as they arrive from the network; complete JPEG parts are
/// popped with [`MultipartParser::next_part`]. Boundaries may span chunks.
pub struct MultipartParser {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the closing boundary.
    scanned: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scanned: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::SeekingBoundary;
        self.scanned = 0;
    }

    /// Pop the next complete, non-empty JPEG part, if one is buffered.
    pub fn next_part(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        let _ = self.buffer.split_to(pos + self.marker.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > self.marker.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.marker.len());
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.scanned = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scanned..], &self.marker)
                    else {
                        self.scanned = self.buffer.len().saturating_sub(self.marker.len());
                        return None;
                    };
                    let jpeg_end = self.scanned + pos;
                    // Strip the CRLF that precedes the boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let part = self.buffer.split_to(jpeg_end + self.marker.len());
                    self.state = ParseState::SeekingHeaderEnd;
                    if end > 0 {
                        return Some(part.freeze().slice(..end));
                    }
                }
            }
        }
    }
}

/// Frame source reading an MJPEG camera stream over HTTP.
///
/// A broken connection surfaces as one transient read error; the following
/// read reconnects.
pub struct MjpegSource {
    url: String,
    client: reqwest::Client,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MultipartParser,
    read_timeout: Duration,
    seq: u64,
    closed: bool,
}

impl MjpegSource {
    /// Connect to `url`. Failing to reach the camera here is fatal for the
    /// caller; later failures are retried on read.
    pub async fn open(url: &str) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(CaptureError::HttpConnect)?;
        let mut source = Self {
            url: url.to_string(),
            client,
            stream: None,
            parser: MultipartParser::new(DEFAULT_BOUNDARY),
            read_timeout: DEFAULT_READ_TIMEOUT,
            seq: 0,
            closed: false,
        };
        source.connect().await?;
        Ok(source)
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.parser.reset();
    }

    async fn connect(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

        info!(status = %response.status(), boundary, "connected to MJPEG stream");

        self.parser = MultipartParser::new(&boundary);
        self.stream = Some(response.bytes_stream().boxed());
        Ok(())
    }

    fn decode(&mut self, jpeg: &[u8]) -> Result<Frame, CaptureError> {
        let image = ImageReader::new(Cursor::new(jpeg))
            .with_guessed_format()
            .map_err(|e| CaptureError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| CaptureError::Decode(e.to_string()))?
            .to_rgb8();
        let seq = self.seq;
        self.seq += 1;
        let (width, height) = image.dimensions();
        Ok(Frame::new(width, height, PixelLayout::Rgb8, image.into_raw(), seq))
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.closed {
            return Ok(None);
        }
        if self.stream.is_none() {
            self.connect().await?;
        }

        loop {
            if let Some(jpeg) = self.parser.next_part() {
                debug!(bytes = jpeg.len(), "MJPEG part received");
                return self.decode(&jpeg).map(Some);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(CaptureError::HttpStream("not connected".into()));
            };
            let next = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        timeout_ms = self.read_timeout.as_millis() as u64,
                        "MJPEG stream stalled, will reconnect"
                    );
                    self.drop_connection();
                    return Err(CaptureError::HttpStream("no data before read timeout".into()));
                }
            };
            match next {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, "MJPEG stream error, will reconnect");
                    self.drop_connection();
                    return Err(CaptureError::HttpStream(e.to_string()));
                }
                None => {
                    warn!("MJPEG stream ended, will reconnect");
                    self.drop_connection();
                    return Err(CaptureError::HttpStream("stream ended".into()));
                }
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.drop_connection();
            info!(url = self.url, "MJPEG source closed");
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Extract the `boundary` parameter of a multipart content type.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .map(|b| b.strip_prefix("--").unwrap_or(b))
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            out.extend_from_slice(part);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--frame\r\n");
        out
    }

    #[test]
    fn splits_parts_in_a_single_chunk() {
        let mut parser = MultipartParser::new("frame");
        parser.push(&body(&[b"first", b"second"]));
        assert_eq!(parser.next_part().unwrap().as_ref(), b"first");
        assert_eq!(parser.next_part().unwrap().as_ref(), b"second");
        assert!(parser.next_part().is_none());
    }

    #[test]
    fn boundary_spanning_chunks_is_found() {
        let data = body(&[b"\xFF\xD8jpegbytes\xFF\xD9"]);
        let mut parser = MultipartParser::new("frame");
        let mut parts = Vec::new();
        for byte in data.chunks(3) {
            parser.push(byte);
            while let Some(part) = parser.next_part() {
                parts.push(part);
            }
        }
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_ref(), b"\xFF\xD8jpegbytes\xFF\xD9");
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut data = b"HTTP preamble noise".to_vec();
        data.extend(body(&[b"payload"]));
        let mut parser = MultipartParser::new("frame");
        parser.push(&data);
        assert_eq!(parser.next_part().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn reset_discards_partial_part() {
        let mut parser = MultipartParser::new("frame");
        parser.push(b"--frame\r\n\r\nhalf a jpe");
        assert!(parser.next_part().is_none());
        parser.reset();
        parser.push(&body(&[b"whole"]));
        assert_eq!(parser.next_part().unwrap().as_ref(), b"whole");
    }

    #[test]
    fn boundary_parameter_is_parsed() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--cam\"").as_deref(),
            Some("cam")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[tokio::test]
    async fn stalled_stream_is_a_read_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n",
                )
                .await
                .unwrap();
            // Headers sent, then nothing
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let mut source = MjpegSource::open(&format!("http://{addr}/stream"))
            .await
            .unwrap()
            .with_read_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = source.read_frame().await.unwrap_err();
        assert!(matches!(err, CaptureError::HttpStream(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(source.stream.is_none());
    }
}
