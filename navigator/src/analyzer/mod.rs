pub mod openai;

use async_trait::async_trait;
use sightline_common::config::{AnalysisConfig, DetailLevel};
use sightline_common::frame::EncodedImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Instruction sent with every frame. Ordered by what matters most to someone
/// walking without sight.
pub const NAVIGATION_PROMPT: &str = "\
You are guiding a blind pedestrian. Describe this view in one or two short \
sentences that can be spoken in under three seconds. Mention, in this order of \
priority: immediate obstacles or hazards; open paths and which direction they \
lead; rough distance to key objects (near or far, never exact); where people \
are relative to the viewer (left, right, ahead); doorways, stairs, curbs or \
other changes in elevation. Leave out colours, decoration and anything else \
that does not help the person move safely.";

/// One request to the vision service.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub model: String,
    pub prompt: &'static str,
    pub image: EncodedImage,
    pub detail: DetailLevel,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("request timed out")]
    Timeout,
    #[error("authentication rejected by vision service")]
    Unauthorized,
    #[error("rate limited by vision service")]
    RateLimited,
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("service returned no description")]
    Empty,
}

/// Remote service turning an image into a description.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn describe(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;

    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Outcome of one [`SceneAnalyzer::analyze`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisResult {
    Described(String),
    /// Another request was still in flight; nothing was sent.
    Dropped,
    /// The request was sent and failed.
    Failed,
}

impl AnalysisResult {
    pub fn description(&self) -> Option<&str> {
        match self {
            AnalysisResult::Described(text) => Some(text),
            AnalysisResult::Dropped | AnalysisResult::Failed => None,
        }
    }
}

/// Single-flight front end for a [`VisionClient`].
///
/// At most one request is outstanding at a time. A call arriving while one is
/// in flight is dropped rather than queued, since a stale description is worth
/// less than a fresh one on the next cadence tick. Errors never escape: they
/// are logged and reported as [`AnalysisResult::Failed`].
pub struct SceneAnalyzer {
    client: Arc<dyn VisionClient>,
    in_progress: AtomicBool,
    model: String,
    detail: DetailLevel,
    max_tokens: u32,
    temperature: f32,
}

/// Clears the in-progress flag when dropped, so every exit path of
/// `analyze` (including cancellation of the future) releases it.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SceneAnalyzer {
    pub fn new(client: Arc<dyn VisionClient>, config: &AnalysisConfig) -> Self {
        Self {
            client,
            in_progress: AtomicBool::new(false),
            model: config.model.clone(),
            detail: config.detail,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    pub fn is_analyzing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub async fn analyze(&self, image: EncodedImage) -> AnalysisResult {
        let Some(_guard) = InFlight::acquire(&self.in_progress) else {
            debug!(seq = image.seq, "analysis already in flight, dropping frame");
            return AnalysisResult::Dropped;
        };

        let seq = image.seq;
        let request = AnalysisRequest {
            model: self.model.clone(),
            prompt: NAVIGATION_PROMPT,
            image,
            detail: self.detail,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        info!(
            seq,
            client = self.client.name(),
            payload_bytes = request.image.payload_size(),
            "analyzing frame"
        );
        let started = Instant::now();

        match self.client.describe(&request).await {
            Ok(text) if !text.trim().is_empty() => {
                info!(
                    seq,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    description = text.as_str(),
                    "frame described"
                );
                AnalysisResult::Described(text.trim().to_string())
            }
            Ok(_) => {
                warn!(seq, stage = "analysis", "vision service returned an empty description");
                AnalysisResult::Failed
            }
            Err(e) => {
                warn!(
                    seq,
                    stage = "analysis",
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "frame analysis failed"
                );
                AnalysisResult::Failed
            }
        }
    }
}
