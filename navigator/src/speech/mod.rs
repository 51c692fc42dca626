pub mod artifact;
pub mod command;
pub mod openai;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use artifact::AudioArtifact;

/// Jobs allowed to wait behind the one being played.
const QUEUE_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("audio artifact error: {0}")]
    Artifact(String),
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("speech HTTP error: {0}")]
    Http(String),
    #[error("speech service returned HTTP status {0}")]
    Status(u16),
}

/// Renders text into an audio file at `out`.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<(), SpeechError>;

    /// File extension of the audio this synthesizer produces.
    fn extension(&self) -> &str {
        "mp3"
    }

    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Plays an audio file, returning once it has been heard in full.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, path: &Path) -> Result<(), SpeechError>;

    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    Spoken,
    /// Synthesis or playback failed; the worker waited out the estimated
    /// speaking time instead.
    Degraded,
    /// The playback worker is gone.
    Unavailable,
}

/// Decrements the pending-job count when the job is finished or abandoned.
struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Pending(Arc::clone(counter))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SpeechJob {
    text: String,
    done: oneshot::Sender<SpeechOutcome>,
    _pending: Pending,
}

/// Handle to the playback worker.
///
/// Jobs are rendered strictly one after another on a dedicated task, so the
/// capture loop never waits on synthesis or audio hardware. Each job writes to
/// its own uniquely named artifact, which is deleted once the job ends
/// whatever the outcome.
#[derive(Clone)]
pub struct SpeechPlayer {
    jobs: mpsc::Sender<SpeechJob>,
    pending: Arc<AtomicUsize>,
}

pub struct PlaybackWorker {
    synthesizer: Arc<dyn Synthesizer>,
    player: Arc<dyn AudioPlayer>,
    voice: String,
    artifact_dir: PathBuf,
    fallback_chars_per_sec: f64,
}

impl PlaybackWorker {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        player: Arc<dyn AudioPlayer>,
        voice: &str,
        artifact_dir: PathBuf,
        fallback_chars_per_sec: f64,
    ) -> Self {
        Self {
            synthesizer,
            player,
            voice: voice.to_string(),
            artifact_dir,
            fallback_chars_per_sec,
        }
    }

    async fn run(self, mut jobs: mpsc::Receiver<SpeechJob>) {
        debug!(
            synthesizer = self.synthesizer.name(),
            player = self.player.name(),
            "speech worker started"
        );
        while let Some(job) = jobs.recv().await {
            let SpeechJob {
                text,
                done,
                _pending,
            } = job;
            let outcome = self.render(&text).await;
            drop(_pending);
            let _ = done.send(outcome);
        }
        debug!("speech worker stopped");
    }

    async fn render(&self, text: &str) -> SpeechOutcome {
        info!(chars = text.chars().count(), text, "speaking");
        match self.synthesize_and_play(text).await {
            Ok(()) => SpeechOutcome::Spoken,
            Err(e) => {
                let wait = fallback_delay(text, self.fallback_chars_per_sec);
                warn!(
                    stage = "speech",
                    error = %e,
                    fallback_ms = wait.as_millis() as u64,
                    "speech failed, pacing with silent wait"
                );
                tokio::time::sleep(wait).await;
                SpeechOutcome::Degraded
            }
        }
    }

    async fn synthesize_and_play(&self, text: &str) -> Result<(), SpeechError> {
        let artifact = AudioArtifact::create(&self.artifact_dir, self.synthesizer.extension())?;
        let result = async {
            self.synthesizer
                .synthesize(text, &self.voice, artifact.path())
                .await?;
            self.player.play(artifact.path()).await
        }
        .await;
        artifact.remove();
        result
    }
}

impl SpeechPlayer {
    /// Start the playback worker on the current runtime.
    pub fn spawn(worker: PlaybackWorker) -> Self {
        let (jobs, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(worker.run(rx));
        Self {
            jobs,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue `text` and wait until it has been spoken (or the fallback wait
    /// has elapsed).
    pub async fn speak(&self, text: impl Into<String>) -> SpeechOutcome {
        let (done, rx) = oneshot::channel();
        let job = SpeechJob {
            text: text.into(),
            done,
            _pending: Pending::new(&self.pending),
        };
        if self.jobs.send(job).await.is_err() {
            warn!(stage = "speech", "speech worker is not running");
            return SpeechOutcome::Unavailable;
        }
        rx.await.unwrap_or(SpeechOutcome::Unavailable)
    }

    /// Whether any job is queued or being played.
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
}

/// Rough time it would take to say `text` aloud.
pub fn fallback_delay(text: &str, chars_per_sec: f64) -> Duration {
    if chars_per_sec <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(text.chars().count() as f64 / chars_per_sec)
}
