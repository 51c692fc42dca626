use std::sync::Arc;
use std::time::Duration;

use sightline_common::encoder::FrameEncoder;
use sightline_common::frame::Frame;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analyzer::{AnalysisResult, SceneAnalyzer};
use crate::source::{CaptureError, FrameSource, Preview, PreviewEvent};
use crate::speech::{SpeechOutcome, SpeechPlayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Capture has ended; waiting out in-flight cycles.
    Stopping,
    Stopped,
}

/// When the next analysis may start.
///
/// `last_analysis` is the cadence reference: the instant a cycle was
/// triggered, moved forward to the instant speech ended for cycles that
/// spoke.
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    last_analysis: Option<Instant>,
}

impl Schedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_analysis: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_analysis {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, at: Instant) {
        self.last_analysis = Some(at);
    }
}

/// Counters for one capture session, logged when the loop stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub read_errors: u64,
    pub preview_errors: u64,
    pub cycles: u64,
    pub encode_failures: u64,
    pub described: u64,
    pub dropped: u64,
    pub failed: u64,
    pub spoken: u64,
    pub degraded: u64,
    /// Cycles still running when the grace period ran out.
    pub detached: u64,
}

impl SessionStats {
    pub fn log_summary(&self, elapsed: Duration) {
        info!(
            frames = self.frames,
            read_errors = self.read_errors,
            preview_errors = self.preview_errors,
            cycles = self.cycles,
            described = self.described,
            dropped = self.dropped,
            failed = self.failed,
            encode_failures = self.encode_failures,
            spoken = self.spoken,
            degraded = self.degraded,
            detached = self.detached,
            "session complete after {:.1}s",
            elapsed.as_secs_f32()
        );
    }

    fn record(&mut self, schedule: &mut Schedule, joined: Result<CycleReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                warn!(stage = "cycle", error = %e, "analysis cycle task failed");
                return;
            }
        };
        match report.outcome {
            CycleOutcome::EncodeFailed => self.encode_failures += 1,
            CycleOutcome::Dropped => self.dropped += 1,
            CycleOutcome::Failed => self.failed += 1,
            CycleOutcome::Spoke(speech) => {
                self.described += 1;
                match speech {
                    SpeechOutcome::Spoken => self.spoken += 1,
                    SpeechOutcome::Degraded | SpeechOutcome::Unavailable => self.degraded += 1,
                }
                // Next interval is measured from the end of speech
                schedule.mark(report.finished_at);
            }
        }
        debug!(seq = report.seq, outcome = ?report.outcome, "analysis cycle finished");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    EncodeFailed,
    Dropped,
    Failed,
    Spoke(SpeechOutcome),
}

#[derive(Debug)]
struct CycleReport {
    seq: u64,
    outcome: CycleOutcome,
    finished_at: Instant,
}

enum Event {
    Tick,
    CycleDone(Result<CycleReport, JoinError>),
    Shutdown,
}

/// Resolves once `shutdown` turns true. Never resolves if the sender is gone
/// without having asked to stop.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|quit| *quit).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drives capture at the camera rate and starts an analysis cycle
/// (encode, describe, speak) whenever the schedule is due and nothing is
/// being spoken.
pub struct CaptureLoop<S: FrameSource, P: Preview> {
    source: S,
    preview: P,
    encoder: Arc<FrameEncoder>,
    analyzer: Arc<SceneAnalyzer>,
    speech: SpeechPlayer,
    frame_period: Duration,
    shutdown_grace: Duration,
    schedule: Schedule,
    cycles: JoinSet<CycleReport>,
    state: LoopState,
    stats: SessionStats,
}

impl<S: FrameSource, P: Preview> CaptureLoop<S, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        preview: P,
        encoder: FrameEncoder,
        analyzer: Arc<SceneAnalyzer>,
        speech: SpeechPlayer,
        frame_period: Duration,
        interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            source,
            preview,
            encoder: Arc::new(encoder),
            analyzer,
            speech,
            frame_period,
            shutdown_grace,
            schedule: Schedule::new(interval),
            cycles: JoinSet::new(),
            state: LoopState::Running,
            stats: SessionStats::default(),
        }
    }

    /// Run until the source ends, the preview asks to quit, or `shutdown`
    /// turns true. Returns the session counters.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionStats {
        let started = Instant::now();
        info!(
            source = self.source.name(),
            frame_period_ms = self.frame_period.as_millis() as u64,
            interval_ms = self.schedule.interval.as_millis() as u64,
            "capture loop running"
        );

        let mut ticker = tokio::time::interval(self.frame_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.state == LoopState::Running {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => Event::Shutdown,
                Some(joined) = self.cycles.join_next() => Event::CycleDone(joined),
                _ = ticker.tick() => Event::Tick,
            };

            match event {
                Event::Tick => {
                    // A read can stall (hung stream, stuck device); quitting
                    // must not wait for it.
                    let read = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => None,
                        read = self.source.read_frame() => Some(read),
                    };
                    match read {
                        Some(read) => self.on_read(read),
                        None => self.stop("shutdown requested during frame read"),
                    }
                }
                Event::CycleDone(joined) => self.stats.record(&mut self.schedule, joined),
                Event::Shutdown => self.stop("shutdown requested"),
            }
        }

        self.finish().await;
        self.stats.log_summary(started.elapsed());
        self.stats
    }

    fn on_read(&mut self, read: Result<Option<Frame>, CaptureError>) {
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.stop("frame source ended");
                return;
            }
            Err(e) => {
                self.stats.read_errors += 1;
                warn!(stage = "capture", error = %e, "frame read failed, skipping tick");
                return;
            }
        };
        self.stats.frames += 1;

        match self.preview.show(&frame) {
            Ok(PreviewEvent::Continue) => {}
            Ok(PreviewEvent::Quit) => {
                self.stop("quit requested from preview");
                return;
            }
            Err(e) => {
                self.stats.preview_errors += 1;
                warn!(stage = "preview", error = %e, "preview failed");
            }
        }

        let now = Instant::now();
        if self.schedule.is_due(now) && !self.speech.is_busy() {
            self.schedule.mark(now);
            self.dispatch(frame);
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        self.stats.cycles += 1;
        debug!(
            seq = frame.seq,
            captured_at_ms = frame.captured_at_ms,
            analyzer_busy = self.analyzer.is_analyzing(),
            "starting analysis cycle"
        );

        let encoder = Arc::clone(&self.encoder);
        let analyzer = Arc::clone(&self.analyzer);
        let speech = self.speech.clone();
        self.cycles.spawn(async move {
            let seq = frame.seq;
            let outcome = run_cycle(&encoder, &analyzer, &speech, frame).await;
            CycleReport {
                seq,
                outcome,
                finished_at: Instant::now(),
            }
        });
    }

    fn stop(&mut self, reason: &str) {
        if self.state == LoopState::Running {
            info!(reason, "capture loop stopping");
            self.state = LoopState::Stopping;
        }
    }

    async fn finish(&mut self) {
        self.source.close();
        self.preview.close();

        if !self.cycles.is_empty() {
            info!(
                in_flight = self.cycles.len(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "waiting for in-flight analysis cycles"
            );
            let cycles = &mut self.cycles;
            let stats = &mut self.stats;
            let schedule = &mut self.schedule;
            let drained = tokio::time::timeout(self.shutdown_grace, async move {
                while let Some(joined) = cycles.join_next().await {
                    stats.record(schedule, joined);
                }
            })
            .await;
            if drained.is_err() {
                let remaining = self.cycles.len();
                warn!(remaining, "grace period elapsed, detaching analysis cycles");
                self.stats.detached += remaining as u64;
                self.cycles.detach_all();
            }
        }

        self.state = LoopState::Stopped;
        info!("capture loop stopped");
    }
}

async fn run_cycle(
    encoder: &FrameEncoder,
    analyzer: &SceneAnalyzer,
    speech: &SpeechPlayer,
    frame: Frame,
) -> CycleOutcome {
    let image = match encoder.encode(&frame) {
        Ok(image) => image,
        Err(e) => {
            warn!(seq = frame.seq, stage = "encode", error = %e, "frame encoding failed");
            return CycleOutcome::EncodeFailed;
        }
    };
    drop(frame);

    let result = analyzer.analyze(image).await;
    match result.description() {
        Some(text) => CycleOutcome::Spoke(speech.speak(text).await),
        None if result == AnalysisResult::Dropped => CycleOutcome::Dropped,
        None => CycleOutcome::Failed,
    }
}
