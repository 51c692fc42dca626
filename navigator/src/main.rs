mod analyzer;
mod capture_loop;
mod source;
mod speech;

use analyzer::openai::OpenAiVisionClient;
use analyzer::SceneAnalyzer;
use capture_loop::CaptureLoop;
use sightline_common::config::{CameraConfig, Config, SourceKind, SpeechEngineKind};
use sightline_common::encoder::FrameEncoder;
use source::mjpeg::MjpegSource;
use source::{CaptureError, FrameSource, Headless, Preview};
use speech::command::{check_program_available, CommandPlayer, EdgeTtsSynthesizer};
use speech::openai::OpenAiSynthesizer;
use speech::{PlaybackWorker, SpeechPlayer, Synthesizer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() {
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    // A missing default config file means "run with defaults"; a missing
    // file named on the command line is an error.
    let use_defaults = explicit_path.is_none() && !config_path.exists();
    let config = if use_defaults {
        Config::default()
    } else {
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {e}", config_path.display());
                std::process::exit(1);
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    if use_defaults {
        info!(path = %config_path.display(), "no config file found, using defaults");
    }

    info!(
        source = ?config.camera.source,
        fps = config.camera.fps,
        interval_secs = config.schedule.interval_secs,
        model = config.analysis.model,
        speech_engine = ?config.speech.engine,
        voice = config.speech.voice,
        "starting sightline navigator"
    );

    let api_key = match config.analysis.api_key() {
        Ok(key) => key,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let request_timeout = Duration::from_secs(config.analysis.timeout_secs);
    let vision = match OpenAiVisionClient::new(
        &config.analysis.endpoint,
        api_key.clone(),
        request_timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to create vision client");
            std::process::exit(1);
        }
    };
    let analyzer = Arc::new(SceneAnalyzer::new(Arc::new(vision), &config.analysis));

    let speech = match start_speech(&config, api_key, request_timeout) {
        Ok(speech) => speech,
        Err(e) => {
            error!(error = %e, "failed to set up speech output");
            std::process::exit(1);
        }
    };

    let source = match open_source(&config.camera).await {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "failed to open camera");
            std::process::exit(1);
        }
    };
    let preview = open_preview(&config.camera);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    let capture = CaptureLoop::new(
        source,
        preview,
        FrameEncoder::new(&config.encoder),
        analyzer,
        speech,
        config.camera.frame_period(),
        config.schedule.interval(),
        config.schedule.shutdown_grace(),
    );
    info!("entering capture loop");
    capture.run(shutdown_rx).await;
}

fn start_speech(
    config: &Config,
    api_key: String,
    timeout: Duration,
) -> Result<SpeechPlayer, speech::SpeechError> {
    let speech = &config.speech;

    let synthesizer: Arc<dyn Synthesizer> = match speech.engine {
        SpeechEngineKind::EdgeTts => {
            check_program_available(&speech.synth_program, "synthesizer");
            Arc::new(EdgeTtsSynthesizer::new(&speech.synth_program))
        }
        SpeechEngineKind::Openai => Arc::new(OpenAiSynthesizer::new(
            &config.analysis.endpoint,
            api_key,
            &speech.openai_model,
            timeout,
        )?),
    };
    check_program_available(&speech.player_program, "player");
    let player = Arc::new(CommandPlayer::new(&speech.player_program, &speech.player_args));

    let artifact_dir = speech.artifact_dir();
    std::fs::create_dir_all(&artifact_dir)
        .map_err(|e| speech::SpeechError::Artifact(format!("{}: {e}", artifact_dir.display())))?;
    speech::artifact::sweep_stale(&artifact_dir);
    debug!(dir = %artifact_dir.display(), "audio artifacts directory ready");

    Ok(SpeechPlayer::spawn(PlaybackWorker::new(
        synthesizer,
        player,
        &speech.voice,
        artifact_dir,
        speech.fallback_chars_per_sec,
    )))
}

async fn open_source(camera: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match camera.source {
        SourceKind::Device => open_device(camera),
        SourceKind::Mjpeg => {
            let url = camera
                .url
                .as_deref()
                .ok_or_else(|| CaptureError::Open("camera.url is not set".into()))?;
            let source = MjpegSource::open(url)
                .await?
                .with_read_timeout(camera.read_timeout());
            Ok(Box::new(source))
        }
    }
}

#[cfg(feature = "camera")]
fn open_device(camera: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let device = source::device::DeviceSource::open(
        camera.device_index,
        camera.width,
        camera.height,
        camera.fps,
    )?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "camera"))]
fn open_device(_camera: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    Err(CaptureError::Open(
        "local cameras need a build with the `camera` feature; \
         rebuild with `--features camera` or set camera.source = \"mjpeg\""
            .into(),
    ))
}

#[cfg(feature = "camera")]
fn open_preview(camera: &CameraConfig) -> Box<dyn Preview> {
    if !camera.preview {
        return Box::new(Headless);
    }
    match source::device::WindowPreview::new() {
        Ok(window) => Box::new(window),
        Err(e) => {
            warn!(error = %e, "cannot open preview window, running headless");
            Box::new(Headless)
        }
    }
}

#[cfg(not(feature = "camera"))]
fn open_preview(camera: &CameraConfig) -> Box<dyn Preview> {
    if camera.preview {
        debug!("preview window needs the `camera` feature, running headless");
    }
    Box::new(Headless)
}
