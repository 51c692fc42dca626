use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AudioPlayer, SpeechError, Synthesizer};

/// Synthesizer driving the `edge-tts` command line tool.
pub struct EdgeTtsSynthesizer {
    program: String,
}

impl EdgeTtsSynthesizer {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl Synthesizer for EdgeTtsSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<(), SpeechError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--voice")
            .arg(voice)
            .arg("--text")
            .arg(text)
            .arg("--write-media")
            .arg(out);
        run(&self.program, cmd).await
    }

    fn extension(&self) -> &str {
        "mp3"
    }

    fn name(&self) -> &str {
        "edge-tts"
    }
}

/// Plays audio files with an external program (`afplay`, `ffplay`, `mpg123`...).
/// Returns once the program exits, i.e. after playback finished.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl AudioPlayer for CommandPlayer {
    async fn play(&self, path: &Path) -> Result<(), SpeechError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(path);
        run(&self.program, cmd).await
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Run `cmd` to completion. The child is killed if the future is dropped.
async fn run(program: &str, mut cmd: Command) -> Result<(), SpeechError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| SpeechError::Spawn {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    let output = child.wait_with_output().await.map_err(|e| SpeechError::Spawn {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SpeechError::ProcessFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr,
        });
    }
    debug!(program, "external audio command finished");
    Ok(())
}

/// Locate an executable `program` on `PATH` (or accept it as a path).
pub fn find_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check whether an external speech program is installed. Logs a warning if
/// not; speech then degrades to silent pacing.
pub fn check_program_available(program: &str, role: &str) {
    match find_program(program) {
        Some(path) => debug!(program, role, path = %path.display(), "speech program found"),
        None => warn!(
            program,
            role, "speech program not found on PATH; descriptions will not be spoken"
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_is_ok() {
        let player = CommandPlayer::new("sh", &["-c".into(), "exit 0".into()]);
        player.play(Path::new("ignored")).await.unwrap();
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let player = CommandPlayer::new("sh", &["-c".into(), "echo boom >&2; exit 3".into()]);
        match player.play(Path::new("ignored")).await {
            Err(SpeechError::ProcessFailed { program, stderr, .. }) => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected process failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let synth = EdgeTtsSynthesizer::new("sightline-no-such-program");
        let err = synth
            .synthesize("hello", "en-US-JennyNeural", Path::new("/tmp/out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Spawn { .. }));
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_program("sh").is_some());
        assert!(find_program("sightline-no-such-program").is_none());
    }

    #[test]
    fn non_executable_file_is_not_a_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("speak.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(find_program(script.to_str().unwrap()).is_none());

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(find_program(script.to_str().unwrap()).is_some());
    }
}
