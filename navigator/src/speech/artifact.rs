use std::io::ErrorKind;
use std::path::Path;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use super::SpeechError;

/// File name prefix of every transient audio file, used by the startup sweep.
pub const ARTIFACT_PREFIX: &str = "sightline-tts-";

/// Uniquely named audio file that lives for one speech job.
///
/// [`AudioArtifact::remove`] deletes it and logs failures; if the owner bails
/// out early (error, panic, cancelled task) the file is deleted on drop
/// instead. Either way the deletion happens once.
pub struct AudioArtifact {
    path: TempPath,
}

impl AudioArtifact {
    pub fn create(dir: &Path, extension: &str) -> Result<Self, SpeechError> {
        let file = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(&format!(".{extension}"))
            .tempfile_in(dir)
            .map_err(|e| SpeechError::Artifact(format!("{}: {e}", dir.display())))?;
        let path = file.into_temp_path();
        debug!(path = %path.display(), "audio artifact created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) {
        let shown = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => debug!(path = shown, "audio artifact removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = shown, "audio artifact already gone")
            }
            Err(e) => warn!(path = shown, error = %e, "failed to delete audio artifact"),
        }
    }
}

/// Delete artifacts left in `dir` by a previous run that was killed mid-job.
/// Returns how many files were removed.
pub fn sweep_stale(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot scan artifact directory");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_artifact = name
            .to_str()
            .map(|n| n.starts_with(ARTIFACT_PREFIX))
            .unwrap_or(false);
        if !is_artifact || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to delete stale artifact"),
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "removed stale audio artifacts");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = AudioArtifact::create(dir.path(), "mp3").unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".mp3"));
        artifact.remove();
        assert!(!path.exists());
    }

    #[test]
    fn drop_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let artifact = AudioArtifact::create(dir.path(), "wav").unwrap();
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn remove_tolerates_external_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = AudioArtifact::create(dir.path(), "mp3").unwrap();
        std::fs::remove_file(artifact.path()).unwrap();
        artifact.remove();
    }

    #[test]
    fn names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = AudioArtifact::create(dir.path(), "mp3").unwrap();
        let b = AudioArtifact::create(dir.path(), "mp3").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn sweep_only_touches_our_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{ARTIFACT_PREFIX}old.mp3")), b"x").unwrap();
        std::fs::write(dir.path().join(format!("{ARTIFACT_PREFIX}older.wav")), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(sweep_stale(dir.path()), 2);
        let left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("notes.txt")]);
    }
}
