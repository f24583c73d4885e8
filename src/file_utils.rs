// File utilities for the Whisper server
//
// Scratch files for request audio live under a process-shared directory in
// the OS temp dir, one UUID-named file per payload. Cleanup is tied to a
// guard value so every exit path, including panics, removes the file.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error};
use uuid::Uuid;

/// Subdirectory of the OS temp dir holding per-request scratch files
const SCRATCH_DIR_NAME: &str = "whisperapi";

/// Directory containing the running executable, falling back to the current
/// directory when the executable path cannot be resolved.
pub fn exe_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The process-wide scratch directory
pub fn scratch_dir() -> PathBuf {
    env::temp_dir().join(SCRATCH_DIR_NAME)
}

/// A uniquely named scratch file removed when the guard is dropped.
///
/// The path is reserved, not created; whoever writes the payload creates the
/// file. Dropping the guard unlinks whatever exists at the path.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Reserve a unique scratch path with the given extension.
    pub fn allocate(extension: &str) -> io::Result<Self> {
        let dir = scratch_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), extension));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            error!("failed to remove scratch file {}: {}", self.path.display(), e);
        } else {
            debug!("removed scratch file {}", self.path.display());
        }
    }
}
