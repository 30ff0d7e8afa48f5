//! XDG path helpers and atomic file writes
//!
//! Settings live in ~/.config/steadycoach/, saved sessions in
//! ~/.local/share/steadycoach/.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "steadycoach";

/// ~/.config/steadycoach/
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// ~/.local/share/steadycoach/
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Replace `path` with `contents` without ever leaving a half-written file.
///
/// Writes a sibling temp file, then renames it over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)?;

    // Windows refuses to rename over an existing file
    if cfg!(windows) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    fs::rename(&tmp_path, path)
}
