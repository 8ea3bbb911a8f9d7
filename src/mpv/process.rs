//! MPV process detection and spawning.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Arguments that put mpv in idle mode listening on `socket_path`.
pub fn mpv_arguments(socket_path: &Path, extra_args: &[String]) -> Vec<String> {
  let mut args = vec![
    "--idle=yes".to_string(),
    "--force-window=no".to_string(),
    format!("--input-ipc-server={}", socket_path.display()),
  ];
  args.extend(extra_args.iter().cloned());
  args
}

/// Spawn MPV process with IPC server enabled.
pub fn spawn_mpv(
  mpv_path: Option<&Path>,
  socket_path: &Path,
  extra_args: &[String],
) -> Result<Child, ProcessError> {
  let mpv_exe = mpv_path
    .map(Path::to_path_buf)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  log::info!(
    "Spawning MPV: {:?} with IPC: {}",
    mpv_exe,
    socket_path.display()
  );
  if !extra_args.is_empty() {
    log::info!("Extra MPV args: {:?}", extra_args);
  }

  let child = Command::new(&mpv_exe)
    .args(mpv_arguments(socket_path, extra_args))
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()?;

  Ok(child)
}

/// Remove the socket file left behind by mpv.
pub fn cleanup_ipc(socket_path: &Path) {
  #[cfg(not(windows))]
  {
    match std::fs::remove_file(socket_path) {
      Ok(()) => log::debug!("Removed IPC socket {}", socket_path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove IPC socket {}: {}", socket_path.display(), e),
    }
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = socket_path;
}
