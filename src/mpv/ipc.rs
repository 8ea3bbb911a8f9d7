//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections. The transport only
//! moves lines: everything read is forwarded to the router's line channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Disconnected")]
  Disconnected,
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live connection: the write half plus the task draining the read half.
struct Link {
  writer: BoxWriter,
  alive: Arc<AtomicBool>,
  reader_handle: JoinHandle<()>,
}

impl Link {
  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
    self.writer.write_all(line.as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await
  }

  async fn shutdown(mut self) {
    if let Err(e) = self.writer.shutdown().await {
      log::debug!("MPV IPC shutdown error: {}", e);
    }
    self.reader_handle.abort();
  }
}

/// Line-oriented duplex connection to the MPV control socket.
///
/// Connects lazily on the first send and reconnects on the next send after
/// the reader observed the stream closing.
pub struct MpvIpc {
  socket_path: PathBuf,
  connect_retries: u32,
  link: Mutex<Option<Link>>,
  line_tx: Sender<String>,
  closed: AtomicBool,
}

impl MpvIpc {
  pub fn new(socket_path: impl Into<PathBuf>, connect_retries: u32, line_tx: Sender<String>) -> Self {
    Self {
      socket_path: socket_path.into(),
      connect_retries: connect_retries.max(1),
      link: Mutex::new(None),
      line_tx,
      closed: AtomicBool::new(false),
    }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Connect if there is no live link. Idempotent.
  pub async fn open(&self) -> Result<(), IpcError> {
    let mut link = self.link.lock().await;
    self.ensure_open(&mut link).await
  }

  /// Whether a link exists and its reader is still running.
  pub async fn is_open(&self) -> bool {
    self.link.lock().await.as_ref().is_some_and(Link::is_alive)
  }

  /// Write one line, connecting first if needed.
  pub async fn send_line(&self, line: &str) -> Result<(), IpcError> {
    let mut slot = self.link.lock().await;
    self.ensure_open(&mut slot).await?;
    let link = slot.as_mut().ok_or(IpcError::Disconnected)?;

    log::debug!("Sending MPV command: {}", line);
    if let Err(e) = link.write_line(line).await {
      log::error!("MPV IPC write error: {}", e);
      if let Some(broken) = slot.take() {
        broken.shutdown().await;
      }
      return Err(IpcError::Io(e));
    }
    Ok(())
  }

  /// Drop the current link, if any. No new link is opened afterwards.
  pub async fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    let link = self.link.lock().await.take();
    if let Some(link) = link {
      log::info!("Closing MPV IPC connection");
      link.shutdown().await;
    }
  }

  async fn ensure_open(&self, slot: &mut Option<Link>) -> Result<(), IpcError> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(IpcError::Disconnected);
    }
    if slot.as_ref().is_some_and(Link::is_alive) {
      return Ok(());
    }
    if let Some(stale) = slot.take() {
      log::info!("MPV IPC link is down, reconnecting");
      stale.shutdown().await;
    }
    *slot = Some(self.connect().await?);
    Ok(())
  }

  async fn connect(&self) -> Result<Link, IpcError> {
    let mut last_error = None;

    for attempt in 0..self.connect_retries {
      if attempt > 0 {
        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
      }

      match self.try_connect().await {
        Ok(link) => {
          log::info!("Connected to MPV IPC at {}", self.socket_path.display());
          return Ok(link);
        }
        Err(e) => {
          log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
          last_error = Some(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| IpcError::ConnectionFailed("Unknown error".into())))
  }

  #[cfg(windows)]
  async fn try_connect(&self) -> Result<Link, IpcError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new()
      .open(&self.socket_path)
      .map_err(|e| IpcError::ConnectionFailed(format!("Failed to open pipe: {}", e)))?;

    let (reader, writer) = tokio::io::split(client);
    Ok(self.setup(reader, writer))
  }

  #[cfg(not(windows))]
  async fn try_connect(&self) -> Result<Link, IpcError> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(&self.socket_path)
      .await
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

    let (reader, writer) = stream.into_split();
    Ok(self.setup(reader, writer))
  }

  fn setup<R, W>(&self, reader: R, writer: W) -> Link
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let alive = Arc::new(AtomicBool::new(true));
    let reader_alive = alive.clone();
    let line_tx = self.line_tx.clone();
    let reader_handle = tokio::spawn(async move {
      reader_loop(reader, line_tx).await;
      reader_alive.store(false, Ordering::SeqCst);
    });

    Link {
      writer: Box::new(writer),
      alive,
      reader_handle,
    }
  }
}

async fn reader_loop<R: AsyncRead + Unpin>(reader: R, line_tx: Sender<String>) {
  log::info!("MPV IPC reader loop started");
  let mut buf_reader = BufReader::new(reader);
  let mut line = String::new();

  loop {
    line.clear();
    match buf_reader.read_line(&mut line).await {
      Ok(0) => {
        log::info!("MPV IPC connection closed");
        break;
      }
      Ok(_) => {
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }
        if line_tx.send(trimmed.to_string()).await.is_err() {
          log::debug!("MPV IPC router gone, stopping reader");
          break;
        }
      }
      Err(e) => {
        log::error!("MPV IPC read error: {}", e);
        break;
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use tokio::net::UnixListener;

  #[tokio::test]
  async fn test_lazy_open_and_line_framing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (line_tx, line_rx) = async_channel::unbounded();
    let ipc = MpvIpc::new(&path, 1, line_tx);

    assert!(!ipc.is_open().await);

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (read_half, mut write_half) = stream.into_split();
      let mut received = String::new();
      BufReader::new(read_half)
        .read_line(&mut received)
        .await
        .unwrap();
      write_half
        .write_all(b"{\"event\":\"idle\"}\n\n")
        .await
        .unwrap();
      received
    });

    ipc.send_line(r#"{"command":["stop"],"request_id":1}"#).await.unwrap();

    let written = server.await.unwrap();
    assert_eq!(written, "{\"command\":[\"stop\"],\"request_id\":1}\n");
    assert_eq!(line_rx.recv().await.unwrap(), r#"{"event":"idle"}"#);
  }

  #[tokio::test]
  async fn test_reconnects_after_stream_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (line_tx, _line_rx) = async_channel::unbounded();
    let ipc = MpvIpc::new(&path, 1, line_tx);

    ipc.open().await.unwrap();
    let (first, _) = listener.accept().await.unwrap();
    drop(first);

    // Wait until the reader notices the closed stream.
    for _ in 0..50 {
      if !ipc.is_open().await {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!ipc.is_open().await);

    ipc.open().await.unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
    assert!(accepted.is_ok());
    assert!(ipc.is_open().await);
  }

  #[tokio::test]
  async fn test_closed_transport_never_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (line_tx, _line_rx) = async_channel::unbounded();
    let ipc = MpvIpc::new(&path, 1, line_tx);

    ipc.open().await.unwrap();
    let _first = listener.accept().await.unwrap();
    ipc.close().await;

    assert!(matches!(ipc.send_line("{}").await, Err(IpcError::Disconnected)));
    assert!(matches!(ipc.open().await, Err(IpcError::Disconnected)));
    assert!(!ipc.is_open().await);
    let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(second.is_err());
  }

  #[tokio::test]
  async fn test_missing_socket_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let (line_tx, _line_rx) = async_channel::unbounded();
    let ipc = MpvIpc::new(dir.path().join("absent.sock"), 1, line_tx);

    let result = ipc.send_line("{}").await;
    assert!(matches!(result, Err(IpcError::ConnectionFailed(_))));
  }
}
