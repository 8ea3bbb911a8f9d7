//! High-level MPV client: one control connection with its correlator,
//! router and subscriptions.

use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::debounce::debounce;
use super::ipc::{IpcError, MpvIpc};
use super::pending::PendingRequests;
use super::process::{cleanup_ipc, spawn_mpv, ProcessError};
use super::protocol::{
  default_group_id, MpvCommand, MpvEvent, MpvResponse, PlaybackTimes, PropertyValue,
};
use super::registry::{handler, EventHandler, Subscription, SubscriptionId, SubscriptionRegistry};
use super::router::{Dispatcher, Router};
use crate::config::{ConfigError, IpcConfig};

/// How long mpv may take to exit on its own after the shutdown command.
const EXIT_GRACE: Duration = Duration::from_secs(1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("Configuration error: {0}")]
  Config(#[from] ConfigError),
  #[error("MPV command failed: {0}")]
  CommandFailed(String),
}

struct ClientInner {
  config: IpcConfig,
  ipc: MpvIpc,
  pending: Arc<PendingRequests>,
  registry: Arc<SubscriptionRegistry>,
  router: Arc<Router>,
  process: Mutex<Option<Child>>,
  owns_socket: bool,
  cancel: CancellationToken,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  closed: AtomicBool,
}

impl Drop for ClientInner {
  fn drop(&mut self) {
    self.cancel.cancel();
    if let Some(child) = self.process.get_mut().take() {
      // Reaping blocks, keep it off the runtime workers
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          runtime.spawn_blocking(move || reap(child));
        }
        Err(_) => {
          let _ = reap(child);
        }
      }
    }
    if self.owns_socket {
      cleanup_ipc(self.ipc.socket_path());
    }
  }
}

/// Kill the process unless it already exited, then wait for it.
fn reap(mut child: Child) -> std::io::Result<ExitStatus> {
  if let Some(status) = child.try_wait()? {
    return Ok(status);
  }
  if let Err(e) = child.kill() {
    log::debug!("kill() failed: {}", e);
  }
  child.wait()
}

/// MPV IPC client.
///
/// Cheap to clone; clones share the same connection. Event handlers that
/// issue commands should capture a [`WeakMpvClient`]: the client owns its
/// handlers, so a strong clone inside one keeps the client (and a spawned
/// player) alive until [`MpvClient::close`] is awaited.
#[derive(Clone)]
pub struct MpvClient {
  inner: Arc<ClientInner>,
}

/// Non-owning handle to an [`MpvClient`].
#[derive(Clone)]
pub struct WeakMpvClient {
  inner: Weak<ClientInner>,
}

impl WeakMpvClient {
  /// The client, if any strong handle to it is still around.
  pub fn upgrade(&self) -> Option<MpvClient> {
    self.inner.upgrade().map(|inner| MpvClient { inner })
  }
}

impl MpvClient {
  /// Create a client for `config.socket_path`. Nothing is connected until
  /// the first command is sent (or [`MpvClient::open`] is called).
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(config: IpcConfig) -> Result<Self, MpvError> {
    config.validate()?;
    let socket_path = config.resolve_socket_path();
    Ok(Self::build(config, socket_path, None))
  }

  /// Connect to an mpv instance that is already running. The player is
  /// left running when the client closes.
  pub async fn attach(mut config: IpcConfig) -> Result<Self, MpvError> {
    config.exit_on_close = false;
    let client = Self::new(config)?;
    client.open().await?;
    Ok(client)
  }

  /// Spawn mpv listening on the configured (or a generated) socket and
  /// connect to it. The process and socket file belong to the client.
  pub async fn spawn(config: IpcConfig) -> Result<Self, MpvError> {
    config.validate()?;
    let socket_path = config.resolve_socket_path();
    cleanup_ipc(&socket_path);

    let child = spawn_mpv(config.mpv_path.as_deref(), &socket_path, &config.mpv_args)?;
    let startup_delay = config.startup_delay();
    let client = Self::build(config, socket_path, Some(child));

    // Wait a bit for MPV to create the socket
    tokio::time::sleep(startup_delay).await;

    if let Err(e) = client.open().await {
      client.close().await;
      return Err(e);
    }
    log::info!("MPV client connected");
    Ok(client)
  }

  fn build(config: IpcConfig, socket_path: PathBuf, child: Option<Child>) -> Self {
    let (line_tx, line_rx) = async_channel::unbounded();
    let pending = Arc::new(PendingRequests::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let (router, event_rx) = Router::new(pending.clone());
    let router = Arc::new(router);
    let cancel = CancellationToken::new();

    let dispatcher = Dispatcher::new(registry.clone(), config.dispatch_concurrency, cancel.clone());
    let tasks = vec![
      router.clone().spawn(line_rx, cancel.clone()),
      dispatcher.spawn(event_rx),
    ];

    let owns_socket = child.is_some();
    let ipc = MpvIpc::new(socket_path, config.connect_retries, line_tx);

    Self {
      inner: Arc::new(ClientInner {
        config,
        ipc,
        pending,
        registry,
        router,
        process: Mutex::new(child),
        owns_socket,
        cancel,
        tasks: Mutex::new(tasks),
        closed: AtomicBool::new(false),
      }),
    }
  }

  pub fn downgrade(&self) -> WeakMpvClient {
    WeakMpvClient {
      inner: Arc::downgrade(&self.inner),
    }
  }

  pub fn socket_path(&self) -> &Path {
    self.inner.ipc.socket_path()
  }

  /// Connect now instead of on the first command.
  pub async fn open(&self) -> Result<(), MpvError> {
    self.ensure_not_closed()?;
    self.inner.ipc.open().await?;
    Ok(())
  }

  /// Check if the control connection is currently up.
  pub async fn is_connected(&self) -> bool {
    !self.is_closed() && self.inner.ipc.is_open().await
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::SeqCst)
  }

  /// Commands currently waiting for a response.
  pub fn pending_count(&self) -> usize {
    self.inner.pending.len()
  }

  /// Local subscribers sharing the player-side observation of a pair.
  pub fn observer_count(&self, property: &str, id: i64) -> usize {
    self.inner.registry.observer_count(property, id)
  }

  pub fn subscription_count(&self) -> usize {
    self.inner.registry.len()
  }

  fn ensure_not_closed(&self) -> Result<(), MpvError> {
    if self.is_closed() {
      return Err(IpcError::Disconnected.into());
    }
    Ok(())
  }

  /// Send a command and wait for its response.
  ///
  /// A response whose `error` is not "success" is still returned as `Ok`;
  /// inspect [`MpvResponse::is_success`].
  pub async fn send_command(&self, name: &str, args: Vec<Value>) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::new(name, args)).await
  }

  /// Send a command without waiting for (or keeping) its response.
  /// Returns the request id used.
  pub async fn send_command_async(&self, name: &str, args: Vec<Value>) -> Result<i64, MpvError> {
    self.command_async(MpvCommand::new(name, args)).await
  }

  pub async fn command(&self, cmd: MpvCommand) -> Result<MpvResponse, MpvError> {
    self
      .command_with_timeout(cmd, self.inner.config.command_timeout())
      .await
  }

  pub async fn command_with_timeout(
    &self,
    cmd: MpvCommand,
    timeout: Duration,
  ) -> Result<MpvResponse, MpvError> {
    self.ensure_not_closed()?;
    let pending = &self.inner.pending;
    let (request_id, rx) = pending.register();
    let name = cmd.name().to_string();

    if let Err(e) = self.write(cmd, request_id).await {
      pending.forget(request_id);
      return Err(e.into());
    }

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => {
        log::warn!("MPV connection closed while waiting for request_id={}", request_id);
        Err(IpcError::Disconnected.into())
      }
      Err(_) => {
        pending.forget(request_id);
        log::warn!(
          "MPV command '{}' timed out after {:?}, request_id={}",
          name,
          timeout,
          request_id
        );
        Err(IpcError::Timeout.into())
      }
    }
  }

  pub async fn command_async(&self, cmd: MpvCommand) -> Result<i64, MpvError> {
    self.ensure_not_closed()?;
    let request_id = self.inner.pending.next_id();
    self.write(cmd, request_id).await?;
    Ok(request_id)
  }

  async fn write(&self, cmd: MpvCommand, request_id: i64) -> Result<(), IpcError> {
    let line = cmd.into_request(request_id).to_line()?;
    self.inner.ipc.send_line(&line).await
  }

  /// Get a property, returning the raw response.
  pub async fn get_property(&self, name: &str) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::get_property(name)).await
  }

  /// Get a property value, treating a player error as a failure.
  pub async fn get_property_value(&self, name: &str) -> Result<PropertyValue, MpvError> {
    let data = self
      .get_property(name)
      .await?
      .into_result()
      .map_err(MpvError::CommandFailed)?;
    Ok(data.map(PropertyValue::from).unwrap_or(PropertyValue::Null))
  }

  pub async fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::set_property(name, value)).await
  }

  /// Load a file, replacing the current one or appending to the playlist.
  pub async fn loadfile(&self, path: &str, append: bool) -> Result<MpvResponse, MpvError> {
    log::info!("Loading file: {}", path);
    self.command(MpvCommand::loadfile(path, append)).await
  }

  /// Seek by an amount using an mpv seek flag ("relative", "absolute", ...).
  pub async fn seek(&self, amount: f64, flag: &str) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::seek(amount, flag)).await
  }

  pub async fn set_pause(&self, paused: bool) -> Result<MpvResponse, MpvError> {
    self.set_property("pause", paused).await
  }

  pub async fn cycle(&self, property: &str) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::cycle(property)).await
  }

  /// Toggle between playing and paused.
  pub async fn play_pause(&self) -> Result<MpvResponse, MpvError> {
    self.cycle("pause").await
  }

  /// Position, remaining time and duration of the current file. A value
  /// mpv cannot provide (nothing loaded, live stream) is `None`.
  pub async fn get_times(&self) -> Result<PlaybackTimes, MpvError> {
    Ok(PlaybackTimes {
      position: self.seconds_property("time-pos").await?,
      remaining: self.seconds_property("time-remaining").await?,
      duration: self.seconds_property("duration").await?,
    })
  }

  async fn seconds_property(&self, name: &str) -> Result<Option<f64>, MpvError> {
    let response = self.get_property(name).await?;
    if !response.is_success() {
      return Ok(None);
    }
    Ok(response.data.as_ref().and_then(Value::as_f64))
  }

  pub async fn playlist_next(&self) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::playlist_next()).await
  }

  pub async fn playlist_prev(&self) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::playlist_prev()).await
  }

  pub async fn stop(&self) -> Result<MpvResponse, MpvError> {
    self.command(MpvCommand::stop()).await
  }

  /// Call `handler` for every event with this name.
  pub fn subscribe_event(&self, event: &str, handler: EventHandler) -> SubscriptionId {
    self
      .inner
      .registry
      .subscribe(Subscription::event(event), handler)
      .id
  }

  /// Call `handler` whenever `property` changes, under group `id`.
  ///
  /// The first local observer of a (property, id) pair asks mpv to observe
  /// it. Subscribers joining while that request is in flight wait for its
  /// outcome; if mpv refuses, every one of them is rolled back and fails.
  pub async fn observe_property(
    &self,
    property: &str,
    id: i64,
    handler: EventHandler,
  ) -> Result<SubscriptionId, MpvError> {
    self.ensure_not_closed()?;
    let registry = &self.inner.registry;
    let added = registry.subscribe(Subscription::property(property, id), handler);
    let Some(mut observation) = added.observation else {
      return Ok(added.id);
    };

    if !added.first_observer {
      return match observation.settled().await {
        Ok(()) => Ok(added.id),
        Err(e) => Err(MpvError::CommandFailed(e)),
      };
    }

    let observed = match self.command(MpvCommand::observe_property(id, property)).await {
      Ok(response) => response
        .into_result()
        .map(|_| ())
        .map_err(MpvError::CommandFailed),
      Err(e) => Err(e),
    };
    match observed {
      Ok(()) => {
        registry.settle_observation(property, id, &observation, Ok(()));
        log::debug!("Observing '{}' under group {}", property, id);
        Ok(added.id)
      }
      Err(e) => {
        let dropped = registry.settle_observation(property, id, &observation, Err(e.to_string()));
        log::warn!(
          "Failed to observe '{}' (group {}): {}, dropped {} subscriber(s)",
          property,
          id,
          e,
          dropped
        );
        Err(e)
      }
    }
  }

  /// Observe under the group id derived from the property name.
  pub async fn observe_property_default(
    &self,
    property: &str,
    handler: EventHandler,
  ) -> Result<SubscriptionId, MpvError> {
    self
      .observe_property(property, default_group_id(property), handler)
      .await
  }

  /// Observe a property, calling `handler` at most once every `seconds`.
  pub async fn observe_property_debounced(
    &self,
    property: &str,
    id: i64,
    seconds: f64,
    handler: EventHandler,
  ) -> Result<SubscriptionId, MpvError> {
    self
      .observe_property(property, id, debounce(seconds, handler))
      .await
  }

  /// Remove one subscription. Returns false if it was unknown.
  pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, MpvError> {
    let Some(removed) = self.inner.registry.unsubscribe(id) else {
      return Ok(false);
    };
    if let Some(group) = removed.released_group {
      self.unobserve(group).await?;
    }
    Ok(true)
  }

  /// Remove every subscription on a property, whatever its group.
  pub async fn unsubscribe_property(&self, property: &str) -> Result<(), MpvError> {
    for group in self.inner.registry.unsubscribe_property(property) {
      self.unobserve(group).await?;
    }
    Ok(())
  }

  /// Remove every property subscription in a group.
  pub async fn unsubscribe_group(&self, id: i64) -> Result<(), MpvError> {
    if self.inner.registry.unsubscribe_group(id) {
      self.unobserve(id).await?;
    }
    Ok(())
  }

  async fn unobserve(&self, group: i64) -> Result<(), MpvError> {
    log::debug!("Releasing observation group {}", group);
    self.command_async(MpvCommand::unobserve_property(group)).await?;
    Ok(())
  }

  /// Deliver an event to subscribers as if mpv had sent it.
  pub fn fire_event(&self, event: MpvEvent) {
    match serde_json::to_value(&event) {
      Ok(value) => self.simulate_message(value),
      Err(e) => log::warn!("Cannot fire event {}: {}", event.event, e),
    }
  }

  /// Feed a raw message through the router as if mpv had sent it.
  pub fn simulate_message(&self, message: Value) {
    self.inner.router.route_value(message);
  }

  /// Wait for the next event with this name.
  pub async fn wait_for_event(&self, event: &str, timeout: Duration) -> Option<MpvEvent> {
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let id = self.subscribe_event(
      event,
      handler(move |event| {
        let slot = slot.clone();
        async move {
          let sender = slot.lock().take();
          if let Some(sender) = sender {
            let _ = sender.send(event);
          }
        }
      }),
    );

    let received = tokio::time::timeout(timeout, rx).await.ok().and_then(Result::ok);
    self.inner.registry.unsubscribe(id);
    received
  }

  /// Tear down the connection.
  ///
  /// Releases player-side observations, sends the shutdown command if
  /// configured, fails pending requests, stops background tasks, and stops
  /// the player process if this client spawned it. Errors are logged.
  pub async fn close(&self) {
    if self.inner.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    log::info!("Closing MPV client");
    let inner = &self.inner;

    let groups = inner.registry.clear();
    let mut exit_sent = false;
    if inner.ipc.is_open().await {
      for group in groups {
        let cmd = MpvCommand::unobserve_property(group);
        if let Err(e) = self.write(cmd, inner.pending.next_id()).await {
          log::warn!("Failed to release observation group {}: {}", group, e);
        }
      }
      if inner.config.exit_on_close {
        let cmd = MpvCommand::new(inner.config.shutdown_command.clone(), Vec::new());
        match self.write(cmd, inner.pending.next_id()).await {
          Ok(()) => exit_sent = true,
          Err(e) => log::warn!("Failed to send shutdown command: {}", e),
        }
      }
    }

    inner.ipc.close().await;
    let failed = inner.pending.fail_all();
    if failed > 0 {
      log::info!("Dropped {} pending MPV requests", failed);
    }
    inner.cancel.cancel();
    let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
    for task in tasks {
      let _ = task.await;
    }

    let grace = if exit_sent { EXIT_GRACE } else { Duration::ZERO };
    self.stop_process(grace).await;
    if inner.owns_socket {
      cleanup_ipc(inner.ipc.socket_path());
    }
    log::info!("MPV client closed");
  }

  /// Wait up to `grace` for a spawned player to exit, then kill it.
  async fn stop_process(&self, grace: Duration) -> Option<ExitStatus> {
    let mut child = self.inner.process.lock().take()?;
    log::info!("Stopping MPV process (pid: {})", child.id());

    let deadline = tokio::time::Instant::now() + grace;
    loop {
      match child.try_wait() {
        Ok(Some(status)) => {
          log::info!("MPV process exited with: {}", status);
          return Some(status);
        }
        Ok(None) if tokio::time::Instant::now() < deadline => {
          tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Ok(None) => break,
        Err(e) => {
          log::debug!("try_wait() failed: {}", e);
          break;
        }
      }
    }

    // Kill in spawn_blocking to avoid blocking the async runtime
    match tokio::task::spawn_blocking(move || reap(child)).await {
      Ok(Ok(status)) => {
        log::info!("MPV process exited with: {}", status);
        Some(status)
      }
      Ok(Err(e)) => {
        log::error!("wait() failed: {}", e);
        None
      }
      Err(e) => {
        log::error!("spawn_blocking panicked during process cleanup: {}", e);
        None
      }
    }
  }
}
