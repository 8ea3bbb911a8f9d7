//! In-process stand-in for an mpv IPC server, used by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::broadcast;

use super::protocol::MpvRequest;
use crate::config::IpcConfig;

#[derive(Default)]
struct FakeState {
  properties: HashMap<String, Value>,
  observers: Vec<(i64, String)>,
  commands: Vec<Vec<Value>>,
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Fake player answering a small subset of the mpv command set.
///
/// - `get_property` / `set_property` against an in-memory property map
/// - `observe_property` / `unobserve_property` with property-change events;
///   observing a property named `x-slow...` is never answered
/// - `x-ignore`: never answered
/// - `x-late <ms>`: answered after a delay
/// - `x-emit <name>`: answered, then an event `<name>` is sent
/// - anything else: answered with success
pub struct FakeMpv {
  _dir: TempDir,
  socket_path: PathBuf,
  state: Arc<Mutex<FakeState>>,
  inject_tx: broadcast::Sender<String>,
  connections: Arc<AtomicUsize>,
}

impl FakeMpv {
  pub async fn start() -> Self {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&socket_path).expect("bind fake mpv socket");

    let mut properties = HashMap::new();
    properties.insert("volume".to_string(), json!(100.0));
    properties.insert("pause".to_string(), json!(false));
    properties.insert("mpv-version".to_string(), json!("mpv 0.38.0"));
    let state = Arc::new(Mutex::new(FakeState {
      properties,
      ..FakeState::default()
    }));

    let (inject_tx, _) = broadcast::channel(64);
    let connections = Arc::new(AtomicUsize::new(0));

    let accept_state = state.clone();
    let accept_inject = inject_tx.clone();
    let accept_count = connections.clone();
    tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        accept_count.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        tokio::spawn(serve(
          BufReader::new(read_half),
          writer,
          accept_state.clone(),
          accept_inject.subscribe(),
        ));
      }
    });

    Self {
      _dir: dir,
      socket_path,
      state,
      inject_tx,
      connections,
    }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Client configuration pointing at this server with a short timeout.
  pub fn config(&self) -> IpcConfig {
    IpcConfig {
      command_timeout_ms: 500,
      connect_retries: 1,
      ..IpcConfig::for_socket(&self.socket_path)
    }
  }

  /// Every command received so far, name first.
  pub fn commands(&self) -> Vec<Vec<Value>> {
    self.state.lock().commands.clone()
  }

  pub fn commands_named(&self, name: &str) -> Vec<Vec<Value>> {
    self
      .commands()
      .into_iter()
      .filter(|command| command.first().and_then(Value::as_str) == Some(name))
      .collect()
  }

  pub fn property(&self, name: &str) -> Option<Value> {
    self.state.lock().properties.get(name).cloned()
  }

  /// Send a raw line to every connected client.
  pub fn push_line(&self, line: &str) {
    let _ = self.inject_tx.send(line.to_string());
  }

  pub fn connections(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }

  /// Poll until `cond` holds or a second passes.
  pub async fn wait_until(&self, cond: impl Fn(&Self) -> bool) -> bool {
    for _ in 0..100 {
      if cond(self) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond(self)
  }
}

async fn serve(
  reader: BufReader<tokio::net::unix::OwnedReadHalf>,
  writer: SharedWriter,
  state: Arc<Mutex<FakeState>>,
  mut inject_rx: broadcast::Receiver<String>,
) {
  let mut lines = reader.lines();
  loop {
    tokio::select! {
      next = lines.next_line() => {
        match next {
          Ok(Some(line)) => {
            if !handle_line(line.trim(), &writer, &state).await {
              break;
            }
          }
          _ => break,
        }
      }
      injected = inject_rx.recv() => {
        if let Ok(injected) = injected {
          write_line(&writer, &injected).await;
        }
      }
    }
  }
}

async fn write_line(writer: &SharedWriter, line: &str) {
  let mut writer = writer.lock().await;
  let _ = writer.write_all(line.as_bytes()).await;
  let _ = writer.write_all(b"\n").await;
  let _ = writer.flush().await;
}

fn success(request_id: i64, data: Value) -> String {
  json!({"request_id": request_id, "error": "success", "data": data}).to_string()
}

fn failure(request_id: i64, error: &str) -> String {
  json!({"request_id": request_id, "error": error}).to_string()
}

fn change_event(name: &str, data: &Value, id: i64) -> String {
  json!({"event": "property-change", "name": name, "data": data, "id": id}).to_string()
}

/// Handle one request. Returns false when the connection should close.
async fn handle_line(line: &str, writer: &SharedWriter, state: &Arc<Mutex<FakeState>>) -> bool {
  let Ok(request) = serde_json::from_str::<MpvRequest>(line) else {
    return true;
  };
  let id = request.request_id;
  let args = request.command.clone();
  let name = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
  state.lock().commands.push(args.clone());

  let mut out = Vec::new();
  let mut keep_open = true;
  match name.as_str() {
    "get_property" => {
      let property = args.get(1).and_then(Value::as_str).unwrap_or_default();
      let value = state.lock().properties.get(property).cloned();
      out.push(match value {
        Some(value) => success(id, value),
        None => failure(id, "property unavailable"),
      });
    }
    "set_property" => {
      let property = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
      let mut value = args.get(2).cloned().unwrap_or(Value::Null);
      if let Some(number) = value.as_str().and_then(|s| s.parse::<f64>().ok()) {
        value = json!(number);
      }
      let mut state = state.lock();
      let changed = state.properties.get(&property) != Some(&value);
      state.properties.insert(property.clone(), value.clone());
      out.push(success(id, Value::Null));
      if changed {
        for (group, observed) in &state.observers {
          if *observed == property {
            out.push(change_event(&property, &value, *group));
          }
        }
      }
    }
    "observe_property" => {
      let group = args.get(1).and_then(Value::as_i64).unwrap_or_default();
      let property = args.get(2).and_then(Value::as_str).unwrap_or_default().to_string();
      if property.starts_with("x-slow") {
        return true;
      }
      let mut state = state.lock();
      state.observers.push((group, property.clone()));
      out.push(success(id, Value::Null));
      if let Some(value) = state.properties.get(&property) {
        out.push(change_event(&property, value, group));
      }
    }
    "unobserve_property" => {
      let group = args.get(1).and_then(Value::as_i64).unwrap_or_default();
      state.lock().observers.retain(|(g, _)| *g != group);
      out.push(success(id, Value::Null));
    }
    "x-ignore" => {}
    "x-late" => {
      let delay = args.get(1).and_then(Value::as_u64).unwrap_or(100);
      let writer = writer.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        write_line(&writer, &success(id, json!("late"))).await;
      });
    }
    "x-emit" => {
      let event = args.get(1).and_then(Value::as_str).unwrap_or("x-custom");
      out.push(success(id, Value::Null));
      out.push(json!({"event": event}).to_string());
    }
    "exit" | "quit" => {
      out.push(success(id, Value::Null));
      keep_open = false;
    }
    _ => out.push(success(id, Value::Null)),
  }

  for line in out {
    write_line(writer, &line).await;
  }
  keep_open
}
