//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Event name mpv uses for observed property notifications.
pub const PROPERTY_CHANGE: &str = "property-change";

/// A line received from mpv that could not be turned into a message.
#[derive(Error, Debug)]
pub enum ProtocolError {
  #[error("Invalid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Not a JSON object")]
  NotAnObject,
}

/// A command that has not been assigned a request id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MpvCommand {
  name: String,
  args: Vec<Value>,
}

impl MpvCommand {
  pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
    Self {
      name: name.into(),
      args,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Attach a request id, producing the wire form.
  pub fn into_request(self, request_id: i64) -> MpvRequest {
    let mut command = Vec::with_capacity(self.args.len() + 1);
    command.push(Value::String(self.name));
    command.extend(self.args);
    MpvRequest {
      command,
      request_id,
    }
  }

  /// Load a file, replacing the current one or appending to the playlist.
  pub fn loadfile(url: &str, append: bool) -> Self {
    let mode = if append { "append-play" } else { "replace" };
    Self::new("loadfile", vec![url.trim().into(), mode.into()])
  }

  /// Seek by `amount` using an mpv seek flag ("relative", "absolute", ...).
  pub fn seek(amount: f64, flag: &str) -> Self {
    Self::new("seek", vec![amount.into(), flag.into()])
  }

  pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
    Self::new("set_property", vec![name.into(), value.into()])
  }

  pub fn get_property(name: &str) -> Self {
    Self::new("get_property", vec![name.into()])
  }

  /// Observe a property for changes under a group id.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new("observe_property", vec![id.into(), name.into()])
  }

  /// Stop every observation registered under a group id.
  pub fn unobserve_property(id: i64) -> Self {
    Self::new("unobserve_property", vec![id.into()])
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self::new("cycle", vec![property.into()])
  }

  pub fn playlist_next() -> Self {
    Self::new("playlist-next", Vec::new())
  }

  pub fn playlist_prev() -> Self {
    Self::new("playlist-prev", Vec::new())
  }

  pub fn stop() -> Self {
    Self::new("stop", Vec::new())
  }
}

/// Command as written to the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvRequest {
  pub command: Vec<Value>,
  pub request_id: i64,
}

impl MpvRequest {
  /// Serialize to a single line (without the terminator).
  pub fn to_line(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvResponse {
  /// Matching request ID.
  pub request_id: i64,
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<Value>,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }

  /// Split into the data on success or the player's error message.
  pub fn into_result(self) -> Result<Option<Value>, String> {
    if self.is_success() {
      Ok(self.data)
    } else {
      Err(self.error)
    }
  }
}

/// Event sent by MPV (property changes, playback events, custom events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file", "client-message").
  pub event: String,
  /// Group ID for property-change events.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  /// Property name for property-change events.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Event data.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  /// Any other event-specific fields ("reason", "args", ...).
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl MpvEvent {
  pub fn new(event: impl Into<String>) -> Self {
    Self {
      event: event.into(),
      id: None,
      name: None,
      data: None,
      extra: Map::new(),
    }
  }

  /// Build a property-change event as mpv would send it.
  pub fn property_change(name: &str, data: impl Into<Value>, id: i64) -> Self {
    Self {
      event: PROPERTY_CHANGE.to_string(),
      id: Some(id),
      name: Some(name.to_string()),
      data: Some(data.into()),
      extra: Map::new(),
    }
  }

  pub fn with_data(mut self, data: impl Into<Value>) -> Self {
    self.data = Some(data.into());
    self
  }

  /// Look up an event-specific field not covered by the named ones.
  pub fn field(&self, key: &str) -> Option<&Value> {
    self.extra.get(key)
  }

  /// View this event as a property change, if it is one.
  pub fn as_property_change(&self) -> Option<PropertyChange<'_>> {
    if self.event != PROPERTY_CHANGE {
      return None;
    }
    Some(PropertyChange {
      name: self.name.as_deref()?,
      data: self.data.as_ref().unwrap_or(&Value::Null),
      id: self.id?,
    })
  }
}

/// Borrowed view over a property-change event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyChange<'a> {
  pub name: &'a str,
  pub data: &'a Value,
  pub id: i64,
}

/// Typed property values from MPV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Bool(bool),
  Number(f64),
  String(String),
  Null,
  /// Arrays and objects (track lists, metadata, ...).
  Json(Value),
}

impl From<Value> for PropertyValue {
  fn from(value: Value) -> Self {
    match value {
      Value::Bool(b) => PropertyValue::Bool(b),
      Value::Number(n) => PropertyValue::Number(n.as_f64().unwrap_or(0.0)),
      Value::String(s) => PropertyValue::String(s),
      Value::Array(_) | Value::Object(_) => PropertyValue::Json(value),
      Value::Null => PropertyValue::Null,
    }
  }
}

/// Playback timing of the current file, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackTimes {
  pub position: Option<f64>,
  pub remaining: Option<f64>,
  pub duration: Option<f64>,
}

/// Message received from MPV IPC.
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
  /// A JSON object that is neither a response nor an event.
  Other,
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  pub fn parse(line: &str) -> Result<Self, ProtocolError> {
    let value: Value = serde_json::from_str(line)?;
    Self::from_value(value)
  }

  /// Classify an already decoded JSON value.
  pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
    let Value::Object(object) = value else {
      return Err(ProtocolError::NotAnObject);
    };

    if object.contains_key("request_id") {
      let response: MpvResponse = serde_json::from_value(Value::Object(object))?;
      Ok(MpvMessage::Response(response))
    } else if object.contains_key("event") {
      let event: MpvEvent = serde_json::from_value(Value::Object(object))?;
      Ok(MpvMessage::Event(event))
    } else {
      Ok(MpvMessage::Other)
    }
  }
}

/// Group id used when an observer does not pick one.
///
/// Derived from the property name so independent callers observing the same
/// property without an explicit id share one player-side observation.
pub fn default_group_id(property: &str) -> i64 {
  let hash = property
    .encode_utf16()
    .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)));
  i64::from(hash)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_request_serialization() {
    let request = MpvCommand::observe_property(3, "volume").into_request(42);
    let line = request.to_line().unwrap();
    let value: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(
      value,
      json!({"command": ["observe_property", 3, "volume"], "request_id": 42})
    );
    assert!(!line.contains('\n'));
  }

  #[test]
  fn test_response_parsing() {
    let json = r#"{"error":"success","data":null,"request_id":1}"#;
    let msg = MpvMessage::parse(json).unwrap();
    match msg {
      MpvMessage::Response(r) => {
        assert!(r.is_success());
        assert_eq!(r.request_id, 1);
      }
      _ => panic!("Expected response"),
    }
  }

  #[test]
  fn test_error_response_is_data() {
    let json = r#"{"error":"property unavailable","request_id":7}"#;
    let MpvMessage::Response(r) = MpvMessage::parse(json).unwrap() else {
      panic!("Expected response");
    };
    assert!(!r.is_success());
    assert_eq!(r.data, None);
    assert_eq!(r.into_result(), Err("property unavailable".to_string()));
  }

  #[test]
  fn test_event_parsing() {
    let json = r#"{"event":"property-change","id":1,"name":"pause","data":false}"#;
    let msg = MpvMessage::parse(json).unwrap();
    match msg {
      MpvMessage::Event(e) => {
        let change = e.as_property_change().unwrap();
        assert_eq!(change.name, "pause");
        assert_eq!(change.data, &Value::Bool(false));
        assert_eq!(change.id, 1);
      }
      _ => panic!("Expected event"),
    }
  }

  #[test]
  fn test_event_keeps_extra_fields() {
    let json = r#"{"event":"end-file","reason":"eof","playlist_entry_id":2}"#;
    let MpvMessage::Event(e) = MpvMessage::parse(json).unwrap() else {
      panic!("Expected event");
    };
    assert_eq!(e.field("reason"), Some(&json!("eof")));
    assert!(e.as_property_change().is_none());
  }

  #[test]
  fn test_unclassified_and_invalid_lines() {
    assert!(matches!(
      MpvMessage::parse(r#"{"foo":1}"#),
      Ok(MpvMessage::Other)
    ));
    assert!(matches!(
      MpvMessage::parse("[1,2]"),
      Err(ProtocolError::NotAnObject)
    ));
    assert!(matches!(
      MpvMessage::parse(r#"{"event":"#),
      Err(ProtocolError::Json(_))
    ));
  }

  #[test]
  fn test_default_group_id_is_stable() {
    assert_eq!(default_group_id("volume"), default_group_id("volume"));
    assert_ne!(default_group_id("volume"), default_group_id("pause"));
    // Same value Java's String.hashCode gives for "a".
    assert_eq!(default_group_id("a"), 97);
  }

  #[test]
  fn test_property_value_from_json() {
    assert_eq!(PropertyValue::from(json!(50.0)), PropertyValue::Number(50.0));
    assert_eq!(
      PropertyValue::from(json!([1, 2])),
      PropertyValue::Json(json!([1, 2]))
    );
    assert_eq!(PropertyValue::from(Value::Null), PropertyValue::Null);
  }
}
