//! Pending request table: request id allocation and response correlation.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::protocol::MpvResponse;

/// Waiter for a single response.
type PendingRequest = oneshot::Sender<MpvResponse>;

struct PendingState {
  next_id: i64,
  waiters: HashMap<i64, PendingRequest>,
}

/// Table of commands awaiting a response.
///
/// Ids are allocated under the same lock that guards the table, so an id is
/// never handed to two in-flight commands.
pub struct PendingRequests {
  state: Mutex<PendingState>,
}

impl PendingRequests {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(PendingState {
        next_id: 1,
        waiters: HashMap::new(),
      }),
    }
  }

  /// Allocate an id without registering a waiter (fire-and-forget commands).
  pub fn next_id(&self) -> i64 {
    let mut state = self.state.lock();
    Self::allocate(&mut state)
  }

  /// Allocate an id and register a waiter for its response.
  pub fn register(&self) -> (i64, oneshot::Receiver<MpvResponse>) {
    let (tx, rx) = oneshot::channel();
    let mut state = self.state.lock();
    let request_id = Self::allocate(&mut state);
    state.waiters.insert(request_id, tx);
    (request_id, rx)
  }

  fn allocate(state: &mut PendingState) -> i64 {
    let id = state.next_id;
    state.next_id = state.next_id.wrapping_add(1).max(1);
    id
  }

  /// Hand a response to its waiter. Returns `false` when nobody is waiting
  /// for that id (already answered, timed out, or never registered).
  pub fn complete(&self, response: MpvResponse) -> bool {
    let waiter = self.state.lock().waiters.remove(&response.request_id);
    match waiter {
      Some(tx) => {
        let request_id = response.request_id;
        if tx.send(response).is_err() {
          log::debug!("Waiter for request_id={} already gone", request_id);
          return false;
        }
        true
      }
      None => false,
    }
  }

  /// Drop the entry for an id (timeout or failed write).
  pub fn forget(&self, request_id: i64) {
    self.state.lock().waiters.remove(&request_id);
  }

  /// Drop every waiter; their receivers observe a closed channel.
  pub fn fail_all(&self) -> usize {
    let mut state = self.state.lock();
    let count = state.waiters.len();
    state.waiters.clear();
    count
  }

  pub fn len(&self) -> usize {
    self.state.lock().waiters.len()
  }
}

impl Default for PendingRequests {
  fn default() -> Self {
    Self::new()
  }
}
