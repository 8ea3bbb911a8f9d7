//! Classifies incoming lines and hands them to the correlator or to event
//! subscribers.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pending::PendingRequests;
use super::protocol::{MpvEvent, MpvMessage};
use super::registry::{EventHandler, SubscriptionRegistry};

/// Routes each message from mpv to where it belongs.
///
/// Responses complete their pending request inline (a map removal and a
/// oneshot send). Events are queued for the [`Dispatcher`], so nothing a
/// subscriber does can hold up the next line.
pub struct Router {
  pending: Arc<PendingRequests>,
  event_tx: Sender<MpvEvent>,
}

impl Router {
  pub fn new(pending: Arc<PendingRequests>) -> (Self, Receiver<MpvEvent>) {
    let (event_tx, event_rx) = async_channel::unbounded();
    (Self { pending, event_tx }, event_rx)
  }

  /// Route one raw line. Lines that are not JSON objects are logged and
  /// dropped.
  pub fn route_line(&self, line: &str) {
    match MpvMessage::parse(line) {
      Ok(message) => self.route(message),
      Err(e) => log::warn!("Failed to parse MPV message: {} - {}", e, line),
    }
  }

  /// Route a decoded value, as if it had been received from mpv.
  pub fn route_value(&self, value: Value) {
    match MpvMessage::from_value(value) {
      Ok(message) => self.route(message),
      Err(e) => log::warn!("Ignoring simulated MPV message: {}", e),
    }
  }

  pub fn route(&self, message: MpvMessage) {
    match message {
      MpvMessage::Response(response) => {
        let request_id = response.request_id;
        if self.pending.complete(response) {
          log::debug!("MPV router: completed request_id={}", request_id);
        } else {
          log::debug!(
            "MPV router: discarding response for request_id={} (nobody waiting)",
            request_id
          );
        }
      }
      MpvMessage::Event(event) => {
        log::debug!("MPV router: received event {}", event.event);
        if self.event_tx.try_send(event).is_err() {
          log::debug!("MPV router: dispatcher stopped, dropping event");
        }
      }
      MpvMessage::Other => {}
    }
  }

  /// Consume lines until the channel closes or `cancel` fires.
  pub fn spawn(self: Arc<Self>, line_rx: Receiver<String>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
      log::info!("MPV router loop started");
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          line = line_rx.recv() => match line {
            Ok(line) => self.route_line(&line),
            Err(_) => break,
          },
        }
      }
      log::info!("MPV router loop stopped");
    })
  }
}

/// Fans events out to matching subscribers.
///
/// Every subscriber has its own lane: a queue drained by a task that awaits
/// the subscriber's handler futures one after another, so each subscriber
/// sees events in arrival order while a slow subscriber only delays itself.
/// At most `concurrency` handler futures run at once across all lanes.
pub struct Dispatcher {
  registry: Arc<SubscriptionRegistry>,
  permits: Arc<Semaphore>,
  cancel: CancellationToken,
}

impl Dispatcher {
  pub fn new(registry: Arc<SubscriptionRegistry>, concurrency: usize, cancel: CancellationToken) -> Self {
    Self {
      registry,
      permits: Arc::new(Semaphore::new(concurrency.max(1))),
      cancel,
    }
  }

  /// Queue one event for every matching subscriber. Never waits.
  /// Returns the number of subscribers it was queued for.
  pub fn dispatch(&self, event: &MpvEvent) -> usize {
    self
      .registry
      .deliver(event, |handler| self.open_lane(handler))
  }

  fn open_lane(&self, handler: EventHandler) -> Sender<MpvEvent> {
    let (lane_tx, lane_rx) = async_channel::unbounded::<MpvEvent>();
    let permits = self.permits.clone();
    let cancel = self.cancel.clone();
    tokio::spawn(async move {
      loop {
        let event = tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          event = lane_rx.recv() => match event {
            Ok(event) => event,
            // Subscription removed and its queue drained.
            Err(_) => break,
          },
        };
        let Ok(_permit) = permits.acquire().await else {
          break;
        };
        handler(event).await;
      }
    });
    lane_tx
  }

  pub fn spawn(self, event_rx: Receiver<MpvEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = self.cancel.cancelled() => break,
          event = event_rx.recv() => match event {
            Ok(event) => {
              self.dispatch(&event);
            }
            Err(_) => break,
          },
        }
      }
      log::info!("MPV event dispatcher stopped");
    })
  }
}
