//! Rate limiting for event handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future;
use futures_util::FutureExt;
use parking_lot::Mutex;

use super::registry::EventHandler;

/// Accepts at most one event per interval.
#[derive(Debug)]
pub struct Debouncer {
  interval: Duration,
  last_accepted: Mutex<Option<Instant>>,
}

impl Debouncer {
  /// Interval in seconds. Negative or non-finite values accept everything.
  pub fn new(seconds: f64) -> Self {
    Self {
      interval: Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO),
      last_accepted: Mutex::new(None),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn accept(&self) -> bool {
    self.accept_at(Instant::now())
  }

  /// Decide for an event observed at `now`, recording it when accepted.
  pub fn accept_at(&self, now: Instant) -> bool {
    let mut last = self.last_accepted.lock();
    let accepted = match *last {
      None => true,
      Some(previous) => now.saturating_duration_since(previous) > self.interval,
    };
    if accepted {
      *last = Some(now);
    }
    accepted
  }
}

/// Wrap `inner` so it runs at most once every `seconds`; extra events are
/// dropped. Every call creates an independent timer.
pub fn debounce(seconds: f64, inner: EventHandler) -> EventHandler {
  let debouncer = Debouncer::new(seconds);
  Arc::new(move |event| {
    if debouncer.accept() {
      inner(event)
    } else {
      future::ready(()).boxed()
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::protocol::MpvEvent;
  use crate::mpv::registry::handler;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_accepts_first_and_after_interval() {
    let t = Duration::from_millis(200);
    let eps = Duration::from_millis(1);
    let debouncer = Debouncer::new(t.as_secs_f64());
    let start = Instant::now();

    let accepted: Vec<bool> = [Duration::ZERO, t / 2, t / 2 + eps, t * 2]
      .into_iter()
      .map(|offset| debouncer.accept_at(start + offset))
      .collect();

    assert_eq!(accepted, vec![true, false, false, true]);
  }

  #[test]
  fn test_boundary_is_exclusive() {
    let debouncer = Debouncer::new(1.0);
    let start = Instant::now();
    assert!(debouncer.accept_at(start));
    assert!(!debouncer.accept_at(start + Duration::from_secs(1)));
    assert!(debouncer.accept_at(start + Duration::from_millis(1001)));
  }

  #[test]
  fn test_invalid_interval_accepts_everything() {
    let debouncer = Debouncer::new(-3.0);
    let now = Instant::now();
    assert_eq!(debouncer.interval(), Duration::ZERO);
    assert!(debouncer.accept_at(now));
    assert!(debouncer.accept_at(now + Duration::from_nanos(1)));
  }

  #[tokio::test]
  async fn test_wrapped_handlers_have_independent_timers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let inner = handler(move |_event| {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    let first = debounce(60.0, inner.clone());
    let second = debounce(60.0, inner);
    let event = MpvEvent::property_change("volume", 10, 1);

    first(event.clone()).await;
    first(event.clone()).await;
    second(event.clone()).await;
    second(event).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
