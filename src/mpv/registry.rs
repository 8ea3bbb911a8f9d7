//! Event subscriptions and property observation reference counts.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_channel::Sender;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::protocol::{MpvEvent, PROPERTY_CHANGE};

/// Callback invoked for every matching event. The returned future runs on
/// the subscriber's delivery task once the previous one finished, so it may
/// issue further commands on the same client.
pub type EventHandler = Arc<dyn Fn(MpvEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Build an [`EventHandler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> EventHandler
where
  F: Fn(MpvEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  Arc::new(move |event| f(event).boxed())
}

/// What a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
  /// Every event with this name.
  Event(String),
  /// Changes of one property observed under a group id.
  Property { name: String, id: i64 },
}

impl Subscription {
  pub fn event(name: impl Into<String>) -> Self {
    Subscription::Event(name.into())
  }

  pub fn property(name: impl Into<String>, id: i64) -> Self {
    Subscription::Property {
      name: name.into(),
      id,
    }
  }

  pub fn matches(&self, event: &MpvEvent) -> bool {
    match self {
      Subscription::Event(name) => event.event == *name,
      Subscription::Property { name, id } => {
        event.event == PROPERTY_CHANGE
          && event.name.as_deref() == Some(name.as_str())
          && event.id == Some(*id)
          && event.data.as_ref().is_some_and(|data| !data.is_null())
      }
    }
  }

  fn observation_key(&self) -> Option<(String, i64)> {
    match self {
      Subscription::Event(_) => None,
      Subscription::Property { name, id } => Some((name.clone(), *id)),
    }
  }
}

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of asking the player to observe a pair. `None` while the
/// `observe_property` command is in flight.
pub type ObserveStatus = Option<Result<(), String>>;

/// Result of adding a subscription.
#[derive(Debug)]
pub struct Added {
  pub id: SubscriptionId,
  /// True when this is the first local observer of a (property, group id)
  /// pair, i.e. the player must be asked to start observing.
  pub first_observer: bool,
  /// Player-side observation shared by every subscriber of the pair.
  pub observation: Option<Observation>,
}

/// Shared state of one player-side observation.
#[derive(Debug, Clone)]
pub struct Observation {
  generation: u64,
  status: watch::Receiver<ObserveStatus>,
}

impl Observation {
  /// Wait until the first observer learned whether mpv accepted the
  /// observation.
  pub async fn settled(&mut self) -> Result<(), String> {
    loop {
      if let Some(status) = self.status.borrow_and_update().clone() {
        return status;
      }
      if self.status.changed().await.is_err() {
        return self
          .status
          .borrow()
          .clone()
          .unwrap_or_else(|| Err("observation cancelled".to_string()));
      }
    }
  }
}

/// Result of removing a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
  /// Group id whose player-side observation is no longer needed.
  pub released_group: Option<i64>,
}

struct Entry {
  subscription: Subscription,
  handler: EventHandler,
  /// Ordered delivery queue, created on the first matching event.
  lane: Option<Sender<MpvEvent>>,
}

struct PairState {
  count: usize,
  generation: u64,
  status: watch::Sender<ObserveStatus>,
}

struct RegistryState {
  next_id: u64,
  next_generation: u64,
  entries: BTreeMap<u64, Entry>,
  observers: HashMap<(String, i64), PairState>,
}

impl RegistryState {
  /// Remove an entry, returning it and whether its pair became unobserved.
  fn take(&mut self, key: u64) -> Option<(Subscription, bool)> {
    let entry = self.entries.remove(&key)?;
    let mut released = false;
    if let Some(pair) = entry.subscription.observation_key() {
      if let Some(state) = self.observers.get_mut(&pair) {
        state.count -= 1;
        if state.count == 0 {
          self.observers.remove(&pair);
          released = true;
        }
      }
    }
    Some((entry.subscription, released))
  }

  fn take_where(&mut self, predicate: impl Fn(&Subscription) -> bool) -> Vec<(Subscription, bool)> {
    let keys: Vec<u64> = self
      .entries
      .iter()
      .filter(|(_, entry)| predicate(&entry.subscription))
      .map(|(key, _)| *key)
      .collect();
    keys.into_iter().filter_map(|key| self.take(key)).collect()
  }
}

/// Registry of event subscribers.
///
/// Only bookkeeping happens under the lock. Issuing observe/unobserve
/// commands and running handlers is left to the caller.
pub struct SubscriptionRegistry {
  state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(RegistryState {
        next_id: 1,
        next_generation: 1,
        entries: BTreeMap::new(),
        observers: HashMap::new(),
      }),
    }
  }

  pub fn subscribe(&self, subscription: Subscription, handler: EventHandler) -> Added {
    let mut state = self.state.lock();
    let key = state.next_id;
    state.next_id += 1;

    let mut first_observer = false;
    let mut observation = None;
    if let Some(pair) = subscription.observation_key() {
      let generation = state.next_generation;
      let pair_state = state.observers.entry(pair).or_insert_with(|| {
        first_observer = true;
        PairState {
          count: 0,
          generation,
          status: watch::Sender::new(None),
        }
      });
      pair_state.count += 1;
      observation = Some(Observation {
        generation: pair_state.generation,
        status: pair_state.status.subscribe(),
      });
      if first_observer {
        state.next_generation += 1;
      }
    }

    state.entries.insert(
      key,
      Entry {
        subscription,
        handler,
        lane: None,
      },
    );

    Added {
      id: SubscriptionId(key),
      first_observer,
      observation,
    }
  }

  /// Record the player's answer to the observe command of a pair.
  ///
  /// On failure every subscription of that pair is removed and the number
  /// of removed subscriptions is returned. A stale generation (the pair was
  /// released and observed again meanwhile) is ignored.
  pub fn settle_observation(
    &self,
    property: &str,
    group: i64,
    observation: &Observation,
    result: Result<(), String>,
  ) -> usize {
    let mut state = self.state.lock();
    let pair = (property.to_string(), group);
    let Some(pair_state) = state.observers.get(&pair) else {
      return 0;
    };
    if pair_state.generation != observation.generation {
      return 0;
    }
    pair_state.status.send_replace(Some(result.clone()));
    if result.is_ok() {
      return 0;
    }

    state.observers.remove(&pair);
    let keys: Vec<u64> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.subscription.observation_key().as_ref() == Some(&pair))
      .map(|(key, _)| *key)
      .collect();
    for key in &keys {
      state.entries.remove(key);
    }
    keys.len()
  }

  /// Remove exactly one subscription. `None` if the handle is unknown.
  pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Removed> {
    let (subscription, released) = self.state.lock().take(id.0)?;
    let released_group = match (&subscription, released) {
      (Subscription::Property { id, .. }, true) => Some(*id),
      _ => None,
    };
    Some(Removed { released_group })
  }

  /// Remove every subscription on a property, whatever its group id.
  /// Returns the group ids that no longer have a local observer.
  pub fn unsubscribe_property(&self, property: &str) -> Vec<i64> {
    let removed = self.state.lock().take_where(|subscription| {
      matches!(subscription, Subscription::Property { name, .. } if name == property)
    });
    released_groups(removed)
  }

  /// Remove every property subscription sharing a group id.
  /// Returns true when at least one observation was released.
  pub fn unsubscribe_group(&self, group: i64) -> bool {
    let removed = self.state.lock().take_where(|subscription| {
      matches!(subscription, Subscription::Property { id, .. } if *id == group)
    });
    !released_groups(removed).is_empty()
  }

  /// Remove everything. Returns the group ids that were being observed.
  pub fn clear(&self) -> Vec<i64> {
    let mut state = self.state.lock();
    let mut groups: Vec<i64> = state.observers.keys().map(|(_, id)| *id).collect();
    groups.sort_unstable();
    groups.dedup();
    state.entries.clear();
    state.observers.clear();
    groups
  }

  /// Queue `event` on the lane of every matching subscriber, in
  /// registration order. `open_lane` creates the lane of a subscriber that
  /// has none yet. Returns how many subscribers the event was queued for.
  pub fn deliver(
    &self,
    event: &MpvEvent,
    mut open_lane: impl FnMut(EventHandler) -> Sender<MpvEvent>,
  ) -> usize {
    let mut state = self.state.lock();
    let mut delivered = 0;
    for entry in state.entries.values_mut() {
      if !entry.subscription.matches(event) {
        continue;
      }
      let lane = entry
        .lane
        .get_or_insert_with(|| open_lane(entry.handler.clone()));
      if lane.try_send(event.clone()).is_ok() {
        delivered += 1;
      }
    }
    delivered
  }

  /// Number of local observers of a (property, group id) pair.
  pub fn observer_count(&self, property: &str, group: i64) -> usize {
    self
      .state
      .lock()
      .observers
      .get(&(property.to_string(), group))
      .map_or(0, |pair| pair.count)
  }

  pub fn len(&self) -> usize {
    self.state.lock().entries.len()
  }
}

impl Default for SubscriptionRegistry {
  fn default() -> Self {
    Self::new()
  }
}

fn released_groups(removed: Vec<(Subscription, bool)>) -> Vec<i64> {
  let mut groups: Vec<i64> = removed
    .into_iter()
    .filter_map(|(subscription, released)| match subscription {
      Subscription::Property { id, .. } if released => Some(id),
      _ => None,
    })
    .collect();
  groups.sort_unstable();
  groups.dedup();
  groups
}
