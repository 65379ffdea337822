//! Stored subscriptions and triggers, plus routing load accounting.

use mercury_api::{
    message::{Message, RouteMode, StoredEvent, StoredInterest},
    *,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Either kind of routed item.
#[derive(Debug, Clone)]
pub(crate) enum Item {
    Event(Event),
    Interest(Interest),
}

impl Item {
    pub fn constraint(&self, attr: AttrId) -> Option<&Constraint> {
        match self {
            Item::Event(e) => e.constraint(attr),
            Item::Interest(i) => i.constraint(attr),
        }
    }

    pub fn into_message(self, mode: RouteMode) -> Message {
        match self {
            Item::Event(event) => Message::Publication { event, mode },
            Item::Interest(interest) => Message::Subscription { interest, mode },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Stored<T> {
    pub item: T,
    pub death: Instant,
}

impl<T> Stored<T> {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.death.saturating_duration_since(now)
    }

    pub fn remaining_ms(&self, now: Instant) -> u32 {
        self.remaining(now).as_millis().min(u32::MAX as u128) as u32
    }
}

type Key = (PeerAddr, u64);

/// Items are unique per (owner, id). Re-adding keeps the later death.
#[derive(Debug, Default)]
pub(crate) struct Store {
    interests: BTreeMap<Key, Stored<Interest>>,
    events: BTreeMap<Key, Stored<Event>>,
}

fn upsert<T>(map: &mut BTreeMap<Key, Stored<T>>, key: Key, s: Stored<T>) {
    match map.get_mut(&key) {
        Some(cur) if cur.death >= s.death => (),
        _ => {
            map.insert(key, s);
        }
    }
}

impl Store {
    pub fn add_interest(&mut self, interest: Interest, death: Instant) {
        let key = (interest.subscriber.clone(), interest.id);
        upsert(
            &mut self.interests,
            key,
            Stored {
                item: interest,
                death,
            },
        );
    }

    pub fn add_event(&mut self, event: Event, death: Instant) {
        let key = (event.creator.clone(), event.id);
        upsert(&mut self.events, key, Stored { item: event, death });
    }

    pub fn interests(
        &self,
        now: Instant,
    ) -> impl Iterator<Item = &Stored<Interest>> {
        self.interests.values().filter(move |s| s.death > now)
    }

    pub fn events(&self, now: Instant) -> impl Iterator<Item = &Stored<Event>> {
        self.events.values().filter(move |s| s.death > now)
    }

    pub fn interest_count(&self) -> usize {
        self.interests.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Drop expired entries, returning how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.interests.len() + self.events.len();
        self.interests.retain(|_, s| s.death > now);
        self.events.retain(|_, s| s.death > now);
        before - self.interests.len() - self.events.len()
    }

    /// Live items whose constraint on `attr` touches `range`, with their
    /// remaining lifetime.
    pub fn export(
        &self,
        attr: AttrId,
        range: &NodeRange,
        now: Instant,
    ) -> (Vec<StoredInterest>, Vec<StoredEvent>) {
        let touches = |c: Option<&Constraint>| {
            c.map(|c| c.overlaps_range(range)).unwrap_or(false)
        };
        let interests = self
            .interests(now)
            .filter(|s| touches(s.item.constraint(attr)))
            .map(|s| StoredInterest {
                interest: s.item.clone(),
                remaining_ms: s.remaining_ms(now),
            })
            .collect();
        let events = self
            .events(now)
            .filter(|s| touches(s.item.constraint(attr)))
            .map(|s| StoredEvent {
                event: s.item.clone(),
                remaining_ms: s.remaining_ms(now),
            })
            .collect();
        (interests, events)
    }

    /// Keep only items whose constraint on `attr` touches `range`.
    pub fn retain_overlapping(&mut self, attr: AttrId, range: &NodeRange) {
        self.interests.retain(|_, s| {
            s.item
                .constraint(attr)
                .map(|c| c.overlaps_range(range))
                .unwrap_or(false)
        });
        self.events.retain(|_, s| {
            s.item
                .constraint(attr)
                .map(|c| c.overlaps_range(range))
                .unwrap_or(false)
        });
    }

    pub fn clear(&mut self) {
        self.interests.clear();
        self.events.clear();
    }
}

const LOAD_WINDOWS: usize = 30;

/// Counts routed items per aggregation window.
#[derive(Debug, Default)]
pub(crate) struct RoutingLoad {
    windows: VecDeque<f64>,
    current: f64,
}

impl RoutingLoad {
    pub fn count(&mut self) {
        self.current += 1.0;
    }

    /// Close the current window.
    pub fn roll(&mut self) {
        self.windows.push_back(self.current);
        self.current = 0.0;
        while self.windows.len() > LOAD_WINDOWS {
            self.windows.pop_front();
        }
    }

    /// After a range change, past windows reflect the old range. Scale
    /// them; they age out on their own.
    pub fn scale(&mut self, ratio: f64) {
        if !ratio.is_finite() {
            return;
        }
        for w in self.windows.iter_mut() {
            *w *= ratio;
        }
    }

    /// Mean items per window.
    pub fn load(&self) -> f64 {
        if self.windows.is_empty() {
            return self.current;
        }
        self.windows.iter().sum::<f64>() / self.windows.len() as f64
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.current = 0.0;
    }
}
