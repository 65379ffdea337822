//! Publications and subscriptions routed through the overlay.

use crate::*;

/// A publication: a payload described by range constraints over one or
/// more attributes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Creator-local identifier. `(creator, id)` is unique.
    pub id: u64,

    /// The node that published this event.
    pub creator: PeerAddr,

    /// One constraint per described attribute.
    pub constraints: Vec<Constraint>,

    /// Opaque application payload.
    pub payload: bytes::Bytes,

    /// How long the event stays stored as a trigger at rendezvous nodes.
    /// Zero means match once and never store.
    pub lifetime_ms: u32,
}

/// A subscription: a conjunction of range constraints.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interest {
    /// Subscriber-local identifier. `(subscriber, id)` is unique.
    pub id: u64,

    /// Where matched publications are delivered.
    pub subscriber: PeerAddr,

    /// Every constraint must be satisfied for a match.
    pub constraints: Vec<Constraint>,

    /// How long the subscription stays stored at rendezvous nodes.
    pub lifetime_ms: u32,
}

fn find(cs: &[Constraint], attr: AttrId) -> Option<&Constraint> {
    cs.iter().find(|c| c.attr == attr)
}

impl Event {
    /// The constraint over `attr`, if any.
    pub fn constraint(&self, attr: AttrId) -> Option<&Constraint> {
        find(&self.constraints, attr)
    }

    /// Lifetime as a duration.
    pub fn lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lifetime_ms as u64)
    }
}

impl Interest {
    /// The constraint over `attr`, if any.
    pub fn constraint(&self, attr: AttrId) -> Option<&Constraint> {
        find(&self.constraints, attr)
    }

    /// Lifetime as a duration.
    pub fn lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lifetime_ms as u64)
    }

    /// An event matches when, for every attribute this interest
    /// constrains, the event carries an overlapping constraint.
    pub fn matches(&self, event: &Event) -> bool {
        self.constraints.iter().all(|ic| {
            event
                .constraint(ic.attr)
                .map(|ec| ec.overlaps(ic))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ev(cs: Vec<Constraint>) -> Event {
        Event {
            id: 1,
            creator: "mem://1".into(),
            constraints: cs,
            payload: bytes::Bytes::from_static(b"hello"),
            lifetime_ms: 0,
        }
    }

    fn int(cs: Vec<Constraint>) -> Interest {
        Interest {
            id: 1,
            subscriber: "mem://2".into(),
            constraints: cs,
            lifetime_ms: 10_000,
        }
    }

    #[test]
    fn interest_matches_all_constraints() {
        let a = AttrId(0);
        let b = AttrId(1);
        let e = ev(vec![
            Constraint::point(a, Value(70)),
            Constraint::point(b, Value(3)),
        ]);

        assert!(int(vec![Constraint::new(a, Value(60), Value(80))]).matches(&e));
        assert!(int(vec![
            Constraint::new(a, Value(60), Value(80)),
            Constraint::new(b, Value(0), Value(3)),
        ])
        .matches(&e));
        assert!(!int(vec![
            Constraint::new(a, Value(60), Value(80)),
            Constraint::new(b, Value(4), Value(9)),
        ])
        .matches(&e));
    }

    #[test]
    fn missing_attribute_does_not_match() {
        let e = ev(vec![Constraint::point(AttrId(0), Value(5))]);
        let i = int(vec![Constraint::new(AttrId(2), Value(0), Value(9))]);
        assert!(!i.matches(&e));
    }

    #[test]
    fn event_wire_form_is_camel_case() {
        let e = ev(vec![]);
        let enc = serde_json::to_string(&e).unwrap();
        assert!(enc.contains("\"lifetimeMs\":0"));
        let dec: Event = serde_json::from_str(&enc).unwrap();
        assert_eq!(e, dec);
    }
}
