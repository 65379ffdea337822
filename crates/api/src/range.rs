//! Ranges owned by nodes and range constraints carried by items.
//!
//! All comparisons here are circular: an interval whose `min` is greater
//! than its `max` crosses the `abs_max -> abs_min` boundary.

use crate::*;

/// Is `test` strictly inside the clockwise arc `(left, right)`?
///
/// `left == right` is the degenerate "I am my own successor" case and
/// matches everything.
pub fn is_between(test: Value, left: Value, right: Value) -> bool {
    if left == right {
        return true;
    }
    if left < right {
        test > left && test < right
    } else {
        test > left || test < right
    }
}

/// Is `test` inside the clockwise arc `[left, right]`?
pub fn is_between_inclusive(test: Value, left: Value, right: Value) -> bool {
    if left == right {
        return true;
    }
    if left < right {
        test >= left && test <= right
    } else {
        test >= left || test <= right
    }
}

/// Is `test` inside the clockwise arc `[left, right)`?
pub fn is_between_left_inclusive(
    test: Value,
    left: Value,
    right: Value,
) -> bool {
    if left == right {
        return true;
    }
    if left < right {
        test >= left && test < right
    } else {
        test >= left || test < right
    }
}

/// Is `test` inside the clockwise arc `(left, right]`?
pub fn is_between_right_inclusive(
    test: Value,
    left: Value,
    right: Value,
) -> bool {
    if left == right {
        return true;
    }
    if left < right {
        test > left && test <= right
    } else {
        test > left || test <= right
    }
}

/// The slice of an attribute ring owned by one node, `[min, max)`.
///
/// Node ranges are replaced wholesale whenever ownership changes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct NodeRange {
    /// The attribute ring this range belongs to.
    pub attr: AttrId,

    /// First owned key.
    pub min: Value,

    /// First key owned by the successor.
    pub max: Value,
}

impl NodeRange {
    /// Construct a node range.
    pub fn new(attr: AttrId, min: Value, max: Value) -> Self {
        Self { attr, min, max }
    }

    /// The range covering an entire attribute space.
    pub fn full(attr: AttrId, space: &AttrSpace) -> Self {
        Self::new(attr, space.abs_min, space.abs_max)
    }

    /// Whether the range crosses the top of the key space.
    pub fn is_wrapped(&self) -> bool {
        self.min > self.max
    }

    /// A zero-width range owns nothing.
    pub fn is_empty(&self) -> bool {
        self.min == self.max
    }

    /// Whether `v` is owned by this range.
    pub fn covers(&self, v: Value) -> bool {
        if self.is_wrapped() {
            v >= self.min || v < self.max
        } else {
            self.min <= v && v < self.max
        }
    }

    /// Clockwise width of the range.
    pub fn span(&self, space: &AttrSpace) -> Value {
        space.span(self.min, self.max)
    }

    /// Whether this range ends exactly where `next` begins.
    pub fn abuts(&self, next: &NodeRange, space: &AttrSpace) -> bool {
        space.normalize_max(self.max) == space.normalize_max(next.min)
            || self.max == next.min
    }
}

impl std::fmt::Display for NodeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:[{},{})", self.attr, self.min, self.max)
    }
}

/// How an item constraint relates to a node range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteDirections {
    /// The constraint starts before the range.
    pub left: bool,

    /// The constraint overlaps the range; the node is a rendezvous point.
    pub center: bool,

    /// The constraint reaches past the end of the range.
    pub right: bool,
}

/// A closed interval `[min, max]` over one attribute, carried by
/// publications and subscriptions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct Constraint {
    /// The attribute constrained.
    pub attr: AttrId,

    /// Lower bound, inclusive.
    pub min: Value,

    /// Upper bound, inclusive.
    pub max: Value,
}

impl Constraint {
    /// Construct a constraint.
    pub fn new(attr: AttrId, min: Value, max: Value) -> Self {
        Self { attr, min, max }
    }

    /// A constraint matching exactly one value.
    pub fn point(attr: AttrId, v: Value) -> Self {
        Self::new(attr, v, v)
    }

    /// Constraints must not be inverted. Wrapping items are not routable.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    /// Pull both ends into the key space.
    pub fn clamp(&self, space: &AttrSpace) -> Self {
        Self::new(self.attr, space.clamp(self.min), space.clamp(self.max))
    }

    /// Whether `v` satisfies the constraint.
    pub fn contains(&self, v: Value) -> bool {
        self.min <= v && v <= self.max
    }

    /// Whether two constraints share at least one value.
    pub fn overlaps(&self, other: &Constraint) -> bool {
        (self.min >= other.min && self.min <= other.max)
            || (other.min >= self.min && other.min <= self.max)
    }

    /// Whether the constraint touches a node range. The range's upper
    /// end counts as touching.
    pub fn overlaps_range(&self, range: &NodeRange) -> bool {
        if range.is_wrapped() {
            return !(self.min >= range.max && self.max < range.min);
        }
        (self.min >= range.min && self.min <= range.max)
            || (range.min >= self.min && range.min <= self.max)
    }

    /// Classify this constraint against `range`.
    ///
    /// `am_rightmost` marks the node owning `abs_max`. It never needs to
    /// forward right and also owns the `abs_max` key itself.
    pub fn route_directions(
        &self,
        range: &NodeRange,
        am_rightmost: bool,
    ) -> RouteDirections {
        if range.is_wrapped() {
            // [min, abs_max] ++ [abs_min, max)
            let in_gap = self.min >= range.max && self.min < range.min;
            return RouteDirections {
                left: in_gap,
                center: self.overlaps_range(range),
                right: self.min < range.max && self.max >= range.max,
            };
        }

        let left = self.min < range.min;
        let (center, right) = if am_rightmost {
            (!(self.max < range.min || self.min > range.max), false)
        } else {
            (
                !(self.max < range.min || self.min >= range.max),
                self.max >= range.max,
            )
        };
        RouteDirections {
            left,
            center,
            right,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:[{},{}]", self.attr, self.min, self.max)
    }
}
