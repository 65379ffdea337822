//! Keys of an attribute's circular key space.

/// A position in an attribute's key space.
///
/// Arithmetic through the operator impls wraps at the u64 boundary.
/// Wrapping at the attribute bounds goes through [AttrSpace].
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Value(pub u64);

impl Value {
    /// Construct a value.
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw key.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Multiply by a real factor, truncating. Negative and NaN factors
    /// give zero, overflow saturates.
    pub fn scale(self, factor: f64) -> Self {
        let v = self.0 as f64 * factor;
        if v.is_nan() || v <= 0.0 {
            Self(0)
        } else if v >= u64::MAX as f64 {
            Self(u64::MAX)
        } else {
            Self(v as u64)
        }
    }

    /// `self / other` as a real number, zero if `other` is zero.
    pub fn ratio(self, other: Value) -> f64 {
        if other.0 == 0 {
            return 0.0;
        }
        self.0 as f64 / other.0 as f64
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::ops::Add for Value {
    type Output = Value;

    fn add(self, rhs: Value) -> Value {
        Value(self.0.wrapping_add(rhs.0))
    }
}

impl std::ops::Sub for Value {
    type Output = Value;

    fn sub(self, rhs: Value) -> Value {
        Value(self.0.wrapping_sub(rhs.0))
    }
}

impl std::ops::Div<u64> for Value {
    type Output = Value;

    fn div(self, rhs: u64) -> Value {
        Value(self.0 / rhs)
    }
}

/// The bounds `[abs_min, abs_max]` of one attribute's key space.
///
/// `abs_max` and `abs_min` denote the same point on the circle. Range
/// ends prefer `abs_max` (see [AttrSpace::normalize_max]) so that the
/// node owning the top of the space is recognizably "rightmost".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct AttrSpace {
    /// Smallest key.
    pub abs_min: Value,

    /// Largest key.
    pub abs_max: Value,
}

impl AttrSpace {
    /// Construct a key space.
    pub const fn new(abs_min: u64, abs_max: u64) -> Self {
        Self {
            abs_min: Value(abs_min),
            abs_max: Value(abs_max),
        }
    }

    /// Total size of the circle.
    pub fn width(&self) -> Value {
        self.abs_max - self.abs_min
    }

    /// Whether `v` lies within the bounds.
    pub fn contains(&self, v: Value) -> bool {
        v >= self.abs_min && v <= self.abs_max
    }

    /// Pull `v` into the bounds.
    pub fn clamp(&self, v: Value) -> Value {
        v.clamp(self.abs_min, self.abs_max)
    }

    /// A range end that landed on `abs_min` is spelled `abs_max`.
    pub fn normalize_max(&self, v: Value) -> Value {
        if v == self.abs_min {
            self.abs_max
        } else {
            v
        }
    }

    /// Move `v` clockwise by `d`, wrapping past `abs_max`.
    pub fn forward(&self, v: Value, d: Value) -> Value {
        let w = self.width().0 as u128;
        if w == 0 {
            return self.abs_min;
        }
        let off = (v.0.saturating_sub(self.abs_min.0) as u128 + d.0 as u128)
            % w;
        Value(self.abs_min.0 + off as u64)
    }

    /// Move `v` counter-clockwise by `d`, wrapping below `abs_min`.
    pub fn backward(&self, v: Value, d: Value) -> Value {
        let w = self.width().0 as u128;
        if w == 0 {
            return self.abs_min;
        }
        let off = v.0.saturating_sub(self.abs_min.0) as u128 % w;
        let d = d.0 as u128 % w;
        Value(self.abs_min.0 + ((off + w - d) % w) as u64)
    }

    /// Clockwise distance from `min` to `max`. Zero when they are equal.
    pub fn span(&self, min: Value, max: Value) -> Value {
        if min < max {
            max - min
        } else if min == max {
            Value(0)
        } else {
            (self.abs_max - min) + (max - self.abs_min)
        }
    }

    /// The point halfway along the clockwise arc from `min` to `max`.
    pub fn midpoint(&self, min: Value, max: Value) -> Value {
        self.forward(min, self.span(min, max) / 2)
    }
}
