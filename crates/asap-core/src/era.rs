//! Era: a circular epoch counter.
//!
//! The successor of `u32::MAX` is zero. Ordering between eras is only
//! meaningful relative to a starting point, so this type deliberately does
//! not implement `Ord`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One synchronization window of a sync engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Era(pub u32);

impl Era {
    /// The smallest era value.
    pub const MIN: Self = Self(0);

    /// The largest era value. Its successor is [`Era::MIN`].
    pub const MAX: Self = Self(u32::MAX);

    /// Create from the raw counter value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw counter value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The era following this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// The era preceding this one.
    pub const fn previous(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Number of successor steps needed to get from `self` to `other`.
    pub const fn distance_to(self, other: Era) -> u32 {
        other.0.wrapping_sub(self.0)
    }

    /// Whether `self` lies in the inclusive range `from..=to`.
    ///
    /// A range with `from > to` has wrapped: it contains every era `>= from`
    /// and every era `<= to`.
    pub fn is_within(self, from: Era, to: Era) -> bool {
        if from.0 <= to.0 {
            from.0 <= self.0 && self.0 <= to.0
        } else {
            self.0 >= from.0 || self.0 <= to.0
        }
    }

    /// Iterate `from..=to`, following successor steps across the wrap.
    pub fn range(from: Era, to: Era) -> EraRange {
        EraRange {
            next: Some(from),
            last: to,
        }
    }

    /// Sort eras by their distance from `start`, so that `start` comes first
    /// and the era just before it comes last.
    pub fn sort_from(start: Era, eras: &mut [Era]) {
        eras.sort_by_key(|era| start.distance_to(*era));
    }
}

impl fmt::Debug for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Era({})", self.0)
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Era {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Inclusive, wraparound-aware iterator over eras.
#[derive(Debug, Clone)]
pub struct EraRange {
    next: Option<Era>,
    last: Era,
}

impl Iterator for EraRange {
    type Item = Era;

    fn next(&mut self) -> Option<Era> {
        let current = self.next?;
        self.next = if current == self.last {
            None
        } else {
            Some(current.next())
        };
        Some(current)
    }
}
