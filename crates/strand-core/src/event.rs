//! Readiness event bitmask

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Set of readiness directions for one file descriptor.
///
/// The bit values equal `EPOLLIN`/`EPOLLOUT`, so a mask converts to the
/// kernel interest set without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event(u32);

impl Event {
    /// No direction registered
    pub const NONE: Event = Event(0x0);

    /// Readable (== `EPOLLIN`)
    pub const READ: Event = Event(0x1);

    /// Writable (== `EPOLLOUT`)
    pub const WRITE: Event = Event(0x4);

    const MASK: u32 = Event::READ.0 | Event::WRITE.0;

    /// Raw bit representation
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build a mask from raw bits, discarding anything outside the domain
    #[inline]
    pub const fn from_bits(bits: u32) -> Event {
        Event(bits & Event::MASK)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every direction in `other` is also in `self`
    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Event) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Event) {
        self.0 &= !other.0;
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;

    /// Complement within the READ|WRITE domain
    fn not(self) -> Event {
        Event(!self.0 & Event::MASK)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut sep = "";
        if self.contains(Event::READ) {
            write!(f, "READ")?;
            sep = "|";
        }
        if self.contains(Event::WRITE) {
            write!(f, "{}WRITE", sep)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values_match_epoll() {
        assert_eq!(Event::READ.bits(), 0x1);
        assert_eq!(Event::WRITE.bits(), 0x4);
        assert_eq!(Event::NONE.bits(), 0x0);
    }

    #[test]
    fn test_set_algebra() {
        let mut ev = Event::NONE;
        assert!(ev.is_empty());

        ev.insert(Event::READ);
        assert!(ev.contains(Event::READ));
        assert!(!ev.contains(Event::WRITE));

        ev |= Event::WRITE;
        assert!(ev.contains(Event::READ | Event::WRITE));

        ev.remove(Event::READ);
        assert_eq!(ev, Event::WRITE);

        assert_eq!(ev & !Event::WRITE, Event::NONE);
        assert_eq!(!Event::READ, Event::WRITE);
    }

    #[test]
    fn test_from_bits_masks_foreign_bits() {
        // EPOLLERR (0x8) and EPOLLHUP (0x10) must not leak in
        assert_eq!(Event::from_bits(0x1 | 0x8 | 0x10), Event::READ);
    }

    #[test]
    fn test_display() {
        assert_eq!(Event::NONE.to_string(), "NONE");
        assert_eq!(Event::READ.to_string(), "READ");
        assert_eq!((Event::READ | Event::WRITE).to_string(), "READ|WRITE");
    }
}
