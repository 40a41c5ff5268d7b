//! Guest virtual address and mapped span types

use super::error::VmiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A guest virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Creates a new guest address
    pub const fn new(value: u64) -> Self {
        GuestAddress(value)
    }

    /// Checks if the address is null
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Adds an unsigned offset, returning `None` on overflow
    pub const fn checked_add(&self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(value) => Some(GuestAddress(value)),
            None => None,
        }
    }

    /// Returns the raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for GuestAddress {
    type Err = VmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else if s.chars().any(|c| c.is_ascii_alphabetic()) {
            u64::from_str_radix(s, 16)
        } else {
            s.parse::<u64>()
        };

        value
            .map(GuestAddress::new)
            .map_err(|_| VmiError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for GuestAddress {
    fn from(value: u64) -> Self {
        GuestAddress::new(value)
    }
}

/// A module's mapped region in guest virtual memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorySpan {
    pub base: GuestAddress,
    pub size: u64,
}

impl MemorySpan {
    pub const fn new(base: GuestAddress, size: u64) -> Self {
        MemorySpan { base, size }
    }

    /// One past the last mapped byte, saturating at the top of the address space
    pub const fn end(&self) -> GuestAddress {
        GuestAddress(self.base.0.saturating_add(self.size))
    }

    /// Checks if an address falls within this span
    pub fn contains(&self, address: GuestAddress) -> bool {
        address >= self.base && address < self.end()
    }

    /// Checks if two spans share at least one byte
    pub fn overlaps(&self, other: &MemorySpan) -> bool {
        self.size != 0 && other.size != 0 && self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for MemorySpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        assert_eq!(GuestAddress::from_str("0x1000").unwrap(), GuestAddress::new(0x1000));
        assert_eq!(GuestAddress::from_str("0X1000").unwrap(), GuestAddress::new(0x1000));
        assert_eq!(
            GuestAddress::from_str("fffff80000000000").unwrap(),
            GuestAddress::new(0xfffff80000000000)
        );
        assert_eq!(GuestAddress::from_str("4096").unwrap(), GuestAddress::new(4096));
        assert!(GuestAddress::from_str("0xZZ").is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(GuestAddress::new(0xdeadbeef).to_string(), "0x00000000deadbeef");
    }

    #[test]
    fn test_span_contains() {
        let span = MemorySpan::new(GuestAddress::new(0x10000), 0x1000);
        assert!(span.contains(GuestAddress::new(0x10000)));
        assert!(span.contains(GuestAddress::new(0x10fff)));
        assert!(!span.contains(GuestAddress::new(0x11000)));
        assert!(!span.contains(GuestAddress::new(0xffff)));
        assert_eq!(span.end(), GuestAddress::new(0x11000));
    }

    #[test]
    fn test_span_overlap() {
        let a = MemorySpan::new(GuestAddress::new(0x1000), 0x1000);
        let b = MemorySpan::new(GuestAddress::new(0x1800), 0x1000);
        let c = MemorySpan::new(GuestAddress::new(0x2000), 0x1000);
        let empty = MemorySpan::new(GuestAddress::new(0x1800), 0);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&empty));
    }

    #[test]
    fn test_span_end_saturates() {
        let span = MemorySpan::new(GuestAddress::new(u64::MAX - 1), 0x10);
        assert_eq!(span.end(), GuestAddress::new(u64::MAX));
    }
}
