//! Word-sized address and object-reference primitives.

use std::fmt;
use std::ops::{Add, Sub};

/// Size of a heap word in bytes. Mark bits are allotted one per word.
pub const WORD_SIZE: usize = 8;

/// Size of the object header (map word + length word).
pub const OBJECT_HEADER_SIZE: usize = 2 * WORD_SIZE;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// An untyped address inside the managed address range.
///
/// # Examples
///
/// ```
/// use greymark::types::Address;
///
/// let a = Address::from_usize(0x1000_0000);
/// let b = a + 64;
/// assert_eq!(b - a, 64);
/// assert!(b.is_aligned(8));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Address = Address(0);

    pub const fn from_usize(raw: usize) -> Self {
        Address(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned(self, alignment: usize) -> bool {
        self.0 % alignment == 0
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0 + rhs)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    fn sub(self, rhs: Address) -> usize {
        debug_assert!(self.0 >= rhs.0);
        self.0 - rhs.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-null reference to a heap object.
///
/// The raw representation is the object's start address; the zero address is
/// reserved for "no object" and is unrepresentable here.
///
/// # Examples
///
/// ```
/// use greymark::types::{Address, ObjectReference};
///
/// assert!(ObjectReference::from_address(Address::ZERO).is_none());
///
/// let obj = ObjectReference::from_address(Address::from_usize(0x1000_0000)).unwrap();
/// assert_eq!(obj.to_address().as_usize(), 0x1000_0000);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectReference(Address);

impl ObjectReference {
    pub fn from_address(addr: Address) -> Option<Self> {
        if addr.is_zero() {
            None
        } else {
            Some(ObjectReference(addr))
        }
    }

    pub fn from_raw(raw: usize) -> Option<Self> {
        Self::from_address(Address::from_usize(raw))
    }

    pub const fn to_address(self) -> Address {
        self.0
    }

    pub const fn to_raw(self) -> usize {
        self.0.as_usize()
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj@{:#x}", self.0.as_usize())
    }
}
