use std::fmt;

use serde::{Deserialize, Serialize};

/// Durable identity of one stored object instance.
///
/// OIDs are allocated once per object identity and never reused. The lowest
/// values are reserved for engine bookkeeping records; application objects
/// start at [`Oid::FIRST`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid(u64);

impl Oid {
    /// Encoded value of a null reference.
    pub const NULL: Oid = Oid(0);
    /// Record holding the engine's root pointer.
    pub const ROOTS: Oid = Oid(1);
    /// First OID handed out to application objects.
    pub const FIRST: Oid = Oid(1_000_000_000_000_000_001);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reserved OIDs are never allocated to application objects.
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::FIRST.0
    }

    /// Index of the channel whose partition owns this OID.
    pub fn channel(self, channel_count: u32) -> u32 {
        debug_assert!(channel_count > 0);
        (self.0 % u64::from(channel_count)) as u32
    }

    /// The OID directly after this one.
    pub const fn next(self) -> Option<Oid> {
        match self.0.checked_add(1) {
            Some(v) => Some(Oid(v)),
            None => None,
        }
    }

    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Oid> for u64 {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

/// Durable identity of one persisted schema version.
///
/// A TID names an exact field layout. Changing the layout of a type
/// allocates a new TID rather than editing the existing one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(u64);

impl Tid {
    /// Deletion marker records.
    pub const TOMBSTONE: Tid = Tid(0);
    /// The root-pointer record.
    pub const ROOTS: Tid = Tid(1);
    /// First TID handed out by the type dictionary.
    pub const FIRST: Tid = Tid(1_000_001);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 < Self::FIRST.0
    }

    pub const fn next(self) -> Tid {
        Tid(self.0 + 1)
    }

    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
