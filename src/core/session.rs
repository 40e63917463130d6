// Execution contexts and their flag words; the no-eviction bit is the reentrancy guard.
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct SessionFlags(u32);

impl SessionFlags {
    pub const NONE: Self = Self(0);
    /// Work done through this context must never trigger eviction.
    pub const NO_EVICTION: Self = Self(0x01);
    /// Context is owned by the engine, not handed to callers.
    pub const INTERNAL: Self = Self(0x02);
    /// Caller is inside a read that may consult historical versions.
    pub const HISTORY_READ: Self = Self(0x04);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for SessionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SessionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SessionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionFlags({:#06x})", self.0)
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A caller's (or the engine's) execution context.
///
/// Sessions are not shared between threads; whoever holds `&mut Session` owns
/// its flags for the duration of the borrow.
#[derive(Debug)]
pub struct Session {
    id: u64,
    name: String,
    flags: SessionFlags,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            flags: SessionFlags::NONE,
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        let mut session = Self::new(name);
        session.flags.insert(SessionFlags::INTERNAL);
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SessionFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: SessionFlags) {
        self.flags.insert(flags);
    }

    pub fn remove_flags(&mut self, flags: SessionFlags) {
        self.flags.remove(flags);
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(SessionFlags::INTERNAL)
    }

    /// Eviction paths check this before doing any work on this context's behalf.
    pub fn may_evict(&self) -> bool {
        !self.flags.contains(SessionFlags::NO_EVICTION)
    }
}
