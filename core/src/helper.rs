use std::collections::HashMap;

/// Bit flags describing a helper function's effect on CPU state, used by
/// liveness analysis to decide whether globals need to be synced around a
/// call and whether a call with unused results can be eliminated outright.
///
/// Maps to QEMU's `TCG_CALL_NO_*` / `TCG_CALL_NO_SIDE_EFFECTS` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperFlags(pub u8);

impl HelperFlags {
    pub const NONE: HelperFlags = HelperFlags(0);
    /// The helper never reads CPU state globals.
    pub const NO_READ_GLOBALS: HelperFlags = HelperFlags(1 << 0);
    /// The helper never writes CPU state globals.
    pub const NO_WRITE_GLOBALS: HelperFlags = HelperFlags(1 << 1);
    /// The helper has no side effects beyond its return value: safe to
    /// elide entirely if every result is dead.
    pub const NO_SIDE_EFFECTS: HelperFlags = HelperFlags(1 << 2);

    pub const fn contains(self, other: HelperFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: HelperFlags) -> HelperFlags {
        HelperFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for HelperFlags {
    type Output = HelperFlags;
    fn bitor(self, rhs: HelperFlags) -> HelperFlags {
        self.union(rhs)
    }
}

/// Static description of one helper function, keyed by its host address.
#[derive(Debug, Clone, Copy)]
pub struct HelperInfo {
    pub name: &'static str,
    pub flags: HelperFlags,
    /// Two bits per slot: bit 0 = is_64bit, bit 1 = is_signed. Slot 0
    /// describes the return value; slot `i + 1` describes argument `i`.
    pub sizemask: u32,
}

/// Maps host helper function addresses to their calling-convention and
/// side-effect metadata.
///
/// Built once at startup from a compile-time list of helpers and never
/// mutated afterward. A call-emit site that can't find its target in the
/// registry is a build bug (a helper was not registered), not a condition
/// the translator is expected to recover from at runtime.
#[derive(Debug, Default)]
pub struct HelperRegistry {
    table: HashMap<u64, HelperInfo>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, addr: u64, name: &'static str, flags: HelperFlags, sizemask: u32) {
        self.table.insert(
            addr,
            HelperInfo {
                name,
                flags,
                sizemask,
            },
        );
    }

    pub fn lookup(&self, addr: u64) -> Option<&HelperInfo> {
        self.table.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
