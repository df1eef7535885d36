//! The bounded undo log that makes execution reversible.
//!
//! Every mutating micro-action the machine performs while the log is enabled
//! pushes enough information here to reverse it: the action tag, up to two
//! parameters (address or register id, replaced value), and the program
//! counter of the instruction the action originated from. Entries live in a
//! fixed-capacity ring; once full, the oldest entry is silently overwritten.
//!
//! The log itself never touches machine state. Reversal is driven by
//! [`MachineState::back_step`](crate::machine::MachineState::back_step),
//! which pops one originating instruction's whole group of entries and
//! applies each inverse in strict reverse order of creation, with the log
//! disengaged so the restores are not themselves re-logged.

use crate::csr::CsrSpecifier;
use crate::registers::Specifier;
use log::trace;

/// Sentinel program counter meaning "this action was not tied to any fetched
/// instruction" (direct edits between runs, trap delivery, tests). Such
/// entries reverse state but do not move the PC when undone.
pub const NO_INSTRUCTION: u64 = u64::MAX;

/// Number of entries the ring holds before overwriting the oldest.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Tagged union over every reversible micro-action, carrying the value to
/// restore.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UndoAction {
    /// Put a raw instruction word back into the text segment (the cached
    /// decode is dropped; fetch re-decodes).
    RestoreRawWord { address: u64, value: u32 },
    RestoreWord { address: u64, value: u32 },
    RestoreHalf { address: u64, value: u16 },
    RestoreByte { address: u64, value: u8 },
    RestoreDoubleWord { address: u64, value: u64 },
    RestoreRegister { register: Specifier, value: u64 },
    RestoreFpRegister { register: Specifier, value: u64 },
    RestoreCsr { register: CsrSpecifier, value: u64 },
    /// Restore a CSR through the privileged backdoor, bypassing the write
    /// mask (used to undo trap-delivery writes to `ucause`/`uepc`/...).
    RestoreCsrBackdoor { register: CsrSpecifier, value: u64 },
    RestorePc { value: u64 },
    /// Placeholder for an instruction that mutated nothing, so that stepping
    /// backward never silently skips an instruction boundary.
    Nothing,
}

/// One ring entry: the action and the PC of the originating instruction
/// (or [`NO_INSTRUCTION`]).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BackstepEntry {
    pub action: UndoAction,
    pub pc: u64,
}

/// The bounded circular undo log.
#[derive(Debug, Clone)]
pub struct Backstepper {
    /// Ring storage; `entries.len()` only grows until it reaches `capacity`.
    entries: Vec<BackstepEntry>,
    /// Index of the oldest entry when the ring has wrapped.
    head: usize,
    /// Number of live entries (`<= capacity`).
    len: usize,
    capacity: usize,
    enabled: bool,
    /// Set while a back step is reversing entries, so that the restores do
    /// not log themselves.
    engaged: bool,
    /// Monotonic count of accepted pushes; lets the engine detect an
    /// instruction that logged nothing at all.
    pushes: u64,
}

impl Default for Backstepper {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Backstepper {
    /// Creates an enabled log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            head: 0,
            len: 0,
            capacity,
            enabled: true,
            engaged: false,
            pushes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables logging. Disabling does not drop existing entries.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Monotonic count of accepted pushes.
    pub fn pushes(&self) -> u64 {
        self.pushes
    }

    /// Appends an entry, overwriting the oldest once the ring is full.
    ///
    /// Ignored while the log is disabled or a reversal is in progress.
    pub fn push(&mut self, action: UndoAction, pc: u64) {
        if !self.enabled || self.engaged {
            return;
        }
        self.pushes += 1;
        let entry = BackstepEntry { action, pc };
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            self.len += 1;
        } else {
            let slot = (self.head + self.len) % self.capacity;
            self.entries[slot] = entry;
            if self.len < self.capacity {
                self.len += 1;
            } else {
                // The slot just written was the oldest entry.
                self.head = (self.head + 1) % self.capacity;
                trace!("backstep ring full; dropped oldest entry");
            }
        }
    }

    /// Returns the most recent entry without removing it.
    pub fn peek(&self) -> Option<&BackstepEntry> {
        if self.len == 0 {
            return None;
        }
        let newest = (self.head + self.len - 1) % self.entries.len().max(1);
        self.entries.get(newest)
    }

    /// Removes and returns the most recent entry.
    pub fn pop(&mut self) -> Option<BackstepEntry> {
        if self.len == 0 {
            return None;
        }
        let newest = (self.head + self.len - 1) % self.entries.len();
        self.len -= 1;
        // Entries behind `len` are dead; they get overwritten by later pushes.
        let entry = self.entries[newest];
        if self.entries.len() < self.capacity {
            // Ring hasn't wrapped yet, keep Vec length in sync with `len`.
            self.entries.truncate(self.len);
        }
        Some(entry)
    }

    /// Marks the start of a reversal; pushes are ignored until
    /// [`disengage`](Self::disengage).
    pub fn engage(&mut self) {
        self.engaged = true;
    }

    pub fn disengage(&mut self) {
        self.engaged = false;
    }
}
