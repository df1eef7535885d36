//! Control and status registers.
//!
//! Only the user-level trap setup/handling registers and the unprivileged
//! counters are modeled; the machine runs everything at user level and
//! delivers traps and interrupts through `utvec`.

use thiserror::Error;

/// General 12-bit value representing a CSR specifier. Note that this can hold any 12-bit value,
/// even if the value represents an unsupported or non-existent CSR.
pub type CsrSpecifier = u16;

//
// User trap setup (`0x000`, `0x004`, `0x005`).
//
/// User status register.
pub const USTATUS: CsrSpecifier = 0x000;
/// User interrupt-enable register.
pub const UIE: CsrSpecifier = 0x004;
/// User trap handler base address.
pub const UTVEC: CsrSpecifier = 0x005;

//
// User trap handling (`0x040..=0x044`).
//
/// Scratch register for user trap handling.
pub const USCRATCH: CsrSpecifier = 0x040;
/// User exception program counter.
pub const UEPC: CsrSpecifier = 0x041;
/// User trap cause.
pub const UCAUSE: CsrSpecifier = 0x042;
/// User bad address or instruction.
pub const UTVAL: CsrSpecifier = 0x043;
/// User interrupt-pending register.
pub const UIP: CsrSpecifier = 0x044;

//
// Unprivileged counters/timers (`0xC00..=0xC02`).
//
/// Cycle counter for RDCYCLE instruction.
pub const CYCLE: CsrSpecifier = 0xC00;
/// Timer for RDTIME instruction.
pub const TIME: CsrSpecifier = 0xC01;
/// Instructions-retired counter for RDINSTRET instruction.
pub const INSTRET: CsrSpecifier = 0xC02;

/// Interrupt-enable bit (UIE) in the `ustatus` register.
pub const USTATUS_UIE: u64 = 1 << 0;
/// Previous-interrupt-enable bit (UPIE) in the `ustatus` register.
pub const USTATUS_UPIE: u64 = 1 << 4;

/// Bits of `uie`/`uip` that correspond to implemented interrupts
/// (software at 0, timer at 4, external at 8).
pub const INTERRUPT_BITS_MASK: u64 = (1 << 0) | (1 << 4) | (1 << 8);

/// The control and status register file.
///
/// Every register is a named fixed-width cell with a per-register write mask
/// and read-only policy:
///
/// - guest reads ([`read`](Self::read)) never have side effects;
/// - guest writes ([`write`](Self::write)) apply the register's write mask,
///   fail on read-only registers, and return the old value (required by the
///   undo log);
/// - [`write_backdoor`](Self::write_backdoor) bypasses both policies.
///   Trap delivery and the engine's bookkeeping counters use it; it is also
///   how the undo log restores a CSR to a value the mask would reject.
#[derive(Debug, Clone)]
pub struct CsRegisters {
    values: [u64; LAYOUT.len()],
}

struct Descriptor {
    specifier: CsrSpecifier,
    name: &'static str,
    write_mask: u64,
    read_only: bool,
}

const fn writable(specifier: CsrSpecifier, name: &'static str, write_mask: u64) -> Descriptor {
    Descriptor {
        specifier,
        name,
        write_mask,
        read_only: false,
    }
}

const fn read_only(specifier: CsrSpecifier, name: &'static str) -> Descriptor {
    Descriptor {
        specifier,
        name,
        write_mask: 0,
        read_only: true,
    }
}

/// Immutable table describing each supported CSR. Index order is the storage
/// order of [`CsRegisters::values`].
const LAYOUT: [Descriptor; 11] = [
    writable(USTATUS, "ustatus", USTATUS_UIE | USTATUS_UPIE),
    writable(UIE, "uie", INTERRUPT_BITS_MASK),
    writable(UTVEC, "utvec", u64::MAX),
    writable(USCRATCH, "uscratch", u64::MAX),
    writable(UEPC, "uepc", !0b1),
    writable(UCAUSE, "ucause", u64::MAX),
    writable(UTVAL, "utval", u64::MAX),
    writable(UIP, "uip", INTERRUPT_BITS_MASK),
    read_only(CYCLE, "cycle"),
    read_only(TIME, "time"),
    read_only(INSTRET, "instret"),
];

impl Default for CsRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl CsRegisters {
    /// Returns a fresh register file with every CSR reset to zero.
    pub fn new() -> Self {
        Self {
            values: [0; LAYOUT.len()],
        }
    }

    fn index_of(specifier: CsrSpecifier) -> Option<usize> {
        LAYOUT.iter().position(|d| d.specifier == specifier)
    }

    /// Returns the name of a supported CSR.
    pub fn name(specifier: CsrSpecifier) -> Option<&'static str> {
        Self::index_of(specifier).map(|i| LAYOUT[i].name)
    }

    /// Reads the value of a CSR. Does not have side effects.
    pub fn read(&self, specifier: CsrSpecifier) -> Result<u64, CsrAccessError> {
        let index =
            Self::index_of(specifier).ok_or(CsrAccessError::UnsupportedCsr { specifier })?;
        Ok(self.values[index])
    }

    /// Writes a CSR through its write mask, returning the old value.
    ///
    /// Fails for unsupported and read-only registers; the caller turns that
    /// into an illegal-instruction error.
    pub fn write(&mut self, specifier: CsrSpecifier, value: u64) -> Result<u64, CsrAccessError> {
        let index =
            Self::index_of(specifier).ok_or(CsrAccessError::UnsupportedCsr { specifier })?;
        let descriptor = &LAYOUT[index];
        if descriptor.read_only {
            return Err(CsrAccessError::WriteToReadOnly { specifier });
        }
        let mask = descriptor.write_mask;
        let old = self.values[index];
        self.values[index] = old & !mask | value & mask;
        Ok(old)
    }

    /// Reads a supported CSR by the constants in this module.
    ///
    /// # Panics
    ///
    /// Panics if `specifier` does not name a supported CSR.
    pub fn read_backdoor(&self, specifier: CsrSpecifier) -> u64 {
        match Self::index_of(specifier) {
            Some(index) => self.values[index],
            None => panic!("backdoor read of unsupported CSR {specifier:#05x}"),
        }
    }

    /// Writes a CSR bypassing both the write mask and the read-only policy,
    /// returning the old value.
    ///
    /// # Panics
    ///
    /// Panics if `specifier` does not name a supported CSR; callers of the
    /// backdoor address registers by the constants in this module.
    pub fn write_backdoor(&mut self, specifier: CsrSpecifier, value: u64) -> u64 {
        let index = match Self::index_of(specifier) {
            Some(index) => index,
            None => panic!("backdoor write to unsupported CSR {specifier:#05x}"),
        };
        std::mem::replace(&mut self.values[index], value)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CsrAccessError {
    #[error("unsupported CSR {specifier:#05x}")]
    UnsupportedCsr { specifier: CsrSpecifier },
    #[error("write to read-only CSR {specifier:#05x}")]
    WriteToReadOnly { specifier: CsrSpecifier },
}
