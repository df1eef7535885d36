//! Computational core of a RISC-V development environment: a segmented sparse
//! address space, a mask/match instruction decoder, a fetch-execute loop with
//! interrupt and trap delivery, and a bounded undo log that makes execution
//! reversible instruction by instruction.
//!
//! The assembler, the full per-opcode semantics catalog, console/file
//! syscalls, and all presentation concerns are external collaborators. They
//! hand this crate finished [`instruction::DecodedInstruction`] records and an
//! [`machine::Environment`] for system calls, and drive it through
//! [`engine::Engine`].

#[macro_use]
extern crate static_assertions;

pub mod address_range;
pub mod backstep;
pub mod csr;
pub mod decode;
pub mod engine;
pub mod instruction;
pub mod interrupt;
pub mod isa;
pub mod machine;
pub mod memory;
pub mod registers;

/// Re-export of [`AddressRange`](address_range::AddressRange) for convenience.
pub use address_range::AddressRange;

pub mod unit {
    //! Collection of the units in which memory can be addressed (in bytes).

    /// A _byte_ is 8 bits.
    pub const BYTE: u64 = 1;

    /// A _halfword_ is 16 bits (2 bytes).
    pub const HALFWORD: u64 = 2;

    /// A _word_ is 32 bits (4 bytes).
    pub const WORD: u64 = 4;

    /// A _doubleword_ is 64 bits (8 bytes).
    pub const DOUBLEWORD: u64 = 8;
}

/// Address alignment for the units in which memory can be addressed.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    /// Byte alignment is equivalent to no alignment.
    pub const BYTE: Self = Self(unit::BYTE);

    /// Halfword alignment means the address is a multiple of 2 (`address & 0b1 == 0`).
    pub const HALFWORD: Self = Self(unit::HALFWORD);

    /// Word alignment means the address is a multiple of 4 (`address & 0b11 == 0`).
    pub const WORD: Self = Self(unit::WORD);

    /// Doubleword alignment means the address is a multiple of 8 (`address & 0b111 == 0`).
    pub const DOUBLEWORD: Self = Self(unit::DOUBLEWORD);

    /// Creates the natural alignment for a unit of size `size`. Returns `None` if `size` is not a
    /// power of two.
    pub fn natural_for_size(size: u64) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size))
    }

    /// Returns the alignment as a power of two.
    pub fn as_power_of_two(self) -> u64 {
        self.0
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: u64) -> bool {
        address & self.0.wrapping_sub(1) == 0
    }
}

/// Register width of the simulated machine.
///
/// The width selects the active decode catalog (shared definitions plus the
/// 32-bit-only or 64-bit-only slice), the position of the interrupt bit in the
/// `ucause` register, and how values are normalized when written to the
/// general purpose registers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MachineWidth {
    /// 32-bit machine (RV32 catalogs).
    Rv32,
    /// 64-bit machine (RV64 catalogs).
    Rv64,
}

impl MachineWidth {
    /// The width of the `x` registers in bits.
    pub fn xlen(self) -> u32 {
        match self {
            Self::Rv32 => 32,
            Self::Rv64 => 64,
        }
    }

    /// The interrupt bit of the `ucause` register: the most significant bit
    /// of the active register width.
    pub fn interrupt_bit(self) -> u64 {
        match self {
            Self::Rv32 => 1 << 31,
            Self::Rv64 => 1 << 63,
        }
    }

    /// Normalizes a computed value for storage in an `x` register.
    ///
    /// On a 32-bit machine the upper half of the 64-bit cell always holds the
    /// sign extension of the low word, so that signed and unsigned compares on
    /// the full cells order the same way the 32-bit values do.
    pub fn normalize(self, value: u64) -> u64 {
        match self {
            Self::Rv32 => value as u32 as i32 as i64 as u64,
            Self::Rv64 => value,
        }
    }

    /// Truncates a register value to a memory address of the active width.
    ///
    /// Unlike [`normalize`](Self::normalize) this zero-extends on a 32-bit
    /// machine, since addresses are unsigned.
    pub fn address(self, value: u64) -> u64 {
        match self {
            Self::Rv32 => value as u32 as u64,
            Self::Rv64 => value,
        }
    }

    /// The mask applied to shift amounts taken from a register.
    pub fn shamt_mask(self) -> u32 {
        self.xlen() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert!(Alignment::WORD.is_aligned(0));
        assert!(Alignment::WORD.is_aligned(0x0040_0004));
        assert!(!Alignment::WORD.is_aligned(0x0040_0002));
        assert!(Alignment::HALFWORD.is_aligned(0x0040_0002));
        assert!(!Alignment::HALFWORD.is_aligned(0x0040_0001));
        assert!(Alignment::BYTE.is_aligned(0x0040_0001));
        assert!(!Alignment::DOUBLEWORD.is_aligned(0x0040_0004));
        assert_eq!(Some(Alignment::WORD), Alignment::natural_for_size(4));
        assert_eq!(None, Alignment::natural_for_size(3));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            0xFFFF_FFFF_8000_0000,
            MachineWidth::Rv32.normalize(0x8000_0000)
        );
        assert_eq!(0x8000_0000, MachineWidth::Rv64.normalize(0x8000_0000));
        assert_eq!(
            0x8000_0000,
            MachineWidth::Rv32.address(0xFFFF_FFFF_8000_0000)
        );
        assert_eq!(31, MachineWidth::Rv32.shamt_mask());
        assert_eq!(63, MachineWidth::Rv64.shamt_mask());
    }
}
