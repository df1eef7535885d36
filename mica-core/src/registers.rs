//! General purpose and floating-point register files.

use core::fmt;
use std::fmt::Formatter;

/// The number of `x` registers available (indices start at `0` for `x0`).
pub const LEN: u8 = 32;

/// A core's general purpose registers.
///
/// There are 32 `x` registers, named `x0` up to `x31`, plus the `pc` register
/// holding the address of the current instruction. The register `x0` (aka
/// `zero`) is always zero; writes to it are ignored.
///
/// Each cell is 64 bits wide regardless of the simulated machine width; on a
/// 32-bit machine the effect functions keep the upper half sign-extended (see
/// [`MachineWidth::normalize`](crate::MachineWidth::normalize)).
///
/// It is not possible to get a mutable reference to an `x` register, since
/// that would allow unchecked writes to register `x0`.
#[derive(Debug, Clone)]
pub struct Registers {
    x_registers: [u64; LEN as usize],
    pc: u64,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Registers {
    /// Returns a fresh set of all-zero registers.
    pub fn new(initial_pc: u64) -> Self {
        Self {
            x_registers: [0; LEN as usize],
            pc: initial_pc,
        }
    }

    /// Returns the value of an `x` register. Does not have side effects.
    pub fn x(&self, specifier: Specifier) -> u64 {
        self.x_registers[usize::from(specifier)]
    }

    /// Sets the value of an `x` register.
    ///
    /// Writes to register `x0` are ignored.
    pub fn set_x(&mut self, specifier: Specifier, value: u64) {
        self.replace_x(specifier, value);
    }

    /// Replaces the value of an `x` register, returning its old value.
    ///
    /// The old value is what the undo log stores; every logged register write
    /// goes through here.
    ///
    /// Writes to register `x0` are ignored.
    pub fn replace_x(&mut self, specifier: Specifier, value: u64) -> u64 {
        if specifier.0 == 0 {
            0 // Ignore writes to register `x0`
        } else {
            std::mem::replace(&mut self.x_registers[specifier.0 as usize], value)
        }
    }

    /// Returns the value of the `pc` register.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Returns a mutable reference to the `pc` register value.
    pub fn pc_mut(&mut self) -> &mut u64 {
        &mut self.pc
    }
}

/// The floating-point register file, `f0` up to `f31`.
///
/// The cells hold raw 64-bit encodings; interpreting them (single vs. double
/// precision, NaN boxing, rounding) is the business of the per-opcode effect
/// functions in the floating-point catalog, not of this file.
#[derive(Debug, Clone)]
pub struct FpRegisters {
    f_registers: [u64; LEN as usize],
}

impl Default for FpRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl FpRegisters {
    /// Returns a fresh set of all-zero registers.
    pub fn new() -> Self {
        Self {
            f_registers: [0; LEN as usize],
        }
    }

    /// Returns the raw value of an `f` register.
    pub fn f(&self, specifier: Specifier) -> u64 {
        self.f_registers[usize::from(specifier)]
    }

    /// Replaces the raw value of an `f` register, returning its old value.
    ///
    /// Unlike `x0` there is no hardwired floating-point register.
    pub fn replace_f(&mut self, specifier: Specifier, value: u64) -> u64 {
        std::mem::replace(&mut self.f_registers[usize::from(specifier)], value)
    }
}

/// A register specifier. Can take values in the range `0..LEN`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Specifier(u8);

impl Specifier {
    /// Register `x0`, a.k.a. register `zero`, always returns `0` on read, and ignores any writes.
    pub const X0: Self = Specifier(0);

    /// Register `x2`, the stack pointer by convention.
    pub const SP: Self = Specifier(2);

    /// Register `x10`, the first argument/return register of the calling
    /// convention. Environment calls take their argument here.
    pub const A0: Self = Specifier(10);

    /// Register `x17`, carrying the environment call number.
    pub const A7: Self = Specifier(17);

    /// Create a register specifier from its index, returning `None` if `index > 31`.
    pub fn new<U: TryInto<u8>>(index: U) -> Option<Self> {
        let index = index.try_into().ok()?;
        (index < LEN).then_some(Self(index))
    }

    /// Convert a 5-bit value into a register specifier.
    /// Panics if the value doesn't fit in 5 bits (`0..=31`).
    pub fn from_u5(value_u5: u8) -> Self {
        const_assert_eq!(LEN, 32);
        if value_u5 > 31 {
            panic!("out of range u5 used");
        }
        Self(value_u5)
    }

    /// Return an iterator over all register specifiers, starting at x0 up to x31.
    pub fn iter_all() -> impl Iterator<Item = Self> {
        (0..LEN).map(Self)
    }
}

impl From<Specifier> for u8 {
    fn from(value: Specifier) -> Self {
        value.0
    }
}

impl From<Specifier> for u32 {
    fn from(value: Specifier) -> Self {
        value.0 as u32
    }
}

impl From<Specifier> for usize {
    fn from(value: Specifier) -> Self {
        value.0 as usize
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}
