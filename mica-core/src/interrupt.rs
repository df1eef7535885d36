//! Pending-event state: asynchronous interrupts and synchronous traps.

use crate::memory::MemoryFault;
use bitvec::{array::BitArray, field::BitField, order::Lsb0};
use std::fmt;
use thiserror::Error;

/// List of synchronous exceptions the core can raise, with their `ucause` codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte aligned boundary in memory.
    InstructionAddressMisaligned,
    InstructionAccessFault,
    /// Attempt to execute a word with no matching instruction definition, or
    /// to access an unsupported or read-only CSR.
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvironmentCall,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned => 0,
            Self::InstructionAccessFault => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned => 4,
            Self::LoadAccessFault => 5,
            Self::StoreAddressMisaligned => 6,
            Self::StoreAccessFault => 7,
            Self::EnvironmentCall => 8,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InstructionAddressMisaligned => "instruction address misaligned",
            Self::InstructionAccessFault => "instruction access fault",
            Self::IllegalInstruction => "illegal instruction",
            Self::Breakpoint => "breakpoint",
            Self::LoadAddressMisaligned => "load address misaligned",
            Self::LoadAccessFault => "load access fault",
            Self::StoreAddressMisaligned => "store address misaligned",
            Self::StoreAccessFault => "store access fault",
            Self::EnvironmentCall => "environment call",
        })
    }
}

/// List of asynchronous interrupts, with their `ucause` codes
/// (the interrupt bit excluded).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    SoftwareInterrupt,
    TimerInterrupt,
    ExternalInterrupt,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt. The code is
    /// also the interrupt's bit position in the `uip`/`uie` registers.
    pub fn code(&self) -> u64 {
        match self {
            Self::SoftwareInterrupt => 0,
            Self::TimerInterrupt => 4,
            Self::ExternalInterrupt => 8,
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SoftwareInterrupt => "software interrupt",
            Self::TimerInterrupt => "timer interrupt",
            Self::ExternalInterrupt => "external interrupt",
        })
    }
}

/// Delivery order when several interrupts are pending and enabled at once.
/// External outranks software, which explicitly outranks timer.
const PRIORITY_ORDER: [Interrupt; 3] = [
    Interrupt::ExternalInterrupt,
    Interrupt::SoftwareInterrupt,
    Interrupt::TimerInterrupt,
];

/// Sum type over the two kinds of trap causes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl TrapCause {
    /// Returns the value delivery writes to the `ucause` register, with the
    /// interrupt bit placed at the most significant bit of the given width.
    pub fn to_ucause(self, width: crate::MachineWidth) -> u64 {
        match self {
            Self::Exception(exception) => exception.code(),
            Self::Interrupt(interrupt) => width.interrupt_bit() | interrupt.code(),
        }
    }
}

impl fmt::Display for TrapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception(exception) => exception.fmt(f),
            Self::Interrupt(interrupt) => interrupt.fmt(f),
        }
    }
}

impl From<Exception> for TrapCause {
    fn from(value: Exception) -> Self {
        Self::Exception(value)
    }
}

impl From<Interrupt> for TrapCause {
    fn from(value: Interrupt) -> Self {
        Self::Interrupt(value)
    }
}

/// An error raised while simulating an instruction, carrying the trap cause
/// and the faulting value (a bad address, an offending instruction word, ...).
///
/// This is the recoverable error currency of the whole engine: the
/// fetch-execute loop offers every `SimulationError` to the trap slot first
/// and only stops the run when registration or delivery fails.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("{cause} (value {value:#x})")]
pub struct SimulationError {
    pub cause: TrapCause,
    pub value: u64,
}

impl SimulationError {
    pub fn new(cause: impl Into<TrapCause>, value: u64) -> Self {
        Self {
            cause: cause.into(),
            value,
        }
    }
}

impl From<MemoryFault> for SimulationError {
    fn from(fault: MemoryFault) -> Self {
        Self::new(fault.exception(), fault.address())
    }
}

/// A registered synchronous trap waiting for delivery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingTrap {
    pub error: SimulationError,
    /// The address of the instruction that raised the trap.
    pub epc: u64,
}

const SOFTWARE_INTERRUPT: usize = 0;
const TIMER_INTERRUPT: usize = 4;
const EXTERNAL_INTERRUPT: usize = 8;

#[allow(clippy::identity_op)]
const VALID_INTERRUPTS_MASK: u16 =
    0 | (1 << SOFTWARE_INTERRUPT) | (1 << TIMER_INTERRUPT) | (1 << EXTERNAL_INTERRUPT);

/// Tracks pending asynchronous interrupts and the (single) pending
/// synchronous trap.
///
/// Interrupts are one bit each in a `uip`-style word; an injected value rides
/// along per interrupt and ends up in `utval` on delivery. Traps occupy a
/// single slot: [`register_trap`](Self::register_trap) refuses a second trap
/// while one is pending, which is what makes a recoverable error fatal when
/// it strikes while another trap is already in flight.
#[derive(Debug, Clone, Default)]
pub struct InterruptController {
    pending: BitArray<[u16; 1], Lsb0>,
    software_value: u64,
    external_value: u64,
    trap: Option<PendingTrap>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indicate that an external interrupt is pending, carrying `value`.
    pub fn raise_external(&mut self, value: u64) {
        self.external_value = value;
        self.pending.set(EXTERNAL_INTERRUPT, true);
    }

    /// Indicate that a timer interrupt is pending.
    pub fn raise_timer(&mut self) {
        self.pending.set(TIMER_INTERRUPT, true);
    }

    /// Indicate that a software interrupt is pending, carrying `value`.
    pub fn raise_software(&mut self, value: u64) {
        self.software_value = value;
        self.pending.set(SOFTWARE_INTERRUPT, true);
    }

    /// Returns the pending interrupts as a `uip`-style word.
    pub fn pending_word(&self) -> u64 {
        self.pending.load_le::<u16>() as u64
    }

    /// Returns `true` if any interrupt in `enabled_mask` (a `uie`-style word)
    /// is pending, or a synchronous trap is.
    pub fn any_deliverable(&self, enabled_mask: u64) -> bool {
        self.pending_word() & enabled_mask & VALID_INTERRUPTS_MASK as u64 != 0
            || self.trap.is_some()
    }

    /// Claims the highest-priority pending interrupt among those enabled by
    /// `enabled_mask`, clearing its pending bit. Returns the interrupt and
    /// its injected value.
    pub fn claim_highest(&mut self, enabled_mask: u64) -> Option<(Interrupt, u64)> {
        for interrupt in PRIORITY_ORDER {
            let code = interrupt.code() as usize;
            if self.pending[code] && enabled_mask & (1 << code) != 0 {
                self.pending.set(code, false);
                let value = match interrupt {
                    Interrupt::SoftwareInterrupt => std::mem::take(&mut self.software_value),
                    Interrupt::TimerInterrupt => 0,
                    Interrupt::ExternalInterrupt => std::mem::take(&mut self.external_value),
                };
                return Some((interrupt, value));
            }
        }
        None
    }

    /// Registers a synchronous trap for delivery at the top of a later loop
    /// iteration. Returns `false` (and drops nothing) if a trap is already
    /// pending; the slot holds at most one.
    pub fn register_trap(&mut self, error: SimulationError, epc: u64) -> bool {
        if self.trap.is_some() {
            return false;
        }
        self.trap = Some(PendingTrap { error, epc });
        true
    }

    /// Takes the pending synchronous trap out of the slot, if any.
    pub fn take_trap(&mut self) -> Option<PendingTrap> {
        self.trap.take()
    }

    pub fn trap_pending(&self) -> bool {
        self.trap.is_some()
    }
}
