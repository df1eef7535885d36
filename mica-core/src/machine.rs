//! The explicit, self-contained state of one simulated machine.
//!
//! Everything an instruction effect can touch lives in [`MachineState`]:
//! general purpose and floating point registers, CSRs, the address space,
//! the interrupt controller, and the undo log. There is no ambient global
//! state; construct one per run, and as many in parallel as tests want.
//!
//! All mutators that represent architectural side effects log their inverse
//! to the backstepper under the PC of the in-flight instruction, so any run
//! can be stepped backward one instruction at a time.

use crate::backstep::{Backstepper, UndoAction, NO_INSTRUCTION};
use crate::csr::{CsRegisters, CsrAccessError, CsrSpecifier};
use crate::interrupt::{Exception, InterruptController, SimulationError};
use crate::memory::{AddressSpace, MemoryFault, MemoryLayout};
use crate::registers::{FpRegisters, Registers, Specifier};
use crate::MachineWidth;
use log::{error, trace};
use std::fmt;
use std::io;

/// Out-of-band outcome of running an instruction effect.
///
/// `Ok(())` from an effect means ordinary completion; everything else the
/// effect wants to tell the loop travels through this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectEvent {
    /// An `ebreak` was executed.
    Breakpoint,
    /// A `wfi` was executed; the loop should sleep until an interrupt is
    /// pending.
    WaitForInterrupt,
    /// The program requested termination with this exit code. Bypasses the
    /// trap machinery entirely.
    Exit(u64),
    /// Unrecoverable error; the run stops immediately.
    Fatal(SimulationError),
    /// Recoverable error; offered to the trap machinery first, fatal only if
    /// no handler can take it.
    Trap(SimulationError),
}

impl From<SimulationError> for EffectEvent {
    fn from(error: SimulationError) -> Self {
        Self::Trap(error)
    }
}

impl From<MemoryFault> for EffectEvent {
    fn from(fault: MemoryFault) -> Self {
        Self::Trap(fault.into())
    }
}

impl From<CsrAccessError> for EffectEvent {
    fn from(error: CsrAccessError) -> Self {
        let specifier = match error {
            CsrAccessError::UnsupportedCsr { specifier }
            | CsrAccessError::WriteToReadOnly { specifier } => specifier,
        };
        Self::Trap(SimulationError::new(
            Exception::IllegalInstruction,
            specifier as u64,
        ))
    }
}

/// The I/O backend instruction effects reach for `ecall`.
///
/// The call number is taken from `a7` and the argument from `a0`, following
/// the usual RISC-V convention. An implementation may mutate the machine
/// (write results to registers, allocate heap) like any effect.
pub trait Environment: Send {
    fn ecall(&mut self, machine: &mut MachineState) -> Result<(), EffectEvent>;
}

/// Everything an instruction effect gets to see.
pub struct Context<'a> {
    pub machine: &'a mut MachineState,
    pub env: &'a mut dyn Environment,
}

/// Identity of the register an observed read touched, spanning all three
/// register files.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObservedRegister {
    X(Specifier),
    F(Specifier),
    Csr(CsrSpecifier),
}

type RegisterObserver = Box<dyn FnMut(ObservedRegister, u64) + Send>;

/// The whole simulated machine, minus the execution loop.
pub struct MachineState {
    width: MachineWidth,
    registers: Registers,
    fp_registers: FpRegisters,
    csrs: CsRegisters,
    memory: AddressSpace,
    interrupts: InterruptController,
    backstepper: Backstepper,
    /// PC of the instruction whose effect is currently running; undo entries
    /// created now belong to its group. [`NO_INSTRUCTION`] between
    /// instructions.
    in_flight_pc: u64,
    register_observers: Vec<RegisterObserver>,
}

impl MachineState {
    /// Creates a fresh machine: PC at the start of the text segment, stack
    /// pointer at the stack base, everything else zero.
    pub fn new(width: MachineWidth, layout: MemoryLayout) -> Self {
        let mut registers = Registers::new(layout.text.start());
        registers.set_x(Specifier::SP, layout.stack_base);
        Self {
            width,
            registers,
            fp_registers: FpRegisters::new(),
            csrs: CsRegisters::new(),
            memory: AddressSpace::new(layout),
            interrupts: InterruptController::new(),
            backstepper: Backstepper::default(),
            in_flight_pc: NO_INSTRUCTION,
            register_observers: Vec::new(),
        }
    }

    pub fn width(&self) -> MachineWidth {
        self.width
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Raw mutable access to the registers, bypassing the undo log. For
    /// setup and direct edits the caller does not want reversible.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn fp_registers(&self) -> &FpRegisters {
        &self.fp_registers
    }

    pub fn csrs(&self) -> &CsRegisters {
        &self.csrs
    }

    /// Raw mutable access to the CSR file, bypassing the undo log. Used for
    /// the free-running counters, which are not undoable.
    pub fn csrs_mut(&mut self) -> &mut CsRegisters {
        &mut self.csrs
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Raw mutable access to memory, bypassing the undo log. Loads go
    /// through here too (a load mutates nothing but does notify listeners).
    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    pub fn backstepper(&self) -> &Backstepper {
        &self.backstepper
    }

    pub fn backstepper_mut(&mut self) -> &mut Backstepper {
        &mut self.backstepper
    }

    pub fn pc(&self) -> u64 {
        self.registers.pc()
    }

    /// Reads an `x` register without side effects.
    pub fn read_x(&self, specifier: Specifier) -> u64 {
        self.registers.x(specifier)
    }

    /// Reads an `x` register and reports the observation to registered
    /// observers (UI highlighting, tracing).
    pub fn read_x_observed(&mut self, specifier: Specifier) -> u64 {
        let value = self.registers.x(specifier);
        self.observe(ObservedRegister::X(specifier), value);
        value
    }

    /// Reads an `f` register and reports the observation to registered
    /// observers.
    pub fn read_f_observed(&mut self, specifier: Specifier) -> u64 {
        let value = self.fp_registers.f(specifier);
        self.observe(ObservedRegister::F(specifier), value);
        value
    }

    /// Reads a CSR and reports the observation to registered observers.
    /// Failed reads are not observations.
    pub fn read_csr_observed(&mut self, specifier: CsrSpecifier) -> Result<u64, CsrAccessError> {
        let value = self.csrs.read(specifier)?;
        self.observe(ObservedRegister::Csr(specifier), value);
        Ok(value)
    }

    fn observe(&mut self, register: ObservedRegister, value: u64) {
        for observer in &mut self.register_observers {
            observer(register, value);
        }
    }

    pub fn add_register_observer(
        &mut self,
        observer: impl FnMut(ObservedRegister, u64) + Send + 'static,
    ) {
        self.register_observers.push(Box::new(observer));
    }

    //
    // Logged mutators. Each normalizes for the machine width where
    // applicable, performs the write, and records the inverse under the
    // in-flight instruction's PC.
    //

    /// Writes an `x` register, normalized for the machine width.
    pub fn set_x(&mut self, specifier: Specifier, value: u64) {
        if specifier == Specifier::X0 {
            // Writes to x0 are discarded and are not a loggable mutation.
            return;
        }
        let previous = self.registers.replace_x(specifier, self.width.normalize(value));
        self.log(UndoAction::RestoreRegister {
            register: specifier,
            value: previous,
        });
    }

    pub fn set_fp(&mut self, specifier: Specifier, value: u64) {
        let previous = self.fp_registers.replace_f(specifier, value);
        self.log(UndoAction::RestoreFpRegister {
            register: specifier,
            value: previous,
        });
    }

    pub fn set_pc(&mut self, value: u64) {
        let address = self.width.address(value);
        let previous = std::mem::replace(self.registers.pc_mut(), address);
        self.log(UndoAction::RestorePc { value: previous });
    }

    pub fn read_csr(&self, specifier: CsrSpecifier) -> Result<u64, CsrAccessError> {
        self.csrs.read(specifier)
    }

    /// Writes a CSR through its write mask and read-only policy.
    pub fn write_csr(&mut self, specifier: CsrSpecifier, value: u64) -> Result<(), CsrAccessError> {
        let previous = self.csrs.write(specifier, value)?;
        self.log(UndoAction::RestoreCsr {
            register: specifier,
            value: previous,
        });
        Ok(())
    }

    /// Writes a CSR through the privileged backdoor, bypassing mask and
    /// read-only policy, but still logging the inverse. Trap delivery uses
    /// this for `ucause`/`uepc`/`utval`/`ustatus`.
    pub fn write_csr_backdoor(&mut self, specifier: CsrSpecifier, value: u64) {
        let previous = self.csrs.write_backdoor(specifier, value);
        self.log(UndoAction::RestoreCsrBackdoor {
            register: specifier,
            value: previous,
        });
    }

    pub fn store_byte(&mut self, address: u64, value: u8) -> Result<(), MemoryFault> {
        let previous = self.memory.write_byte(address, value)?;
        self.log(UndoAction::RestoreByte {
            address,
            value: previous,
        });
        Ok(())
    }

    pub fn store_halfword(&mut self, address: u64, value: u16) -> Result<(), MemoryFault> {
        let previous = self.memory.write_halfword(address, value)?;
        self.log(UndoAction::RestoreHalf {
            address,
            value: previous,
        });
        Ok(())
    }

    pub fn store_word(&mut self, address: u64, value: u32) -> Result<(), MemoryFault> {
        let previous = self.memory.write_word(address, value)?;
        // A word store into the text segment undoes as a raw-word restore,
        // keeping the cached decode dropped either way.
        let action = if self.memory.layout().text.contains(address) {
            UndoAction::RestoreRawWord {
                address,
                value: previous,
            }
        } else {
            UndoAction::RestoreWord {
                address,
                value: previous,
            }
        };
        self.log(action);
        Ok(())
    }

    pub fn store_doubleword(&mut self, address: u64, value: u64) -> Result<(), MemoryFault> {
        let previous = self.memory.write_doubleword(address, value)?;
        // One entry for both halves, so the undo is atomic.
        self.log(UndoAction::RestoreDoubleWord {
            address,
            value: previous,
        });
        Ok(())
    }

    //
    // Undo-log plumbing used by the execution loop.
    //

    fn log(&mut self, action: UndoAction) {
        self.backstepper.push(action, self.in_flight_pc);
    }

    /// Marks `pc` as the instruction all following undo entries belong to.
    pub fn begin_instruction(&mut self, pc: u64) {
        self.in_flight_pc = pc;
    }

    pub fn end_instruction(&mut self) {
        self.in_flight_pc = NO_INSTRUCTION;
    }

    /// Pushes a placeholder entry if the current instruction logged nothing,
    /// so that a backward step never skips an instruction boundary. Two
    /// placeholders are never stacked for the same PC.
    pub fn pad_undo(&mut self) {
        if let Some(entry) = self.backstepper.peek() {
            if entry.action == UndoAction::Nothing && entry.pc == self.in_flight_pc {
                return;
            }
        }
        let pc = self.in_flight_pc;
        self.backstepper.push(UndoAction::Nothing, pc);
    }

    /// Reverses the most recently executed instruction: pops every undo
    /// entry sharing the newest entry's originating PC and applies the
    /// inverses in reverse order of creation, then moves the PC back to that
    /// instruction. Entries created outside any instruction (PC sentinel)
    /// reverse state but leave the PC alone.
    ///
    /// Returns `false` if the log is empty.
    pub fn back_step(&mut self) -> bool {
        let Some(first) = self.backstepper.pop() else {
            return false;
        };
        // Disengage logging so the restores are not themselves recorded.
        self.backstepper.engage();
        let group_pc = first.pc;
        trace!("backstep group at pc {group_pc:#x}");
        self.apply_inverse(first.action);
        while let Some(entry) = self.backstepper.peek().copied() {
            if entry.pc != group_pc {
                break;
            }
            self.backstepper.pop();
            self.apply_inverse(entry.action);
        }
        if group_pc != NO_INSTRUCTION {
            *self.registers.pc_mut() = group_pc;
        }
        self.backstepper.disengage();
        true
    }

    fn apply_inverse(&mut self, action: UndoAction) {
        match action {
            UndoAction::RestoreRawWord { address, value } => {
                self.memory.restore_raw_word(address, value)
            }
            UndoAction::RestoreWord { address, value } => self.memory.restore_word(address, value),
            UndoAction::RestoreHalf { address, value } => {
                self.memory.restore_halfword(address, value)
            }
            UndoAction::RestoreByte { address, value } => self.memory.restore_byte(address, value),
            UndoAction::RestoreDoubleWord { address, value } => {
                self.memory.restore_doubleword(address, value)
            }
            UndoAction::RestoreRegister { register, value } => {
                self.registers.set_x(register, value);
            }
            UndoAction::RestoreFpRegister { register, value } => {
                self.fp_registers.replace_f(register, value);
            }
            UndoAction::RestoreCsr { register, value }
            | UndoAction::RestoreCsrBackdoor { register, value } => {
                // The recorded value was read out of the register file, so
                // putting it back through the backdoor cannot corrupt it.
                self.csrs.write_backdoor(register, value);
            }
            UndoAction::RestorePc { value } => *self.registers.pc_mut() = value,
            UndoAction::Nothing => {}
        }
    }
}

impl fmt::Debug for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineState")
            .field("width", &self.width)
            .field("pc", &format_args!("{:#x}", self.registers.pc()))
            .field("memory", &self.memory)
            .field("interrupts", &self.interrupts)
            .field("backstep_len", &self.backstepper.len())
            .field("register_observers", &self.register_observers.len())
            .finish_non_exhaustive()
    }
}

/// Console-backed [`Environment`] implementing the usual newlib-style call
/// numbers: 1 prints `a0` as a signed decimal, 11 prints `a0` as a
/// character, and 93 (or the older 10) exits with code `a0`. Anything else
/// raises an environment-call trap carrying the call number.
pub struct Console<W> {
    out: W,
}

impl<W: io::Write + Send> Console<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl Console<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: io::Write + Send> Environment for Console<W> {
    fn ecall(&mut self, machine: &mut MachineState) -> Result<(), EffectEvent> {
        let number = machine.read_x_observed(Specifier::A7);
        match number {
            // print integer
            1 => {
                let value = machine.read_x_observed(Specifier::A0) as i64;
                if let Err(cause) = write!(self.out, "{value}") {
                    error!("console write failed: {cause}");
                }
                Ok(())
            }
            // print character
            11 => {
                let value = machine.read_x_observed(Specifier::A0);
                let character = char::from_u32(value as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                if let Err(cause) = write!(self.out, "{character}") {
                    error!("console write failed: {cause}");
                }
                Ok(())
            }
            // exit
            10 | 93 => {
                let code = machine.read_x_observed(Specifier::A0);
                if let Err(cause) = self.out.flush() {
                    error!("console flush failed: {cause}");
                }
                Err(EffectEvent::Exit(code))
            }
            _ => Err(EffectEvent::Trap(SimulationError::new(
                Exception::EnvironmentCall,
                number,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    fn machine() -> MachineState {
        MachineState::new(MachineWidth::Rv32, MemoryLayout::default_map())
    }

    #[test]
    fn test_initial_state() {
        let machine = machine();
        let layout = *machine.memory().layout();
        assert_eq!(layout.text.start(), machine.pc());
        assert_eq!(layout.stack_base, machine.read_x(Specifier::SP));
    }

    #[test]
    fn test_set_x_is_reversible() {
        let mut machine = machine();
        machine.begin_instruction(0x0040_0000);
        machine.set_x(Specifier::from_u5(1), 5);
        machine.end_instruction();
        assert_eq!(5, machine.read_x(Specifier::from_u5(1)));

        assert!(machine.back_step());
        assert_eq!(0, machine.read_x(Specifier::from_u5(1)));
        assert_eq!(0x0040_0000, machine.pc());
        assert!(!machine.back_step());
    }

    #[test]
    fn test_x0_writes_log_nothing() {
        let mut machine = machine();
        machine.begin_instruction(0x0040_0000);
        machine.set_x(Specifier::X0, 99);
        assert_eq!(0, machine.read_x(Specifier::X0));
        assert!(machine.backstepper().is_empty());
    }

    #[test]
    fn test_rv32_normalizes_register_writes() {
        let mut machine = machine();
        machine.set_x(Specifier::from_u5(1), 0x8000_0000);
        assert_eq!(0xFFFF_FFFF_8000_0000, machine.read_x(Specifier::from_u5(1)));
    }

    #[test]
    fn test_multi_action_instruction_undone_atomically() {
        let mut machine = machine();
        let data = machine.memory().layout().data.start();
        machine.begin_instruction(0x0040_0004);
        machine.set_x(Specifier::from_u5(5), 17);
        machine.store_word(data, 0xAAAA_AAAA).unwrap();
        machine.store_byte(data + 1, 0xBB).unwrap();
        machine.end_instruction();
        assert_eq!(Ok(0xAAAA_BBAA), machine.memory_mut().read_word(data));

        // One visible step undoes all three mutations.
        assert!(machine.back_step());
        assert_eq!(Ok(0), machine.memory_mut().read_word(data));
        assert_eq!(0, machine.read_x(Specifier::from_u5(5)));
        assert_eq!(0x0040_0004, machine.pc());
        assert!(machine.backstepper().is_empty());
    }

    #[test]
    fn test_doubleword_store_is_single_entry() {
        let mut machine = machine();
        let data = machine.memory().layout().data.start() + 16;
        machine.begin_instruction(0x0040_0008);
        machine
            .store_doubleword(data, 0x1122_3344_5566_7788)
            .unwrap();
        machine.end_instruction();
        assert_eq!(1, machine.backstepper().len());
        assert!(machine.back_step());
        assert_eq!(Ok(0), machine.memory_mut().read_doubleword(data));
    }

    #[test]
    fn test_sentinel_entries_leave_pc_alone() {
        let mut machine = machine();
        let pc_before = machine.pc();
        let data = machine.memory().layout().data.start();
        // No begin_instruction: a direct edit between runs.
        machine.store_word(data, 7).unwrap();
        assert!(machine.back_step());
        assert_eq!(Ok(0), machine.memory_mut().read_word(data));
        assert_eq!(pc_before, machine.pc());
    }

    #[test]
    fn test_pad_undo_deduplicates() {
        let mut machine = machine();
        machine.begin_instruction(0x0040_0000);
        machine.pad_undo();
        machine.pad_undo();
        assert_eq!(1, machine.backstepper().len());
        machine.begin_instruction(0x0040_0004);
        machine.pad_undo();
        assert_eq!(2, machine.backstepper().len());
    }

    #[test]
    fn test_csr_write_is_reversible() {
        let mut machine = machine();
        machine.begin_instruction(0x0040_0000);
        machine.write_csr(csr::USCRATCH, 0x1234).unwrap();
        machine.end_instruction();
        assert_eq!(Ok(0x1234), machine.read_csr(csr::USCRATCH));
        assert!(machine.back_step());
        assert_eq!(Ok(0), machine.read_csr(csr::USCRATCH));
    }

    #[test]
    fn test_pc_write_is_reversible() {
        let mut machine = machine();
        let original = machine.pc();
        machine.begin_instruction(original);
        machine.set_pc(0x0040_0100);
        machine.end_instruction();
        assert_eq!(0x0040_0100, machine.pc());
        assert!(machine.back_step());
        assert_eq!(original, machine.pc());
    }

    #[test]
    fn test_register_observer() {
        let mut machine = machine();
        let seen = Arc::new(AtomicU64::new(0));
        let recorded = Arc::clone(&seen);
        machine.add_register_observer(move |register, value| {
            if register == ObservedRegister::X(Specifier::from_u5(7)) {
                recorded.store(value, Ordering::SeqCst);
            }
        });
        machine.registers_mut().set_x(Specifier::from_u5(7), 42);
        assert_eq!(42, machine.read_x_observed(Specifier::from_u5(7)));
        assert_eq!(42, seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observed_reads_cover_all_register_files() {
        let mut machine = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        machine.add_register_observer(move |register, value| {
            recorded.lock().unwrap().push((register, value));
        });
        machine.begin_instruction(0x0040_0000);
        machine.set_fp(Specifier::from_u5(3), 0x3FF0_0000_0000_0000);
        machine.write_csr(csr::USCRATCH, 0x55).unwrap();
        machine.end_instruction();

        assert_eq!(
            0x3FF0_0000_0000_0000,
            machine.read_f_observed(Specifier::from_u5(3))
        );
        assert_eq!(Ok(0x55), machine.read_csr_observed(csr::USCRATCH));
        // A read of an unsupported CSR fails and is not reported.
        assert!(machine.read_csr_observed(0xFFF).is_err());
        assert_eq!(
            vec![
                (
                    ObservedRegister::F(Specifier::from_u5(3)),
                    0x3FF0_0000_0000_0000
                ),
                (ObservedRegister::Csr(csr::USCRATCH), 0x55),
            ],
            *seen.lock().unwrap()
        );
    }

    #[test]
    fn test_console_print_and_exit() {
        let mut machine = machine();
        let mut console = Console::new(Vec::new());
        machine.registers_mut().set_x(Specifier::A7, 1);
        machine.registers_mut().set_x(Specifier::A0, (-42i64) as u64);
        assert_eq!(Ok(()), console.ecall(&mut machine));
        machine.registers_mut().set_x(Specifier::A7, 11);
        machine.registers_mut().set_x(Specifier::A0, '\n' as u64);
        assert_eq!(Ok(()), console.ecall(&mut machine));
        assert_eq!(b"-42\n".to_vec(), console.into_inner());

        let mut console = Console::new(Vec::new());
        machine.registers_mut().set_x(Specifier::A7, 93);
        machine.registers_mut().set_x(Specifier::A0, 3);
        assert_eq!(Err(EffectEvent::Exit(3)), console.ecall(&mut machine));
    }

    #[test]
    fn test_console_unknown_call_traps() {
        let mut machine = machine();
        let mut console = Console::new(Vec::new());
        machine.registers_mut().set_x(Specifier::A7, 77);
        assert_eq!(
            Err(EffectEvent::Trap(SimulationError::new(
                Exception::EnvironmentCall,
                77
            ))),
            console.ecall(&mut machine)
        );
    }
}
