//! The fetch-execute loop, with interrupt/trap delivery and cooperative
//! cancellation.
//!
//! One dedicated thread calls [`Engine::run`]; any other thread may request
//! a stop or pause, inject interrupts, or inspect and edit the machine
//! between runs through [`Engine::with_machine`]. All state lives under a
//! single mutex that the loop takes once per iteration and releases before
//! any yielding point, so an iteration's mutations are never observable
//! half-done and the undo log is consistent at every iteration boundary.

use crate::csr;
use crate::decode::Decoder;
use crate::interrupt::{Exception, SimulationError, TrapCause};
use crate::machine::{Context, EffectEvent, Environment, MachineState};
use crate::memory::MemoryFault;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, trace};

/// Why a call to [`Engine::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// The executed instruction raised a breakpoint signal, or the new PC
    /// matched a configured breakpoint address.
    BreakpointHit { address: u64 },
    /// The supplied step limit was exceeded.
    MaxStepsHit,
    /// The program requested termination.
    Exited { code: u64 },
    /// Fetch found no instruction record inside the text segment: execution
    /// ran off the end of the loaded program.
    CliffTermination { address: u64 },
    /// An external pause request was observed.
    Paused,
    /// An external stop request was observed.
    Stopped,
    /// An unrecoverable error; carries the originating cause.
    ErrorHit(SimulationError),
}

/// Tunables that do not change the simulated semantics.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Cap on executed instructions per second, for human-watched runs.
    /// `None` runs flat out.
    pub max_steps_per_second: Option<u64>,
}

struct Inner {
    machine: MachineState,
    env: Box<dyn Environment>,
}

/// Cross-thread signalling: cooperative stop/pause flags, and the condition
/// variable that wakes a loop blocked in WFI.
struct Control {
    stop: AtomicBool,
    pause: AtomicBool,
    wfi: Mutex<()>,
    wake: Condvar,
}

pub struct Engine {
    inner: Mutex<Inner>,
    control: Control,
    config: EngineConfig,
    decoder: Decoder,
}

impl Engine {
    pub fn new(machine: MachineState, env: Box<dyn Environment>, config: EngineConfig) -> Self {
        let decoder = Decoder::for_width(machine.width());
        Self {
            inner: Mutex::new(Inner { machine, env }),
            control: Control {
                stop: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                wfi: Mutex::new(()),
                wake: Condvar::new(),
            },
            config,
            decoder,
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the machine with direct access to its state; only possible while
    /// no run is in flight (the loop holds the lock during an iteration).
    pub fn with_machine<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        f(&mut self.lock_inner().machine)
    }

    /// Reverses the most recently executed instruction. `false` if there is
    /// nothing left to undo.
    pub fn back_step(&self) -> bool {
        self.lock_inner().machine.back_step()
    }

    /// Requests a cooperative stop, observed at the next iteration boundary
    /// (a loop blocked in WFI is woken).
    pub fn request_stop(&self) {
        self.control.stop.store(true, Ordering::SeqCst);
        self.control.wake.notify_all();
    }

    /// Like [`request_stop`](Self::request_stop), but reported as a pause.
    pub fn request_pause(&self) {
        self.control.pause.store(true, Ordering::SeqCst);
        self.control.wake.notify_all();
    }

    /// Raises an external interrupt carrying `value`, waking a waiting loop.
    pub fn raise_external(&self, value: u64) {
        self.lock_inner().machine.interrupts_mut().raise_external(value);
        self.control.wake.notify_all();
    }

    pub fn raise_timer(&self) {
        self.lock_inner().machine.interrupts_mut().raise_timer();
        self.control.wake.notify_all();
    }

    pub fn raise_software(&self, value: u64) {
        self.lock_inner().machine.interrupts_mut().raise_software(value);
        self.control.wake.notify_all();
    }

    /// Runs the fetch-execute loop from `start_pc` until something stops it.
    ///
    /// `max_steps` bounds the number of executed instructions; breakpoints
    /// are matched against the PC after each instruction completes.
    pub fn run(&self, start_pc: u64, max_steps: Option<u64>, breakpoints: &[u64]) -> StopEvent {
        let breakpoints: HashSet<u64> = breakpoints.iter().copied().collect();
        self.control.stop.store(false, Ordering::SeqCst);
        self.control.pause.store(false, Ordering::SeqCst);
        *self.lock_inner().machine.registers_mut().pc_mut() = start_pc;
        debug!("run from {start_pc:#x}, max_steps {max_steps:?}");

        let mut steps: u64 = 0;
        let mut waiting = false;
        loop {
            if self.control.stop.swap(false, Ordering::SeqCst) {
                return StopEvent::Stopped;
            }
            if self.control.pause.swap(false, Ordering::SeqCst) {
                return StopEvent::Paused;
            }

            let mut inner = self.lock_inner();
            let Inner { machine, env } = &mut *inner;

            // Mirror the pending interrupt lines into uip. Free-running
            // state, not undoable.
            let pending = machine.interrupts().pending_word();
            machine.csrs_mut().write_backdoor(csr::UIP, pending);

            if waiting {
                if pending == 0 {
                    drop(inner);
                    self.sleep_until_wake();
                    continue;
                }
                trace!("wfi wake, pending {pending:#x}");
                waiting = false;
            }

            // Interrupt/trap admission, at most one per iteration. Interrupt
            // delivery needs the global enable bit; a synchronous trap is
            // delivered regardless, it just loses to any enabled interrupt.
            let ustatus = machine.csrs().read_backdoor(csr::USTATUS);
            let claimed = if ustatus & csr::USTATUS_UIE != 0 {
                let enabled_mask = machine.csrs().read_backdoor(csr::UIE);
                machine.interrupts_mut().claim_highest(enabled_mask)
            } else {
                None
            };
            if let Some((interrupt, value)) = claimed {
                let epc = machine.pc();
                if let Err(error) = deliver(machine, interrupt.into(), value, epc) {
                    return StopEvent::ErrorHit(error);
                }
            } else if let Some(trap) = machine.interrupts_mut().take_trap() {
                let error = trap.error;
                if let Err(error) = deliver(machine, error.cause, error.value, trap.epc) {
                    return StopEvent::ErrorHit(error);
                }
            }

            // Step accounting.
            steps += 1;
            if let Some(limit) = max_steps {
                if steps > limit {
                    return StopEvent::MaxStepsHit;
                }
            }

            // Fetch. A faulting fetch becomes a synchronous trap and is
            // retried; fetching past the loaded program ends the run.
            let pc = machine.pc();
            let record = match machine.memory().read_instruction(pc) {
                Ok(Some(record)) => record,
                Ok(None) => return StopEvent::CliffTermination { address: pc },
                Err(fault) => {
                    let exception = match fault {
                        MemoryFault::LoadAddressMisaligned { .. } => {
                            Exception::InstructionAddressMisaligned
                        }
                        _ => Exception::InstructionAccessFault,
                    };
                    let error = SimulationError::new(exception, pc);
                    if !machine.interrupts_mut().register_trap(error.clone(), pc) {
                        return StopEvent::ErrorHit(error);
                    }
                    continue;
                }
            };

            // Decode guard. Records synthesized by raw text writes carry no
            // definition; bind one now and cache it. A word no catalog
            // entry matches is fatal.
            let (record, definition) = match record.definition() {
                Some(definition) => (record, definition),
                None => match self.decoder.decode(record.binary()) {
                    Some(definition) => {
                        let refreshed = record.with_definition(definition);
                        let _ = machine.memory_mut().write_instruction(pc, refreshed);
                        (refreshed, definition)
                    }
                    None => {
                        return StopEvent::ErrorHit(SimulationError::new(
                            Exception::IllegalInstruction,
                            record.binary() as u64,
                        ));
                    }
                },
            };

            // Execute. The PC moves past the instruction first (unlogged;
            // undo restores it from the group's PC), then the effect runs.
            machine.begin_instruction(pc);
            let pushes_before = machine.backstepper().pushes();
            *machine.registers_mut().pc_mut() = pc.wrapping_add(record.length());
            let outcome = (definition.effect)(
                &record,
                &mut Context {
                    machine,
                    env: env.as_mut(),
                },
            );
            let mut breakpoint_signal = false;
            match outcome {
                Ok(()) => {}
                Err(EffectEvent::Breakpoint) => breakpoint_signal = true,
                Err(EffectEvent::WaitForInterrupt) => waiting = true,
                Err(EffectEvent::Exit(code)) => {
                    machine.end_instruction();
                    return StopEvent::Exited { code };
                }
                Err(EffectEvent::Fatal(error)) => {
                    machine.end_instruction();
                    return StopEvent::ErrorHit(error);
                }
                Err(EffectEvent::Trap(error)) => {
                    // Offer the error to the trap slot; stopping only if it
                    // cannot take another one.
                    if !machine.interrupts_mut().register_trap(error.clone(), pc) {
                        machine.end_instruction();
                        return StopEvent::ErrorHit(error);
                    }
                }
            }

            // An instruction that logged nothing still gets an undo entry,
            // so a backward step never skips it.
            if machine.backstepper().pushes() == pushes_before {
                machine.pad_undo();
            }
            machine.end_instruction();

            // Free-running counters, bypassing the undo log.
            let cycle = machine.csrs().read_backdoor(csr::CYCLE);
            machine.csrs_mut().write_backdoor(csr::CYCLE, cycle + 1);
            let instret = machine.csrs().read_backdoor(csr::INSTRET);
            machine.csrs_mut().write_backdoor(csr::INSTRET, instret + 1);
            machine.csrs_mut().write_backdoor(csr::TIME, wall_clock_millis());

            let new_pc = machine.pc();
            if breakpoint_signal {
                return StopEvent::BreakpointHit { address: pc };
            }
            if breakpoints.contains(&new_pc) {
                return StopEvent::BreakpointHit { address: new_pc };
            }

            drop(inner);
            if let Some(rate) = self.config.max_steps_per_second {
                std::thread::sleep(Duration::from_nanos(1_000_000_000 / rate.max(1)));
            }
        }
    }

    /// Blocks until something calls [`request_stop`](Self::request_stop),
    /// an interrupt is raised, or a short timeout expires; the caller
    /// re-checks its condition either way.
    fn sleep_until_wake(&self) {
        let guard = self
            .control
            .wfi
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .control
            .wake
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Delivers one interrupt or trap: fills `ucause`/`uepc`/`utval`, saves and
/// clears the interrupt-enable bit, and jumps to the handler. Fails with the
/// original error if no handler instruction exists at the computed address;
/// an enabled-but-unhandled event is never dropped silently.
fn deliver(
    machine: &mut MachineState,
    cause: TrapCause,
    value: u64,
    epc: u64,
) -> Result<(), SimulationError> {
    let utvec = machine.csrs().read_backdoor(csr::UTVEC);
    let base = utvec & !0b11;
    let vectored = utvec & 0b11 == 1;
    let target = match cause {
        TrapCause::Interrupt(interrupt) if vectored => base + 4 * interrupt.code(),
        _ => base,
    };
    match machine.memory().read_instruction(target) {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => {
            debug!("no handler at {target:#x} for {cause}");
            return Err(SimulationError { cause, value });
        }
    }
    trace!("delivering {cause} to handler at {target:#x}");
    machine.write_csr_backdoor(csr::UCAUSE, cause.to_ucause(machine.width()));
    machine.write_csr_backdoor(csr::UEPC, epc & !1);
    machine.write_csr_backdoor(csr::UTVAL, value);
    let ustatus = machine.csrs().read_backdoor(csr::USTATUS);
    let mut updated = ustatus & !(csr::USTATUS_UIE | csr::USTATUS_UPIE);
    if ustatus & csr::USTATUS_UIE != 0 {
        updated |= csr::USTATUS_UPIE;
    }
    machine.write_csr_backdoor(csr::USTATUS, updated);
    machine.set_pc(target);
    Ok(())
}


fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
