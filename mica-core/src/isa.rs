//! The instruction catalogs: encodings and effect functions.
//!
//! Definitions are partitioned into the shared catalog and the
//! width-specific ones; [`Decoder::for_width`](crate::decode::Decoder)
//! combines them. Each effect is a plain function over the decoded
//! instruction and the execution context. By the time an effect runs, the PC
//! has already been advanced past the instruction, so control transfers
//! compute their targets from the instruction's own address and a plain
//! return just falls through to the next instruction.
//!
//! Register reads go through the observed-read path, register writes are
//! normalized for the machine width, and every mutation is logged for the
//! backstepper by the [`MachineState`] mutators themselves.

use crate::csr;
use crate::instruction::{DecodedInstruction, Format, InstructionDef};
use crate::machine::{Context, EffectEvent};
use crate::registers::Specifier;
use crate::MachineWidth;

/// Definitions valid on both machine widths.
pub static SHARED: &[InstructionDef] = &[
    def("lui", 0x0000_007F, 0x0000_0037, Format::U, lui),
    def("auipc", 0x0000_007F, 0x0000_0017, Format::U, auipc),
    def("jal", 0x0000_007F, 0x0000_006F, Format::J, jal),
    def("jalr", 0x0000_707F, 0x0000_0067, Format::I, jalr),
    def("beq", 0x0000_707F, 0x0000_0063, Format::B, beq),
    def("bne", 0x0000_707F, 0x0000_1063, Format::B, bne),
    def("blt", 0x0000_707F, 0x0000_4063, Format::B, blt),
    def("bge", 0x0000_707F, 0x0000_5063, Format::B, bge),
    def("bltu", 0x0000_707F, 0x0000_6063, Format::B, bltu),
    def("bgeu", 0x0000_707F, 0x0000_7063, Format::B, bgeu),
    def("lb", 0x0000_707F, 0x0000_0003, Format::I, lb),
    def("lh", 0x0000_707F, 0x0000_1003, Format::I, lh),
    def("lw", 0x0000_707F, 0x0000_2003, Format::I, lw),
    def("lbu", 0x0000_707F, 0x0000_4003, Format::I, lbu),
    def("lhu", 0x0000_707F, 0x0000_5003, Format::I, lhu),
    def("sb", 0x0000_707F, 0x0000_0023, Format::S, sb),
    def("sh", 0x0000_707F, 0x0000_1023, Format::S, sh),
    def("sw", 0x0000_707F, 0x0000_2023, Format::S, sw),
    def("addi", 0x0000_707F, 0x0000_0013, Format::I, addi),
    def("slti", 0x0000_707F, 0x0000_2013, Format::I, slti),
    def("sltiu", 0x0000_707F, 0x0000_3013, Format::I, sltiu),
    def("xori", 0x0000_707F, 0x0000_4013, Format::I, xori),
    def("ori", 0x0000_707F, 0x0000_6013, Format::I, ori),
    def("andi", 0x0000_707F, 0x0000_7013, Format::I, andi),
    def("add", 0xFE00_707F, 0x0000_0033, Format::R, add),
    def("sub", 0xFE00_707F, 0x4000_0033, Format::R, sub),
    def("sll", 0xFE00_707F, 0x0000_1033, Format::R, sll),
    def("slt", 0xFE00_707F, 0x0000_2033, Format::R, slt),
    def("sltu", 0xFE00_707F, 0x0000_3033, Format::R, sltu),
    def("xor", 0xFE00_707F, 0x0000_4033, Format::R, xor),
    def("srl", 0xFE00_707F, 0x0000_5033, Format::R, srl),
    def("sra", 0xFE00_707F, 0x4000_5033, Format::R, sra),
    def("or", 0xFE00_707F, 0x0000_6033, Format::R, or),
    def("and", 0xFE00_707F, 0x0000_7033, Format::R, and),
    def("fence", 0x0000_707F, 0x0000_000F, Format::I, fence),
    def("ecall", 0xFFFF_FFFF, 0x0000_0073, Format::System, ecall),
    def("ebreak", 0xFFFF_FFFF, 0x0010_0073, Format::System, ebreak),
    def("uret", 0xFFFF_FFFF, 0x0020_0073, Format::System, uret),
    def("wfi", 0xFFFF_FFFF, 0x1050_0073, Format::System, wfi),
    def("csrrw", 0x0000_707F, 0x0000_1073, Format::System, csrrw),
    def("csrrs", 0x0000_707F, 0x0000_2073, Format::System, csrrs),
    def("csrrc", 0x0000_707F, 0x0000_3073, Format::System, csrrc),
    def("csrrwi", 0x0000_707F, 0x0000_5073, Format::System, csrrwi),
    def("csrrsi", 0x0000_707F, 0x0000_6073, Format::System, csrrsi),
    def("csrrci", 0x0000_707F, 0x0000_7073, Format::System, csrrci),
];

/// Definitions valid only on a 32-bit machine. The immediate shifts live
/// here because RV32 fixes bit 25, leaving a 5-bit shift amount.
pub static RV32_ONLY: &[InstructionDef] = &[
    def("slli", 0xFE00_707F, 0x0000_1013, Format::I, slli),
    def("srli", 0xFE00_707F, 0x0000_5013, Format::I, srli),
    def("srai", 0xFE00_707F, 0x4000_5013, Format::I, srai),
];

/// Definitions valid only on a 64-bit machine: the wider loads and stores,
/// the word-sized arithmetic, and the 6-bit-shamt immediate shifts.
pub static RV64_ONLY: &[InstructionDef] = &[
    def("slli", 0xFC00_707F, 0x0000_1013, Format::I, slli),
    def("srli", 0xFC00_707F, 0x0000_5013, Format::I, srli),
    def("srai", 0xFC00_707F, 0x4000_5013, Format::I, srai),
    def("lwu", 0x0000_707F, 0x0000_6003, Format::I, lwu),
    def("ld", 0x0000_707F, 0x0000_3003, Format::I, ld),
    def("sd", 0x0000_707F, 0x0000_3023, Format::S, sd),
    def("addiw", 0x0000_707F, 0x0000_001B, Format::I, addiw),
    def("addw", 0xFE00_707F, 0x0000_003B, Format::R, addw),
    def("subw", 0xFE00_707F, 0x4000_003B, Format::R, subw),
];

const fn def(
    name: &'static str,
    mask: u32,
    matches: u32,
    format: Format,
    effect: fn(&DecodedInstruction, &mut Context<'_>) -> Result<(), EffectEvent>,
) -> InstructionDef {
    InstructionDef {
        name,
        mask,
        matches,
        format,
        effect,
    }
}

//
// Upper-immediate and control transfer.
//

fn lui(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    ctx.machine.set_x(inst.rd(), inst.imm_u() as u64);
    Ok(())
}

fn auipc(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let value = inst.address().wrapping_add(inst.imm_u() as u64);
    ctx.machine.set_x(inst.rd(), value);
    Ok(())
}

fn jal(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let link = inst.address().wrapping_add(inst.length());
    let target = inst.address().wrapping_add(inst.imm_j() as u64);
    machine.set_x(inst.rd(), link);
    machine.set_pc(target);
    Ok(())
}

fn jalr(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let base = machine.read_x_observed(inst.rs1());
    let target = base.wrapping_add(inst.imm_i() as u64) & !1;
    let link = inst.address().wrapping_add(inst.length());
    machine.set_x(inst.rd(), link);
    machine.set_pc(target);
    Ok(())
}

//
// Conditional branches. Register cells are kept width-normalized, so the
// 64-bit comparisons order RV32 values exactly like their 32-bit originals.
//

fn branch(
    inst: &DecodedInstruction,
    ctx: &mut Context<'_>,
    taken: impl FnOnce(u64, u64) -> bool,
) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let lhs = machine.read_x_observed(inst.rs1());
    let rhs = machine.read_x_observed(inst.rs2());
    if taken(lhs, rhs) {
        machine.set_pc(inst.address().wrapping_add(inst.imm_b() as u64));
    }
    Ok(())
}

fn beq(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| a == b)
}

fn bne(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| a != b)
}

fn blt(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| (a as i64) < b as i64)
}

fn bge(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| a as i64 >= b as i64)
}

fn bltu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| a < b)
}

fn bgeu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    branch(inst, ctx, |a, b| a >= b)
}

//
// Loads and stores. A faulting access propagates out as a recoverable trap.
//

fn effective_address(inst: &DecodedInstruction, ctx: &Context<'_>, offset: i64) -> u64 {
    let base = ctx.machine.read_x(inst.rs1());
    ctx.machine.width().address(base.wrapping_add(offset as u64))
}

fn lb(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_byte(address)? as i8;
    ctx.machine.set_x(inst.rd(), value as i64 as u64);
    Ok(())
}

fn lh(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_halfword(address)? as i16;
    ctx.machine.set_x(inst.rd(), value as i64 as u64);
    Ok(())
}

fn lw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_word(address)? as i32;
    ctx.machine.set_x(inst.rd(), value as i64 as u64);
    Ok(())
}

fn lbu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_byte(address)?;
    ctx.machine.set_x(inst.rd(), value as u64);
    Ok(())
}

fn lhu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_halfword(address)?;
    ctx.machine.set_x(inst.rd(), value as u64);
    Ok(())
}

fn lwu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_word(address)?;
    ctx.machine.set_x(inst.rd(), value as u64);
    Ok(())
}

fn ld(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_i());
    let value = ctx.machine.memory_mut().read_doubleword(address)?;
    ctx.machine.set_x(inst.rd(), value);
    Ok(())
}

fn sb(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_s());
    let value = ctx.machine.read_x_observed(inst.rs2());
    ctx.machine.store_byte(address, value as u8)?;
    Ok(())
}

fn sh(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_s());
    let value = ctx.machine.read_x_observed(inst.rs2());
    ctx.machine.store_halfword(address, value as u16)?;
    Ok(())
}

fn sw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_s());
    let value = ctx.machine.read_x_observed(inst.rs2());
    ctx.machine.store_word(address, value as u32)?;
    Ok(())
}

fn sd(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let address = effective_address(inst, ctx, inst.imm_s());
    let value = ctx.machine.read_x_observed(inst.rs2());
    ctx.machine.store_doubleword(address, value)?;
    Ok(())
}

//
// Register-immediate arithmetic.
//

fn immediate_op(
    inst: &DecodedInstruction,
    ctx: &mut Context<'_>,
    op: impl FnOnce(u64, u64) -> u64,
) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let source = machine.read_x_observed(inst.rs1());
    let value = op(source, inst.imm_i() as u64);
    machine.set_x(inst.rd(), value);
    Ok(())
}

fn addi(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| a.wrapping_add(b))
}

fn slti(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| ((a as i64) < b as i64) as u64)
}

fn sltiu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| (a < b) as u64)
}

fn xori(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| a ^ b)
}

fn ori(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| a | b)
}

fn andi(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| a & b)
}

fn addiw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    immediate_op(inst, ctx, |a, b| {
        (a as i32).wrapping_add(b as i32) as i64 as u64
    })
}

//
// Shifts. The shift amount is masked to the width, and RV32 shifts operate
// on the low word so that right shifts do not drag in the sign-extension
// bits of the normalized cell.
//

fn shift(machine_width: MachineWidth, value: u64, shamt: u32, arithmetic: bool, left: bool) -> u64 {
    let shamt = shamt & machine_width.shamt_mask();
    match (machine_width, left, arithmetic) {
        (_, true, _) => value.wrapping_shl(shamt),
        (MachineWidth::Rv32, false, false) => ((value as u32) >> shamt) as u64,
        (MachineWidth::Rv32, false, true) => ((value as u32 as i32) >> shamt) as i64 as u64,
        (MachineWidth::Rv64, false, false) => value >> shamt,
        (MachineWidth::Rv64, false, true) => ((value as i64) >> shamt) as u64,
    }
}

fn slli(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let value = shift(
        machine.width(),
        machine.read_x_observed(inst.rs1()),
        inst.shamt(),
        false,
        true,
    );
    machine.set_x(inst.rd(), value);
    Ok(())
}

fn srli(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let value = shift(
        machine.width(),
        machine.read_x_observed(inst.rs1()),
        inst.shamt(),
        false,
        false,
    );
    machine.set_x(inst.rd(), value);
    Ok(())
}

fn srai(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let value = shift(
        machine.width(),
        machine.read_x_observed(inst.rs1()),
        inst.shamt(),
        true,
        false,
    );
    machine.set_x(inst.rd(), value);
    Ok(())
}

//
// Register-register arithmetic.
//

fn register_op(
    inst: &DecodedInstruction,
    ctx: &mut Context<'_>,
    op: impl FnOnce(MachineWidth, u64, u64) -> u64,
) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let lhs = machine.read_x_observed(inst.rs1());
    let rhs = machine.read_x_observed(inst.rs2());
    let value = op(machine.width(), lhs, rhs);
    machine.set_x(inst.rd(), value);
    Ok(())
}

fn add(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| a.wrapping_add(b))
}

fn sub(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| a.wrapping_sub(b))
}

fn sll(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |w, a, b| shift(w, a, b as u32, false, true))
}

fn slt(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| ((a as i64) < b as i64) as u64)
}

fn sltu(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| (a < b) as u64)
}

fn xor(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| a ^ b)
}

fn srl(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |w, a, b| shift(w, a, b as u32, false, false))
}

fn sra(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |w, a, b| shift(w, a, b as u32, true, false))
}

fn or(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| a | b)
}

fn and(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| a & b)
}

fn addw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| {
        (a as i32).wrapping_add(b as i32) as i64 as u64
    })
}

fn subw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    register_op(inst, ctx, |_, a, b| {
        (a as i32).wrapping_sub(b as i32) as i64 as u64
    })
}

//
// System instructions.
//

fn fence(_inst: &DecodedInstruction, _ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    // A single in-order hart: memory ordering always holds.
    Ok(())
}

fn ecall(_inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    ctx.env.ecall(ctx.machine)
}

fn ebreak(_inst: &DecodedInstruction, _ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    Err(EffectEvent::Breakpoint)
}

fn wfi(_inst: &DecodedInstruction, _ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    Err(EffectEvent::WaitForInterrupt)
}

/// Return from a trap handler: restore the interrupt-enable bit from its
/// saved copy and jump back to the interrupted instruction.
fn uret(_inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let uepc = machine.read_csr_observed(csr::UEPC)?;
    let ustatus = machine.read_csr_observed(csr::USTATUS)?;
    let mut updated = ustatus & !csr::USTATUS_UIE | csr::USTATUS_UPIE;
    if ustatus & csr::USTATUS_UPIE != 0 {
        updated |= csr::USTATUS_UIE;
    }
    machine.write_csr_backdoor(csr::USTATUS, updated);
    machine.set_pc(uepc);
    Ok(())
}

fn csr_op(
    inst: &DecodedInstruction,
    ctx: &mut Context<'_>,
    source: u64,
    write: impl FnOnce(u64, u64) -> Option<u64>,
) -> Result<(), EffectEvent> {
    let machine = &mut *ctx.machine;
    let specifier = inst.csr();
    let old = machine.read_csr_observed(specifier)?;
    if let Some(updated) = write(old, source) {
        machine.write_csr(specifier, updated)?;
    }
    machine.set_x(inst.rd(), old);
    Ok(())
}

fn csrrw(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let source = ctx.machine.read_x_observed(inst.rs1());
    csr_op(inst, ctx, source, |_, source| Some(source))
}

fn csrrs(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let source = ctx.machine.read_x_observed(inst.rs1());
    // A zero source register makes this a pure read, even of read-only CSRs.
    let writes = inst.rs1() != Specifier::X0;
    csr_op(inst, ctx, source, |old, source| {
        writes.then_some(old | source)
    })
}

fn csrrc(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let source = ctx.machine.read_x_observed(inst.rs1());
    let writes = inst.rs1() != Specifier::X0;
    csr_op(inst, ctx, source, |old, source| {
        writes.then_some(old & !source)
    })
}

fn csrrwi(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    csr_op(inst, ctx, inst.zimm(), |_, source| Some(source))
}

fn csrrsi(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let source = inst.zimm();
    csr_op(inst, ctx, source, |old, source| {
        (source != 0).then_some(old | source)
    })
}

fn csrrci(inst: &DecodedInstruction, ctx: &mut Context<'_>) -> Result<(), EffectEvent> {
    let source = inst.zimm();
    csr_op(inst, ctx, source, |old, source| {
        (source != 0).then_some(old & !source)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::interrupt::{Exception, SimulationError};
    use crate::machine::{Environment, MachineState};
    use crate::memory::MemoryLayout;

    struct NoEnv;

    impl Environment for NoEnv {
        fn ecall(&mut self, _machine: &mut MachineState) -> Result<(), EffectEvent> {
            Err(EffectEvent::Trap(SimulationError::new(
                Exception::EnvironmentCall,
                0,
            )))
        }
    }

    fn machine(width: MachineWidth) -> MachineState {
        MachineState::new(width, MemoryLayout::default_map())
    }

    /// Decodes `word` at the current PC, pre-increments the PC the way the
    /// execution loop does, and runs the effect.
    fn exec(machine: &mut MachineState, word: u32) -> Result<(), EffectEvent> {
        let decoder = Decoder::for_width(machine.width());
        let pc = machine.pc();
        let definition = match decoder.decode(word) {
            Some(definition) => definition,
            None => panic!("{word:#010x} does not decode"),
        };
        let inst = DecodedInstruction::new(word, pc, definition);
        *machine.registers_mut().pc_mut() = pc + inst.length();
        machine.begin_instruction(pc);
        let result = (definition.effect)(&inst, &mut Context {
            machine,
            env: &mut NoEnv,
        });
        machine.end_instruction();
        result
    }

    fn x(n: u8) -> Specifier {
        Specifier::from_u5(n)
    }

    #[test]
    fn test_addi() {
        let mut machine = machine(MachineWidth::Rv32);
        // addi x1, x0, 5
        exec(&mut machine, 0x0050_0093).unwrap();
        assert_eq!(5, machine.read_x(x(1)));
        // addi x1, x1, -6
        exec(&mut machine, 0xFFA0_8093).unwrap();
        assert_eq!(-1i64 as u64, machine.read_x(x(1)));
    }

    #[test]
    fn test_add_sub_wrap() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(1), 0xFFFF_FFFF_FFFF_FFFF);
        machine.registers_mut().set_x(x(2), 1);
        // add x3, x1, x2
        exec(&mut machine, 0x0020_81B3).unwrap();
        assert_eq!(0, machine.read_x(x(3)));
        // sub x3, x1, x2
        exec(&mut machine, 0x4020_81B3).unwrap();
        assert_eq!(0xFFFF_FFFF_FFFF_FFFE, machine.read_x(x(3)));
    }

    #[test]
    fn test_lui_auipc() {
        let mut machine = machine(MachineWidth::Rv32);
        let pc = machine.pc();
        // lui x1, 0x12345
        exec(&mut machine, 0x1234_50B7).unwrap();
        assert_eq!(0x1234_5000, machine.read_x(x(1)));
        // auipc x1, 0x1
        exec(&mut machine, 0x0000_1097).unwrap();
        assert_eq!(pc + 4 + 0x1000, machine.read_x(x(1)));
    }

    #[test]
    fn test_branch_taken_and_untaken() {
        let mut machine = machine(MachineWidth::Rv32);
        let pc = machine.pc();
        machine.registers_mut().set_x(x(1), 7);
        machine.registers_mut().set_x(x(2), 7);
        // beq x1, x2, +8: taken, PC moves relative to the branch itself.
        exec(&mut machine, 0x0020_8463).unwrap();
        assert_eq!(pc + 8, machine.pc());

        machine.registers_mut().set_x(x(2), 8);
        let pc = machine.pc();
        // beq untaken: PC stays at the pre-incremented value.
        exec(&mut machine, 0x0020_8463).unwrap();
        assert_eq!(pc + 4, machine.pc());
    }

    #[test]
    fn test_signed_unsigned_compares() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(1), (-1i64) as u64);
        machine.registers_mut().set_x(x(2), 1);
        // slt x3, x1, x2: -1 < 1
        exec(&mut machine, 0x0020_A1B3).unwrap();
        assert_eq!(1, machine.read_x(x(3)));
        // sltu x3, x1, x2: 0xFFFF... < 1 is false
        exec(&mut machine, 0x0020_B1B3).unwrap();
        assert_eq!(0, machine.read_x(x(3)));
    }

    #[test]
    fn test_jal_jalr() {
        let mut machine = machine(MachineWidth::Rv32);
        let pc = machine.pc();
        // jal x1, +8
        exec(&mut machine, 0x0080_00EF).unwrap();
        assert_eq!(pc + 4, machine.read_x(x(1)));
        assert_eq!(pc + 8, machine.pc());

        machine.registers_mut().set_x(x(1), pc + 16);
        // jalr x0, 0(x1)
        exec(&mut machine, 0x0000_8067).unwrap();
        assert_eq!(pc + 16, machine.pc());
    }

    #[test]
    fn test_load_store_round_trip() {
        let mut machine = machine(MachineWidth::Rv32);
        let data = machine.memory().layout().data.start();
        machine.registers_mut().set_x(x(6), data);
        machine.registers_mut().set_x(x(5), 0x8000_00AA);
        // sw x5, 0(x6)
        exec(&mut machine, 0x0053_2023).unwrap();
        // lw x5, 0(x6)
        exec(&mut machine, 0x0003_2283).unwrap();
        assert_eq!(0xFFFF_FFFF_8000_00AA, machine.read_x(x(5)));
        // lbu x5, 0(x6): low byte, zero-extended
        exec(&mut machine, 0x0003_4283).unwrap();
        assert_eq!(0xAA, machine.read_x(x(5)));
        // lb x5, 0(x6): low byte, sign-extended
        exec(&mut machine, 0x0003_0283).unwrap();
        assert_eq!(0xAAu8 as i8 as i64 as u64, machine.read_x(x(5)));
    }

    #[test]
    fn test_store_fault_is_recoverable_trap() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(6), 0x13); // unmapped, misaligned
        let result = exec(&mut machine, 0x0053_2023);
        assert!(matches!(result, Err(EffectEvent::Trap(_))));
    }

    #[test]
    fn test_rv32_right_shifts_ignore_upper_half() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(2), 0xFFFF_FFFF_8000_0000);
        // srai x1, x2, 4
        exec(&mut machine, 0x4041_5093).unwrap();
        assert_eq!(0xFFFF_FFFF_F800_0000, machine.read_x(x(1)));
        // srli x1, x2, 4: logical shift of the 32-bit value
        exec(&mut machine, 0x0041_5093).unwrap();
        assert_eq!(0x0800_0000, machine.read_x(x(1)));
    }

    #[test]
    fn test_rv64_word_arithmetic() {
        let mut machine = machine(MachineWidth::Rv64);
        machine.registers_mut().set_x(x(1), 0x7FFF_FFFF);
        // addiw x2, x1, 1: overflows the low word and sign-extends
        exec(&mut machine, 0x0010_811B).unwrap();
        assert_eq!(0xFFFF_FFFF_8000_0000, machine.read_x(x(2)));
    }

    #[test]
    fn test_rv64_doubleword_load_store() {
        let mut machine = machine(MachineWidth::Rv64);
        let data = machine.memory().layout().data.start() + 8;
        machine.registers_mut().set_x(x(6), data);
        machine.registers_mut().set_x(x(5), 0x0123_4567_89AB_CDEF);
        // sd x5, 0(x6)
        exec(&mut machine, 0x0053_3023).unwrap();
        // ld x7, 0(x6)
        exec(&mut machine, 0x0003_3383).unwrap();
        assert_eq!(0x0123_4567_89AB_CDEF, machine.read_x(x(7)));
    }

    #[test]
    fn test_system_events() {
        let mut machine = machine(MachineWidth::Rv32);
        assert_eq!(Err(EffectEvent::Breakpoint), exec(&mut machine, 0x0010_0073));
        assert_eq!(
            Err(EffectEvent::WaitForInterrupt),
            exec(&mut machine, 0x1050_0073)
        );
        assert!(matches!(
            exec(&mut machine, 0x0000_0073),
            Err(EffectEvent::Trap(_))
        ));
    }

    #[test]
    fn test_csr_read_write() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(6), 0xABCD);
        // csrrw x5, uscratch, x6
        exec(&mut machine, 0x0403_12F3).unwrap();
        assert_eq!(0, machine.read_x(x(5)));
        assert_eq!(Ok(0xABCD), machine.read_csr(csr::USCRATCH));
        // csrrs x5, uscratch, x0: pure read
        exec(&mut machine, 0x0400_22F3).unwrap();
        assert_eq!(0xABCD, machine.read_x(x(5)));
        assert_eq!(Ok(0xABCD), machine.read_csr(csr::USCRATCH));
    }

    #[test]
    fn test_csr_instruction_read_is_observed() {
        use crate::machine::ObservedRegister;
        use std::sync::{Arc, Mutex};

        let mut machine = machine(MachineWidth::Rv32);
        machine.csrs_mut().write_backdoor(csr::USCRATCH, 0x77);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        machine.add_register_observer(move |register, value| {
            if let ObservedRegister::Csr(specifier) = register {
                recorded.lock().unwrap().push((specifier, value));
            }
        });
        // csrrs x5, uscratch, x0
        exec(&mut machine, 0x0400_22F3).unwrap();
        assert_eq!(vec![(csr::USCRATCH, 0x77)], *seen.lock().unwrap());
    }

    #[test]
    fn test_csr_write_to_read_only_traps() {
        let mut machine = machine(MachineWidth::Rv32);
        machine.registers_mut().set_x(x(6), 1);
        // csrrw x5, cycle, x6
        let result = exec(&mut machine, 0xC003_12F3);
        assert!(matches!(result, Err(EffectEvent::Trap(_))));
        // csrrs x5, cycle, x0 reads the counter without trapping.
        exec(&mut machine, 0xC000_22F3).unwrap();
    }

    #[test]
    fn test_uret() {
        let mut machine = machine(MachineWidth::Rv32);
        machine
            .csrs_mut()
            .write_backdoor(csr::UEPC, 0x0040_0040);
        machine
            .csrs_mut()
            .write_backdoor(csr::USTATUS, csr::USTATUS_UPIE);
        exec(&mut machine, 0x0020_0073).unwrap();
        assert_eq!(0x0040_0040, machine.pc());
        let ustatus = machine.read_csr(csr::USTATUS).unwrap();
        assert_ne!(0, ustatus & csr::USTATUS_UIE);
        assert_ne!(0, ustatus & csr::USTATUS_UPIE);
    }
}
