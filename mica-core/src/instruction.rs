//! Decoded instruction records and the catalog entry type they bind to.

use crate::csr::CsrSpecifier;
use crate::machine::{Context, EffectEvent};
use crate::registers::Specifier;
use std::fmt;

/// The encoded length in bytes of every instruction in the base catalogs.
pub const INSTRUCTION_LENGTH: u64 = 4;

/// Instruction-format tag: which operand-bit groups exist in the encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Format {
    /// Register-register operations (`rd`, `rs1`, `rs2`).
    R,
    /// Register-immediate operations and loads (`rd`, `rs1`, 12-bit immediate).
    I,
    /// Stores (`rs1`, `rs2`, split 12-bit immediate).
    S,
    /// Conditional branches (`rs1`, `rs2`, split 13-bit offset).
    B,
    /// Upper-immediate operations (`rd`, 20-bit immediate).
    U,
    /// Unconditional jumps (`rd`, split 21-bit offset).
    J,
    /// System instructions (fully fixed encodings and CSR accesses).
    System,
}

/// The per-opcode behavior: mutate machine state given the decoded
/// instruction and the execution context.
///
/// A plain function value, not a method on a polymorphic hierarchy; the
/// catalog is a closed flat table built once at startup.
pub type Effect = fn(&DecodedInstruction, &mut Context<'_>) -> Result<(), EffectEvent>;

/// An immutable catalog entry describing one instruction.
///
/// `mask` selects the bits of an instruction word that must equal `matches`
/// for the word to be this instruction; the remaining bits are operands. The
/// decoder groups definitions by mask (see
/// [`Decoder`](crate::decode::Decoder)); entries never mutate after startup.
#[derive(PartialEq)]
pub struct InstructionDef {
    pub name: &'static str,
    pub mask: u32,
    pub matches: u32,
    pub format: Format,
    pub effect: Effect,
}

impl InstructionDef {
    /// The example encoding of this definition: the match value with all
    /// operand bits zeroed. Decoding it must yield exactly this definition.
    pub fn example_encoding(&self) -> u32 {
        self.matches
    }
}

impl fmt::Debug for InstructionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionDef")
            .field("name", &self.name)
            .field("mask", &format_args!("{:#010x}", self.mask))
            .field("matches", &format_args!("{:#010x}", self.matches))
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// An instruction bound to an address, in its decoded form.
///
/// Immutable once constructed. Records are produced by the external assembler
/// (already bound to a definition), loaded raw (bound lazily on first fetch),
/// or synthesized when self-modifying code writes into the text segment
/// (cached decode dropped, re-decoded on fetch).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DecodedInstruction {
    binary: u32,
    address: u64,
    definition: Option<&'static InstructionDef>,
}

impl DecodedInstruction {
    /// Creates a record already bound to its matched definition.
    pub fn new(binary: u32, address: u64, definition: &'static InstructionDef) -> Self {
        Self {
            binary,
            address,
            definition: Some(definition),
        }
    }

    /// Creates an unbound record holding only the raw word. Fetch re-decodes
    /// it before execution.
    pub fn from_raw(binary: u32, address: u64) -> Self {
        Self {
            binary,
            address,
            definition: None,
        }
    }

    /// Returns a copy of this record bound to `definition`.
    pub fn with_definition(self, definition: &'static InstructionDef) -> Self {
        Self {
            definition: Some(definition),
            ..self
        }
    }

    /// The 32-bit binary encoding.
    pub fn binary(&self) -> u32 {
        self.binary
    }

    /// The address this record resides at.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The matched instruction definition, or `None` if the word has not
    /// been (or could not be) matched against the catalog.
    pub fn definition(&self) -> Option<&'static InstructionDef> {
        self.definition
    }

    /// The encoded length in bytes, by which the PC advances before the
    /// instruction body executes.
    pub fn length(&self) -> u64 {
        INSTRUCTION_LENGTH
    }

    //
    // Operand field extraction. Field positions are fixed across all formats
    // that carry the field, which is what makes decoding table-driven.
    //

    /// Destination register `rd` (bits 7..=11).
    pub fn rd(&self) -> Specifier {
        Specifier::from_u5((self.binary >> 7 & 0x1F) as u8)
    }

    /// First source register `rs1` (bits 15..=19).
    pub fn rs1(&self) -> Specifier {
        Specifier::from_u5((self.binary >> 15 & 0x1F) as u8)
    }

    /// Second source register `rs2` (bits 20..=24).
    pub fn rs2(&self) -> Specifier {
        Specifier::from_u5((self.binary >> 20 & 0x1F) as u8)
    }

    /// Sign-extended 12-bit I-type immediate (bits 20..=31).
    pub fn imm_i(&self) -> i64 {
        (self.binary as i32 >> 20) as i64
    }

    /// Sign-extended 12-bit S-type immediate (split over bits 7..=11 and
    /// 25..=31).
    pub fn imm_s(&self) -> i64 {
        let upper = (self.binary as i32 >> 25) << 5;
        let lower = (self.binary >> 7 & 0x1F) as i32;
        (upper | lower) as i64
    }

    /// Sign-extended 13-bit B-type branch offset (always even).
    pub fn imm_b(&self) -> i64 {
        let bit_12 = (self.binary as i32 >> 31) << 12;
        let bit_11 = ((self.binary >> 7 & 0x1) << 11) as i32;
        let bits_10_5 = ((self.binary >> 25 & 0x3F) << 5) as i32;
        let bits_4_1 = ((self.binary >> 8 & 0xF) << 1) as i32;
        (bit_12 | bit_11 | bits_10_5 | bits_4_1) as i64
    }

    /// U-type immediate: bits 12..=31 of the word, low 12 bits zero.
    pub fn imm_u(&self) -> i64 {
        (self.binary as i32 & !0xFFF) as i64
    }

    /// Sign-extended 21-bit J-type jump offset (always even).
    pub fn imm_j(&self) -> i64 {
        let bit_20 = (self.binary as i32 >> 31) << 20;
        let bits_19_12 = (self.binary & 0xFF000) as i32;
        let bit_11 = ((self.binary >> 20 & 0x1) << 11) as i32;
        let bits_10_1 = ((self.binary >> 21 & 0x3FF) << 1) as i32;
        (bit_20 | bits_19_12 | bit_11 | bits_10_1) as i64
    }

    /// Shift amount for immediate shifts (bits 20..=25; the catalog masks
    /// decide how many of them are operand bits).
    pub fn shamt(&self) -> u32 {
        self.binary >> 20 & 0x3F
    }

    /// CSR specifier for system instructions (bits 20..=31).
    pub fn csr(&self) -> CsrSpecifier {
        (self.binary >> 20) as CsrSpecifier
    }

    /// Zero-extended 5-bit immediate for CSR immediate forms (bits 15..=19).
    pub fn zimm(&self) -> u64 {
        (self.binary >> 15 & 0x1F) as u64
    }
}
