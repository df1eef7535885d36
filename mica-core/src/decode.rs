//! Mask/match instruction decoding.
//!
//! Every [`InstructionDef`] fixes some bits of the 32-bit word (`mask`) to a
//! required pattern (`matches`); the rest are operand bits. Definitions
//! sharing a mask are grouped into a match-map, and the maps are tried from
//! most specific (most fixed bits) to least, so that a definition whose
//! fixed bits are a superset of another's always wins. This makes lookups a
//! handful of hash probes instead of a scan over the whole catalog.
//!
//! A decoder is built once per machine at startup and never changes.

use crate::instruction::InstructionDef;
use crate::isa;
use crate::MachineWidth;
use log::trace;
use std::collections::HashMap;
use std::fmt;

struct MatchMap {
    mask: u32,
    entries: HashMap<u32, &'static InstructionDef>,
}

pub struct Decoder {
    /// Ordered by decreasing `mask.count_ones()`, ties broken by ascending
    /// mask value, to make lookups deterministic.
    maps: Vec<MatchMap>,
}

impl Decoder {
    /// Builds a decoder over the given catalog slices.
    ///
    /// Panics if two definitions claim the same mask/match pair; that is a
    /// catalog bug, not a runtime condition.
    pub fn new(catalogs: &[&'static [InstructionDef]]) -> Self {
        let mut by_mask: HashMap<u32, HashMap<u32, &'static InstructionDef>> = HashMap::new();
        for definition in catalogs.iter().flat_map(|catalog| catalog.iter()) {
            let entries = by_mask.entry(definition.mask).or_default();
            if let Some(previous) = entries.insert(definition.matches, definition) {
                panic!(
                    "duplicate encoding {:#010x}/{:#010x}: {} and {}",
                    definition.mask, definition.matches, previous.name, definition.name
                );
            }
        }
        let mut maps: Vec<MatchMap> = by_mask
            .into_iter()
            .map(|(mask, entries)| MatchMap { mask, entries })
            .collect();
        maps.sort_unstable_by(|a, b| {
            b.mask
                .count_ones()
                .cmp(&a.mask.count_ones())
                .then(a.mask.cmp(&b.mask))
        });
        Self { maps }
    }

    /// Builds the decoder for a machine of the given width: the shared
    /// catalog plus the width-specific one.
    pub fn for_width(width: MachineWidth) -> Self {
        match width {
            MachineWidth::Rv32 => Self::new(&[isa::SHARED, isa::RV32_ONLY]),
            MachineWidth::Rv64 => Self::new(&[isa::SHARED, isa::RV64_ONLY]),
        }
    }

    /// Finds the unique definition matching `word`, or `None` if the word is
    /// not a known instruction. The caller decides what an unmatched word
    /// means; it is not an error here.
    pub fn decode(&self, word: u32) -> Option<&'static InstructionDef> {
        let definition = self
            .maps
            .iter()
            .find_map(|map| map.entries.get(&(word & map.mask)).copied());
        match definition {
            Some(definition) => trace!("decoded {word:#010x} as {}", definition.name),
            None => trace!("no definition matches {word:#010x}"),
        }
        definition
    }

    /// Number of definitions in the catalog.
    pub fn len(&self) -> usize {
        self.maps.iter().map(|map| map.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("maps", &self.maps.len())
            .field("definitions", &self.len())
            .finish()
    }
}
