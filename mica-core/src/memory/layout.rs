//! Memory layout presets: where each segment lives in the address space.

use crate::address_range;
use crate::AddressRange;

/// An immutable description of the simulated memory map.
///
/// All segment ranges are word-aligned at their low end and do not overlap.
/// The heap occupies the tail of the data segment, starting at `heap_start`
/// and growing upward toward `data.end()`. The stack grows downward from
/// `stack_base`, which is the highest word-aligned address inside the stack
/// segment.
///
/// The stack is its own segment rather than a carve-out of the data segment,
/// because stack words are indexed down from `stack_base` while data words
/// are indexed up from the segment start. The presets keep the two adjacent,
/// so together they cover one contiguous region and every address a program
/// can reach is the same either way.
///
/// A layout is selected once before a run and is read-only afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    pub name: &'static str,
    /// Text segment, holding decoded instruction records rather than bytes.
    pub text: AddressRange,
    /// Data segment, including the heap above `heap_start`.
    pub data: AddressRange,
    /// First address handed out by the heap allocator.
    pub heap_start: u64,
    /// Stack segment. Offsets within it are measured down from `stack_base`.
    pub stack: AddressRange,
    /// Initial stack pointer value.
    pub stack_base: u64,
    /// Memory-mapped I/O window.
    pub mmio: AddressRange,
    /// Kernel data area.
    pub kernel: AddressRange,
}

impl MemoryLayout {
    /// The conventional layout, matching what most RISC-V toolchains assume:
    /// text at `0x0040_0000`, data at `0x1001_0000`, the stack just below
    /// `0x8000_0000`, and the MMIO window at the very top of the 32-bit space.
    pub fn default_map() -> Self {
        Self {
            name: "default",
            text: address_range![0x0040_0000, 0x0FFF_FFFF],
            data: address_range![0x1001_0000, 0x7FBF_EFFF],
            heap_start: 0x1004_0000,
            stack: address_range![0x7FBF_F000, 0x7FFF_EFFF],
            stack_base: 0x7FFF_EFFC,
            mmio: address_range![0xFFFF_0000, 0xFFFF_FFFF],
            kernel: address_range![0x8000_0000, 0xFFFE_FFFF],
        }
    }

    /// A deliberately tiny layout where every segment fits in a handful of
    /// blocks. Useful for exercising segment boundaries and heap exhaustion.
    pub fn compact() -> Self {
        Self {
            name: "compact",
            text: address_range![0x0000, 0x0FFF],
            data: address_range![0x2000, 0x2FFF],
            heap_start: 0x2400,
            stack: address_range![0x3000, 0x3FFF],
            stack_base: 0x3FFC,
            mmio: address_range![0x7F00, 0x7FFF],
            kernel: address_range![0x4000, 0x7EFF],
        }
    }

    /// Looks a preset up by its name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default_map()),
            "compact" => Some(Self::compact()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(layout: &MemoryLayout) {
        let ranges = [
            layout.text,
            layout.data,
            layout.stack,
            layout.mmio,
            layout.kernel,
        ];
        for range in &ranges {
            assert_eq!(0, range.start() & 0b11, "{range} not word-aligned");
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(*b), "{a} overlaps {b}");
            }
        }
        assert!(layout.data.contains(layout.heap_start));
        // The stack sits directly above the data segment, so the pair spans
        // one contiguous region.
        assert_eq!(layout.data.end() + 1, layout.stack.start());
        assert!(layout.stack.contains(layout.stack_base));
        assert_eq!(0, layout.stack_base & 0b11);
        // The stack base must be the highest aligned word of the segment.
        assert!(layout.stack.end() - layout.stack_base < 4);
    }

    #[test]
    fn test_default_map_invariants() {
        check_invariants(&MemoryLayout::default_map());
    }

    #[test]
    fn test_compact_invariants() {
        check_invariants(&MemoryLayout::compact());
    }

    #[test]
    fn test_by_name() {
        assert_eq!(
            Some(MemoryLayout::default_map()),
            MemoryLayout::by_name("default")
        );
        assert_eq!(Some(MemoryLayout::compact()), MemoryLayout::by_name("compact"));
        assert_eq!(None, MemoryLayout::by_name("huge"));
    }
}
