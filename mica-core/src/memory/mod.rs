//! Segmented, lazily-allocated simulated memory.
//!
//! The address space is split into five segments taken from a
//! [`MemoryLayout`]: text (decoded instruction records), data (with the heap
//! in its upper part), stack (growing downward), kernel, and a memory-mapped
//! I/O window. Each segment is backed by a sparse [`BlockTable`] so that a
//! 4 GiB map costs nothing until it is written to.
//!
//! All raw accesses are expressed as operations on aligned 32-bit words.
//! Byte and halfword accesses merge into the containing word by shifting the
//! value into its little-endian byte lane and masking, and every write
//! returns the previous value of the touched lanes so it can be undone.

mod blocks;
mod layout;

pub use blocks::{BlockTable, BLOCK_WORDS};
pub use layout::MemoryLayout;

use crate::instruction::DecodedInstruction;
use crate::interrupt::Exception;
use crate::{unit, Alignment};
use crate::AddressRange;
use std::fmt;
use std::mem;
use thiserror::Error;

/// Error type for memory accesses that violate alignment, range, or
/// text-segment rules. Carries the faulting address for the `utval` register.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryFault {
    #[error("misaligned load at {address:#x}")]
    LoadAddressMisaligned { address: u64 },
    #[error("misaligned store at {address:#x}")]
    StoreAddressMisaligned { address: u64 },
    #[error("load from unmapped address {address:#x}")]
    LoadAccessFault { address: u64 },
    #[error("store to unmapped address {address:#x}")]
    StoreAccessFault { address: u64 },
    #[error("raw read from text segment at {address:#x} with self-modifying code disabled")]
    TextSegmentRead { address: u64 },
    #[error("raw write to text segment at {address:#x} with self-modifying code disabled")]
    TextSegmentWrite { address: u64 },
}

impl MemoryFault {
    /// The exception this fault raises when it becomes a synchronous trap.
    pub fn exception(&self) -> Exception {
        match self {
            Self::LoadAddressMisaligned { .. } => Exception::LoadAddressMisaligned,
            Self::StoreAddressMisaligned { .. } => Exception::StoreAddressMisaligned,
            Self::LoadAccessFault { .. } | Self::TextSegmentRead { .. } => {
                Exception::LoadAccessFault
            }
            Self::StoreAccessFault { .. } | Self::TextSegmentWrite { .. } => {
                Exception::StoreAccessFault
            }
        }
    }

    /// The faulting address.
    pub fn address(&self) -> u64 {
        match self {
            Self::LoadAddressMisaligned { address }
            | Self::StoreAddressMisaligned { address }
            | Self::LoadAccessFault { address }
            | Self::StoreAccessFault { address }
            | Self::TextSegmentRead { address }
            | Self::TextSegmentWrite { address } => *address,
        }
    }
}

/// Error type for failed heap requests. Surfaced to the requesting effect
/// function as a plain error value, never as a trap.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum AllocationFault {
    #[error("invalid heap request of {requested} bytes")]
    InvalidRequest { requested: u64 },
    #[error("heap exhausted: {requested} bytes requested, {available} left")]
    OutOfMemory { requested: u64, available: u64 },
}

/// Direction of a memory access, as reported to access listeners.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Load,
    Store,
}

/// A completed memory access, as reported to access listeners.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryAccess {
    pub kind: AccessKind,
    pub address: u64,
    /// Access width in bytes.
    pub size: u64,
    /// The value read, or the value written.
    pub value: u64,
}

/// Handle returned by [`AddressSpace::subscribe`], used to unsubscribe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn FnMut(&MemoryAccess, &SilentView<'_>) + Send>;

struct Listener {
    id: ListenerId,
    range: AddressRange,
    callback: Callback,
}

/// The segment an aligned word address falls in, with the word index into
/// that segment's block table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Location {
    Text(u64),
    Data(u64),
    Stack(u64),
    Kernel(u64),
    Mmio(u64),
}

/// The simulated memory of one machine.
pub struct AddressSpace {
    layout: MemoryLayout,
    text: BlockTable<Option<DecodedInstruction>>,
    data: BlockTable<u32>,
    stack: BlockTable<u32>,
    kernel: BlockTable<u32>,
    mmio: BlockTable<u32>,
    heap_cursor: u64,
    smc_enabled: bool,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

impl AddressSpace {
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            text: BlockTable::new(),
            data: BlockTable::new(),
            stack: BlockTable::new(),
            kernel: BlockTable::new(),
            mmio: BlockTable::new(),
            heap_cursor: layout.heap_start,
            smc_enabled: false,
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Whether programs may read and write raw words in the text segment.
    pub fn smc_enabled(&self) -> bool {
        self.smc_enabled
    }

    pub fn set_smc_enabled(&mut self, enabled: bool) {
        self.smc_enabled = enabled;
    }

    /// Total number of blocks allocated across all segments.
    pub fn allocated_block_count(&self) -> usize {
        self.text.allocated_blocks()
            + self.data.allocated_blocks()
            + self.stack.allocated_blocks()
            + self.kernel.allocated_blocks()
            + self.mmio.allocated_blocks()
    }

    /// Maps an aligned word address to its segment and word index.
    fn locate_word(&self, word_address: u64) -> Option<Location> {
        let l = &self.layout;
        if l.data.contains(word_address) {
            Some(Location::Data((word_address - l.data.start()) / unit::WORD))
        } else if l.stack.contains(word_address) {
            // The stack grows downward, so its word index is measured down
            // from the base pointer, not up from the segment start.
            Some(Location::Stack((l.stack_base - word_address) / unit::WORD))
        } else if l.text.contains(word_address) {
            Some(Location::Text((word_address - l.text.start()) / unit::WORD))
        } else if l.kernel.contains(word_address) {
            Some(Location::Kernel(
                (word_address - l.kernel.start()) / unit::WORD,
            ))
        } else if l.mmio.contains(word_address) {
            Some(Location::Mmio((word_address - l.mmio.start()) / unit::WORD))
        } else {
            None
        }
    }

    fn load_word_at(&self, location: Location) -> u32 {
        match location {
            Location::Data(index) => self.data.load(index),
            Location::Stack(index) => self.stack.load(index),
            Location::Kernel(index) => self.kernel.load(index),
            Location::Mmio(index) => self.mmio.load(index),
            Location::Text(index) => self.text.load(index).map_or(0, |record| record.binary()),
        }
    }

    fn store_word_at(&mut self, location: Location, value: u32, word_address: u64) -> u32 {
        match location {
            Location::Data(index) => self.data.store(index, value),
            Location::Stack(index) => self.stack.store(index, value),
            Location::Kernel(index) => self.kernel.store(index, value),
            Location::Mmio(index) => self.mmio.store(index, value),
            Location::Text(index) => {
                // A raw store drops any cached decode for the word; it is
                // re-decoded on the next fetch.
                let record = DecodedInstruction::from_raw(value, word_address);
                self.text
                    .store(index, Some(record))
                    .map_or(0, |previous| previous.binary())
            }
        }
    }

    /// Reads `size` bytes (1, 2, or 4) from the word containing `address`.
    /// `address` must already satisfy the access's natural alignment.
    fn read_sub_word(&self, address: u64, size: u64, allow_text: bool) -> Result<u64, MemoryFault> {
        let word_address = address & !0b11;
        let location = self
            .locate_word(word_address)
            .ok_or(MemoryFault::LoadAccessFault { address })?;
        if matches!(location, Location::Text(_)) && !self.smc_enabled && !allow_text {
            return Err(MemoryFault::TextSegmentRead { address });
        }
        let word = self.load_word_at(location);
        let shift = 8 * (address & 0b11) as u32;
        Ok((word >> shift) as u64 & lane_mask(size))
    }

    /// Writes the low `size` bytes of `value` into the word containing
    /// `address`, merging with the word's other lanes. Returns the previous
    /// value of the touched lanes.
    fn write_sub_word(
        &mut self,
        address: u64,
        value: u64,
        size: u64,
        allow_text: bool,
    ) -> Result<u64, MemoryFault> {
        let word_address = address & !0b11;
        let location = self
            .locate_word(word_address)
            .ok_or(MemoryFault::StoreAccessFault { address })?;
        if matches!(location, Location::Text(_)) && !self.smc_enabled && !allow_text {
            return Err(MemoryFault::TextSegmentWrite { address });
        }
        let previous_word = self.load_word_at(location);
        let shift = 8 * (address & 0b11) as u32;
        let mask = (lane_mask(size) as u32) << shift;
        let merged = previous_word & !mask | (value as u32) << shift & mask;
        self.store_word_at(location, merged, word_address);
        Ok((previous_word >> shift) as u64 & lane_mask(size))
    }

    pub fn read_byte(&mut self, address: u64) -> Result<u8, MemoryFault> {
        let value = self.read_sub_word(address, unit::BYTE, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Load,
            address,
            size: unit::BYTE,
            value,
        });
        Ok(value as u8)
    }

    pub fn read_halfword(&mut self, address: u64) -> Result<u16, MemoryFault> {
        if !Alignment::HALFWORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        let value = self.read_sub_word(address, unit::HALFWORD, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Load,
            address,
            size: unit::HALFWORD,
            value,
        });
        Ok(value as u16)
    }

    pub fn read_word(&mut self, address: u64) -> Result<u32, MemoryFault> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        let value = self.read_sub_word(address, unit::WORD, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Load,
            address,
            size: unit::WORD,
            value,
        });
        Ok(value as u32)
    }

    pub fn read_doubleword(&mut self, address: u64) -> Result<u64, MemoryFault> {
        if !Alignment::DOUBLEWORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        let low = self.read_sub_word(address, unit::WORD, false)?;
        let high = self.read_sub_word(address + unit::WORD, unit::WORD, false)?;
        let value = low | high << 32;
        self.notify(MemoryAccess {
            kind: AccessKind::Load,
            address,
            size: unit::DOUBLEWORD,
            value,
        });
        Ok(value)
    }

    /// Writes a byte and returns the previous byte at that address.
    pub fn write_byte(&mut self, address: u64, value: u8) -> Result<u8, MemoryFault> {
        let previous = self.write_sub_word(address, value as u64, unit::BYTE, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Store,
            address,
            size: unit::BYTE,
            value: value as u64,
        });
        Ok(previous as u8)
    }

    pub fn write_halfword(&mut self, address: u64, value: u16) -> Result<u16, MemoryFault> {
        if !Alignment::HALFWORD.is_aligned(address) {
            return Err(MemoryFault::StoreAddressMisaligned { address });
        }
        let previous = self.write_sub_word(address, value as u64, unit::HALFWORD, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Store,
            address,
            size: unit::HALFWORD,
            value: value as u64,
        });
        Ok(previous as u16)
    }

    pub fn write_word(&mut self, address: u64, value: u32) -> Result<u32, MemoryFault> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(MemoryFault::StoreAddressMisaligned { address });
        }
        let previous = self.write_sub_word(address, value as u64, unit::WORD, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Store,
            address,
            size: unit::WORD,
            value: value as u64,
        });
        Ok(previous as u32)
    }

    pub fn write_doubleword(&mut self, address: u64, value: u64) -> Result<u64, MemoryFault> {
        if !Alignment::DOUBLEWORD.is_aligned(address) {
            return Err(MemoryFault::StoreAddressMisaligned { address });
        }
        // Check the high word up front, so a fault there cannot leave the
        // low word already written.
        let high_address = address + unit::WORD;
        let high_location = self.locate_word(high_address).ok_or(
            MemoryFault::StoreAccessFault {
                address: high_address,
            },
        )?;
        if matches!(high_location, Location::Text(_)) && !self.smc_enabled {
            return Err(MemoryFault::TextSegmentWrite {
                address: high_address,
            });
        }
        let low = self.write_sub_word(address, value & lane_mask(unit::WORD), unit::WORD, false)?;
        let high = self.write_sub_word(high_address, value >> 32, unit::WORD, false)?;
        self.notify(MemoryAccess {
            kind: AccessKind::Store,
            address,
            size: unit::DOUBLEWORD,
            value,
        });
        Ok(low | high << 32)
    }

    /// Reads the decoded instruction record at a word-aligned text address.
    ///
    /// `Ok(None)` means the address is inside the text segment but nothing
    /// was ever placed there; the engine treats this as running off the end
    /// of the program.
    pub fn read_instruction(
        &self,
        address: u64,
    ) -> Result<Option<DecodedInstruction>, MemoryFault> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        match self.locate_word(address) {
            Some(Location::Text(index)) => Ok(self.text.load(index)),
            Some(_) | None => Err(MemoryFault::LoadAccessFault { address }),
        }
    }

    /// Places a decoded instruction record at a word-aligned text address,
    /// returning the previous record. This is the front door for program
    /// loading and decode-cache refreshes, so it is not gated on
    /// self-modifying code being enabled.
    pub fn write_instruction(
        &mut self,
        address: u64,
        record: DecodedInstruction,
    ) -> Result<Option<DecodedInstruction>, MemoryFault> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(MemoryFault::StoreAddressMisaligned { address });
        }
        match self.locate_word(address) {
            Some(Location::Text(index)) => Ok(self.text.store(index, Some(record))),
            Some(_) | None => Err(MemoryFault::StoreAccessFault { address }),
        }
    }

    /// Claims `size` bytes of heap, rounded up to a word multiple. Returns
    /// the address of the claimed region. The heap only ever grows.
    pub fn allocate(&mut self, size: u64) -> Result<u64, AllocationFault> {
        if size == 0 {
            return Err(AllocationFault::InvalidRequest { requested: size });
        }
        let rounded = size
            .checked_add(unit::WORD - 1)
            .ok_or(AllocationFault::InvalidRequest { requested: size })?
            & !(unit::WORD - 1);
        // The cursor sits one past the end once the heap is fully drained.
        let available = if self.heap_cursor > self.layout.data.end() {
            0
        } else {
            self.layout.data.end() - self.heap_cursor + 1
        };
        if rounded > available {
            return Err(AllocationFault::OutOfMemory {
                requested: rounded,
                available,
            });
        }
        let address = self.heap_cursor;
        self.heap_cursor += rounded;
        Ok(address)
    }

    /// Registers `callback` to be invoked after every successful read or
    /// write whose touched bytes overlap `range`.
    pub fn subscribe(
        &mut self,
        range: AddressRange,
        callback: impl FnMut(&MemoryAccess, &SilentView<'_>) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push(Listener {
            id,
            range,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a listener. Returns `false` if the id was already gone.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        match self.listeners.iter().position(|listener| listener.id == id) {
            Some(index) => {
                self.listeners.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn notify(&mut self, access: MemoryAccess) {
        if self.listeners.is_empty() {
            return;
        }
        let span = match AddressRange::new(access.address, access.address + access.size - 1) {
            Ok(span) => span,
            Err(_) => return,
        };
        // Listeners are handed a read-only view, so they cannot re-enter the
        // mutating paths (or the listener registry) during notification.
        let mut listeners = mem::take(&mut self.listeners);
        let view = SilentView { space: self };
        for listener in &mut listeners {
            if listener.range.overlaps(span) {
                (listener.callback)(&access, &view);
            }
        }
        self.listeners = listeners;
    }

    //
    // Restore entry points for the undo log. These bypass listeners and the
    // self-modifying-code gate: an undo must put state back no matter how it
    // was originally produced.
    //

    pub(crate) fn restore_byte(&mut self, address: u64, value: u8) {
        let _ = self.write_sub_word(address, value as u64, unit::BYTE, true);
    }

    pub(crate) fn restore_halfword(&mut self, address: u64, value: u16) {
        let _ = self.write_sub_word(address, value as u64, unit::HALFWORD, true);
    }

    pub(crate) fn restore_word(&mut self, address: u64, value: u32) {
        let _ = self.write_sub_word(address, value as u64, unit::WORD, true);
    }

    pub(crate) fn restore_doubleword(&mut self, address: u64, value: u64) {
        let _ = self.write_sub_word(address, value & lane_mask(unit::WORD), unit::WORD, true);
        let _ = self.write_sub_word(address + unit::WORD, value >> 32, unit::WORD, true);
    }

    /// Restores a raw text-segment word, dropping any cached decode.
    pub(crate) fn restore_raw_word(&mut self, address: u64, value: u32) {
        let _ = self.write_sub_word(address, value as u64, unit::WORD, true);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("layout", &self.layout.name)
            .field("text", &self.text)
            .field("data", &self.data)
            .field("stack", &self.stack)
            .field("kernel", &self.kernel)
            .field("mmio", &self.mmio)
            .field("heap_cursor", &format_args!("{:#x}", self.heap_cursor))
            .field("smc_enabled", &self.smc_enabled)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Read-only view over an [`AddressSpace`] that never emits access
/// notifications. Handed to listeners during notification, and used by the
/// undo machinery when peeking at state.
#[derive(Debug)]
pub struct SilentView<'a> {
    space: &'a AddressSpace,
}

impl<'a> SilentView<'a> {
    pub fn new(space: &'a AddressSpace) -> Self {
        Self { space }
    }

    pub fn read_byte(&self, address: u64) -> Result<u8, MemoryFault> {
        Ok(self.space.read_sub_word(address, unit::BYTE, false)? as u8)
    }

    pub fn read_halfword(&self, address: u64) -> Result<u16, MemoryFault> {
        if !Alignment::HALFWORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        Ok(self.space.read_sub_word(address, unit::HALFWORD, false)? as u16)
    }

    pub fn read_word(&self, address: u64) -> Result<u32, MemoryFault> {
        if !Alignment::WORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        Ok(self.space.read_sub_word(address, unit::WORD, false)? as u32)
    }

    pub fn read_doubleword(&self, address: u64) -> Result<u64, MemoryFault> {
        if !Alignment::DOUBLEWORD.is_aligned(address) {
            return Err(MemoryFault::LoadAddressMisaligned { address });
        }
        let low = self.space.read_sub_word(address, unit::WORD, false)?;
        let high = self.space.read_sub_word(address + unit::WORD, unit::WORD, false)?;
        Ok(low | high << 32)
    }

    pub fn read_instruction(
        &self,
        address: u64,
    ) -> Result<Option<DecodedInstruction>, MemoryFault> {
        self.space.read_instruction(address)
    }
}

fn lane_mask(size: u64) -> u64 {
    (1 << (8 * size)) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn space() -> AddressSpace {
        AddressSpace::new(MemoryLayout::default_map())
    }

    #[test]
    fn test_word_round_trip() {
        let mut space = space();
        let address = space.layout().data.start();
        assert_eq!(Ok(0), space.write_word(address, 0xCAFE_BABE));
        assert_eq!(Ok(0xCAFE_BABE), space.read_word(address));
    }

    #[test]
    fn test_unwritten_memory_reads_zero() {
        let mut space = space();
        let address = space.layout().data.start() + 0x100;
        assert_eq!(Ok(0), space.read_word(address));
        assert_eq!(Ok(0), space.read_byte(address + 1));
        // No read allocated anything.
        assert_eq!(0, space.allocated_block_count());
    }

    #[test]
    fn test_out_of_range_access() {
        let mut space = AddressSpace::new(MemoryLayout::compact());
        assert_eq!(
            Err(MemoryFault::LoadAccessFault { address: 0x1_0000 }),
            space.read_word(0x1_0000)
        );
        assert_eq!(
            Err(MemoryFault::StoreAccessFault { address: 0x1_0000 }),
            space.write_byte(0x1_0000, 1)
        );
    }

    #[test]
    fn test_misaligned_access() {
        let mut space = space();
        let base = space.layout().data.start();
        assert_eq!(
            Err(MemoryFault::LoadAddressMisaligned { address: base + 1 }),
            space.read_halfword(base + 1)
        );
        assert_eq!(
            Err(MemoryFault::LoadAddressMisaligned { address: base + 2 }),
            space.read_word(base + 2)
        );
        assert_eq!(
            Err(MemoryFault::StoreAddressMisaligned { address: base + 4 }),
            space.write_doubleword(base + 4, 0)
        );
    }

    #[test]
    fn test_sub_word_merge() {
        let mut space = space();
        let address = space.layout().data.start();
        space.write_word(address, 0x1122_3344).unwrap();
        // One byte changes, the rest of the word is untouched, and the
        // previous byte comes back for the undo log.
        assert_eq!(Ok(0x33), space.write_byte(address + 1, 0xAA));
        assert_eq!(Ok(0x1122_AA44), space.read_word(address));
        assert_eq!(Ok(0x1122), space.write_halfword(address + 2, 0xBBCC));
        assert_eq!(Ok(0xBBCC_AA44), space.read_word(address));
        assert_eq!(Ok(0xAA), space.read_byte(address + 1));
        assert_eq!(Ok(0xBBCC), space.read_halfword(address + 2));
    }

    #[test]
    fn test_doubleword_round_trip() {
        let mut space = space();
        let address = space.layout().data.start() + 8;
        assert_eq!(Ok(0), space.write_doubleword(address, 0x0102_0304_0506_0708));
        assert_eq!(Ok(0x0102_0304_0506_0708), space.read_doubleword(address));
        assert_eq!(Ok(0x0506_0708), space.read_word(address));
        assert_eq!(Ok(0x0102_0304), space.read_word(address + 4));
        assert_eq!(
            Ok(0x0102_0304_0506_0708),
            space.write_doubleword(address, 0)
        );
    }

    #[test]
    fn test_doubleword_store_fault_mutates_nothing() {
        use crate::address_range;

        let mut layout = MemoryLayout::compact();
        // Data ends mid-doubleword, so an aligned store can straddle into
        // unmapped space.
        layout.data = address_range![0x2000, 0x2FFB];
        let mut space = AddressSpace::new(layout);
        space.write_word(0x2FF8, 0x1111_2222).unwrap();
        assert_eq!(
            Err(MemoryFault::StoreAccessFault { address: 0x2FFC }),
            space.write_doubleword(0x2FF8, 0xAAAA_BBBB_CCCC_DDDD)
        );
        // The low word survived the faulting store untouched.
        assert_eq!(Ok(0x1111_2222), space.read_word(0x2FF8));
    }

    #[test]
    fn test_stack_words_do_not_alias() {
        let mut space = space();
        let base = space.layout().stack_base;
        // Adjacent words below the stack base must land in distinct cells.
        space.write_word(base, 0x1111_1111).unwrap();
        space.write_word(base - 4, 0x2222_2222).unwrap();
        space.write_word(base - 8, 0x3333_3333).unwrap();
        assert_eq!(Ok(0x1111_1111), space.read_word(base));
        assert_eq!(Ok(0x2222_2222), space.read_word(base - 4));
        assert_eq!(Ok(0x3333_3333), space.read_word(base - 8));
        // Bytes within one stack word still share that word.
        assert_eq!(Ok(0x11), space.read_byte(base));
        assert_eq!(Ok(0x22), space.read_byte(base - 4 + 1));
    }

    #[test]
    fn test_stack_byte_lanes() {
        let mut space = space();
        let base = space.layout().stack_base;
        space.write_byte(base - 7, 0xEE).unwrap();
        // base - 7 lives in the word at base - 8, lane 1.
        assert_eq!(Ok(0x0000_EE00), space.read_word(base - 8));
        assert_eq!(Ok(0), space.read_word(base - 4));
    }

    #[test]
    fn test_block_probe() {
        let mut space = space();
        let start = space.layout().data.start();
        // 4100 bytes starting at the segment base touch exactly two blocks.
        for offset in (0..4100u64).step_by(4) {
            space.write_word(start + offset, 0xFFFF_FFFF).unwrap();
        }
        assert_eq!(2, space.allocated_block_count());
        // Reading from a third, untouched block allocates nothing.
        assert_eq!(Ok(0), space.read_word(start + 3 * 4096));
        assert_eq!(2, space.allocated_block_count());
    }

    #[test]
    fn test_text_gated_without_smc() {
        let mut space = space();
        let address = space.layout().text.start();
        assert_eq!(
            Err(MemoryFault::TextSegmentRead { address }),
            space.read_word(address)
        );
        assert_eq!(
            Err(MemoryFault::TextSegmentWrite { address }),
            space.write_word(address, 0x13)
        );
    }

    #[test]
    fn test_text_raw_access_with_smc() {
        let mut space = space();
        space.set_smc_enabled(true);
        let address = space.layout().text.start();
        assert_eq!(Ok(0), space.write_word(address, 0x0050_0093));
        assert_eq!(Ok(0x0050_0093), space.read_word(address));
        // The stored word is visible as an undecoded instruction record.
        let record = space.read_instruction(address).unwrap().unwrap();
        assert_eq!(0x0050_0093, record.binary());
        assert_eq!(address, record.address());
        assert!(record.definition().is_none());
    }

    #[test]
    fn test_instruction_round_trip() {
        let mut space = space();
        let address = space.layout().text.start() + 8;
        let record = DecodedInstruction::from_raw(0x0000_0013, address);
        assert!(space.write_instruction(address, record).unwrap().is_none());
        let read_back = space.read_instruction(address).unwrap().unwrap();
        assert_eq!(0x0000_0013, read_back.binary());
        // In-range but never written: no record, not an error.
        assert!(space.read_instruction(address + 4).unwrap().is_none());
    }

    #[test]
    fn test_instruction_access_outside_text() {
        let space = space();
        let address = space.layout().data.start();
        assert_eq!(
            Err(MemoryFault::LoadAccessFault { address }),
            space.read_instruction(address)
        );
    }

    #[test]
    fn test_allocate() {
        let mut space = space();
        let heap_start = space.layout().heap_start;
        assert_eq!(Ok(heap_start), space.allocate(10));
        // Rounded up to a word multiple.
        assert_eq!(Ok(heap_start + 12), space.allocate(4));
        assert_eq!(
            Err(AllocationFault::InvalidRequest { requested: 0 }),
            space.allocate(0)
        );
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut space = AddressSpace::new(MemoryLayout::compact());
        let layout = *space.layout();
        let available = layout.data.end() - layout.heap_start + 1;
        assert!(matches!(
            space.allocate(available + 4),
            Err(AllocationFault::OutOfMemory { .. })
        ));
        // Exact fit succeeds and drains the heap completely.
        assert_eq!(Ok(layout.heap_start), space.allocate(available));
        assert!(matches!(
            space.allocate(4),
            Err(AllocationFault::OutOfMemory { available: 0, .. })
        ));
    }

    #[test]
    fn test_listener_overlap() {
        let mut space = space();
        let base = space.layout().data.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&hits);
        let id = space.subscribe(
            AddressRange::new(base, base + 3).unwrap(),
            move |access, view| {
                recorded.fetch_add(1, Ordering::SeqCst);
                assert_eq!(AccessKind::Store, access.kind);
                // The silent view observes the already-updated word.
                assert_eq!(Ok(0xAB), view.read_byte(access.address));
            },
        );
        space.write_byte(base + 2, 0xAB).unwrap();
        // Outside the subscribed range: no notification.
        space.write_byte(base + 8, 0xCD).unwrap();
        assert_eq!(1, hits.load(Ordering::SeqCst));

        assert!(space.unsubscribe(id));
        space.write_byte(base + 2, 0xEF).unwrap();
        assert_eq!(1, hits.load(Ordering::SeqCst));
        assert!(!space.unsubscribe(id));
    }

    #[test]
    fn test_listener_sees_loads() {
        let mut space = space();
        let base = space.layout().data.start();
        space.write_word(base, 0x1234_5678).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&seen);
        space.subscribe(
            AddressRange::new(base, base + 3).unwrap(),
            move |access, _| {
                if access.kind == AccessKind::Load {
                    recorded.store(access.value as usize, Ordering::SeqCst);
                }
            },
        );
        space.read_word(base).unwrap();
        assert_eq!(0x1234_5678, seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restore_bypasses_gate_and_listeners() {
        let mut space = space();
        let text = space.layout().text.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&hits);
        space.subscribe(AddressRange::new(0, u64::MAX).unwrap(), move |_, _| {
            recorded.fetch_add(1, Ordering::SeqCst);
        });
        space.restore_raw_word(text, 0x0000_0013);
        let data = space.layout().data.start();
        space.restore_word(data, 7);
        assert_eq!(0, hits.load(Ordering::SeqCst));
        let view = SilentView::new(&space);
        assert_eq!(Ok(7), view.read_word(data));
    }
}
