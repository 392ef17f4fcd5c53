/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill-slot pool: backing stores for spilled virtuals.
//!
//! A backing store is owned by exactly one virtual at a time. Its
//! `max_spill_depth` drives the OOL depth protocol: `1` main line, `2`
//! hot path, `3` cold path, `0` released; a slot is protected from
//! release while its recorded depth is less dominant than the current
//! path. The transitions themselves live in the reverse-spill engine.

use crate::{SpillSlot, VirtReg};
use smallvec::SmallVec;

/// Size in bytes of a spilled reference address on AArch64.
pub const REFERENCE_ADDRESS_SIZE: u32 = 8;

/// A stack location backing a spilled virtual register.
#[derive(Clone, Debug)]
pub struct BackingStore {
    size: u32,
    /// Stack offset; stands in for the symbol reference the emitter
    /// would consume.
    offset: u32,
    collected_reference: bool,
    pinning_array: Option<VirtReg>,
    max_spill_depth: u8,
    released: bool,
}

impl BackingStore {
    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub fn contains_collected_reference(&self) -> bool {
        self.collected_reference
    }

    #[inline(always)]
    pub fn pinning_array(&self) -> Option<VirtReg> {
        self.pinning_array
    }

    #[inline(always)]
    pub fn max_spill_depth(&self) -> u8 {
        self.max_spill_depth
    }

    #[inline(always)]
    pub fn set_max_spill_depth(&mut self, depth: u8) {
        debug_assert!(depth <= 3);
        self.max_spill_depth = depth;
    }

    /// Whether the slot has been returned to the pool. A released
    /// slot's contents are dead; it may be handed out again.
    #[inline(always)]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// The compile-scoped pool of spill slots.
///
/// Freed slots go onto a free list keyed by size and are reused before
/// the stack area grows. The free list carries a single-threaded
/// reentrancy lock: while locked, slot release must not clear the
/// owning virtual's backing pointer (the caller is still walking it).
#[derive(Clone, Debug, Default)]
pub struct SpillPool {
    slots: Vec<BackingStore>,
    free_list: SmallVec<[SpillSlot; 4]>,
    next_offset: u32,
    locked: bool,
}

impl SpillPool {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn get(&self, slot: SpillSlot) -> &BackingStore {
        &self.slots[slot.index()]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, slot: SpillSlot) -> &mut BackingStore {
        &mut self.slots[slot.index()]
    }

    /// Allocate an ordinary slot of the given size.
    pub fn allocate_spill(&mut self, size: u32, collected_reference: bool) -> SpillSlot {
        self.allocate(size, collected_reference, None)
    }

    /// Allocate a slot for an internal pointer, remembering the pinning
    /// array it points into.
    pub fn allocate_internal_pointer_spill(&mut self, pinning_array: VirtReg) -> SpillSlot {
        self.allocate(REFERENCE_ADDRESS_SIZE, true, Some(pinning_array))
    }

    /// Return a slot to the pool.
    pub fn free_spill(&mut self, slot: SpillSlot, size: u32, offset: u32) {
        debug_assert_eq!(self.slots[slot.index()].size, size);
        debug_assert_eq!(offset, 0);
        let store = &mut self.slots[slot.index()];
        debug_assert!(!store.released, "double free of {}", slot);
        store.released = true;
        self.free_list.push(slot);
        trace!("freed spill {} ({} bytes)", slot, size);
    }

    #[inline(always)]
    pub fn is_free_spill_list_locked(&self) -> bool {
        self.locked
    }

    pub fn lock_free_spill_list(&mut self) {
        self.locked = true;
    }

    pub fn unlock_free_spill_list(&mut self) {
        self.locked = false;
    }

    /// Number of slots ever created, released ones included.
    #[inline(always)]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpillSlot, &BackingStore)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, store)| (SpillSlot::new(i), store))
    }

    fn allocate(
        &mut self,
        size: u32,
        collected_reference: bool,
        pinning_array: Option<VirtReg>,
    ) -> SpillSlot {
        if let Some(pos) = self
            .free_list
            .iter()
            .position(|&s| self.slots[s.index()].size == size)
        {
            let slot = self.free_list.remove(pos);
            let store = &mut self.slots[slot.index()];
            store.collected_reference = collected_reference;
            store.pinning_array = pinning_array;
            store.max_spill_depth = 0;
            store.released = false;
            trace!("reusing spill {} ({} bytes)", slot, size);
            return slot;
        }
        debug_assert!(size.is_power_of_two());
        // Align the stack area up to the slot size.
        let offset = (self.next_offset + size - 1) & !(size - 1);
        self.next_offset = offset + size;
        self.slots.push(BackingStore {
            size,
            offset,
            collected_reference,
            pinning_array,
            max_spill_depth: 0,
            released: false,
        });
        let slot = SpillSlot::new(self.slots.len() - 1);
        trace!("allocated spill {} ({} bytes at offset {})", slot, size, offset);
        slot
    }
}
