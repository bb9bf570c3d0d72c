/*
Copyright 2020 Anish Jewalikar

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The translation cache: an associative store mapping guest `pc` to a
//! compiled [`BasicBlock`], directly indexed `(pc - 0x200) mod 0x700`
//! exactly as `spec.md` §3/§4.4 describe.

use std::fmt;

use crate::guest::ROM_START;

/// Number of directly-indexed cache slots.
pub const CACHE_SLOTS: usize = 0x700;

/// A host function compiled from a run of guest instructions. Takes a
/// pointer to the [`crate::jit::ExecCtx`] the block was compiled
/// against.
pub(crate) type HostFn = unsafe extern "C" fn(*mut crate::jit::ExecCtx);

/// A compiled basic block: the guest address range it consumed, and a
/// callable handle into the executable buffer that backs it.
///
/// `spec.md` §3 models validity as a separate `valid` boolean; here an
/// absent slot (`None` in [`TranslationCache`]) plays that role
/// directly, which is the idiomatic Rust rendition of the same
/// invariant.
pub struct BasicBlock {
    pub start_pc: u16,
    pub end_pc: u16,
    entry: HostFn,
    // Kept alive only to hold the mmap'd pages the JIT wrote into;
    // never read after construction. Dropping a slot drops this and
    // reclaims the pages -- an improvement on the source's permanent
    // fragmentation, noted in DESIGN.md.
    _code: dynasmrt::ExecutableBuffer,
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicBlock")
            .field("start_pc", &format_args!("{:#05x}", self.start_pc))
            .field("end_pc", &format_args!("{:#05x}", self.end_pc))
            .finish()
    }
}

impl BasicBlock {
    pub(crate) fn new(
        start_pc: u16,
        end_pc: u16,
        code: dynasmrt::ExecutableBuffer,
        offset: dynasmrt::AssemblyOffset,
    ) -> Self {
        let entry = unsafe { std::mem::transmute::<*const u8, HostFn>(code.ptr(offset)) };
        Self {
            start_pc,
            end_pc,
            entry,
            _code: code,
        }
    }

    /// Invoke the compiled block. Safety: `ctx` must point at a live
    /// `ExecCtx` whose `guest` pointer's `pc` equals `self.start_pc`.
    pub(crate) unsafe fn call(&self, ctx: *mut crate::jit::ExecCtx) {
        (self.entry)(ctx)
    }

    fn covers(&self, addr: u16) -> bool {
        self.start_pc <= addr && addr <= self.end_pc
    }
}

/// An occupied cache slot: the compiled block plus the `valid` bit
/// `spec.md` §3 models separately from the block itself.
///
/// Splitting `valid` out from the `Option` that owns the slot (rather
/// than just `*slot = None` on invalidation) matters for more than
/// bookkeeping: invalidation can be triggered by the very block that
/// is currently executing (`Fx55` writing into its own guest address
/// range). Dropping the `BasicBlock` there would free the
/// `dynasmrt::ExecutableBuffer` backing the machine code the host CPU
/// is presently running inside of -- the `ret` a few instructions
/// later would land in unmapped memory. Marking `valid = false`
/// instead leaves the pages resident until the slot is next
/// overwritten by [`TranslationCache::insert`], which only ever runs
/// from the dispatcher between block invocations, never from inside
/// emitted code.
struct Slot {
    block: BasicBlock,
    valid: bool,
}

/// `spec.md` §3's Translation Cache: 0x700 directly-indexed slots,
/// collisions overwrite, full-scan invalidation on any monitored guest
/// RAM write (§4.5).
pub struct TranslationCache {
    slots: Box<[Option<Slot>; CACHE_SLOTS]>,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| None)),
        }
    }

    fn slot_index(pc: u16) -> usize {
        (pc.wrapping_sub(ROM_START as u16) as usize) % CACHE_SLOTS
    }

    /// Find a valid, exact-match block for `pc`. A slot is a hit only
    /// if it is occupied, *valid*, and its recorded `start_pc` is
    /// `pc` -- collisions from a different block overwrite the slot
    /// rather than chain, per `spec.md` §4.4.
    pub fn lookup(&self, pc: u16) -> Option<&BasicBlock> {
        self.slots[Self::slot_index(pc)]
            .as_ref()
            .filter(|slot| slot.valid && slot.block.start_pc == pc)
            .map(|slot| &slot.block)
    }

    /// Install a freshly compiled block, overwriting (and dropping)
    /// whatever previously occupied its slot -- the one point where a
    /// stale [`BasicBlock`] is actually freed, always called from the
    /// dispatcher rather than from code the JIT itself is running.
    pub fn insert(&mut self, block: BasicBlock) {
        let index = Self::slot_index(block.start_pc);
        self.slots[index] = Some(Slot { block, valid: true });
    }

    /// `spec.md` §4.5's Self-modification Monitor: mark invalid every
    /// cached block whose `[start_pc, end_pc]` range contains `addr`.
    /// Addresses below `ram[0x200]` are never executable, so writes
    /// there are ignored. A full linear scan over the fixed-size slot
    /// array, which `spec.md` explicitly permits in place of an
    /// inverted `byte -> slot` map.
    ///
    /// Idempotent: invalidating an address with no cached block
    /// covering it, or invalidating the same address twice in a row,
    /// is a no-op the second time -- there is nothing left to mark.
    pub fn invalidate_containing(&mut self, addr: u16) {
        if (addr as usize) < ROM_START {
            return;
        }

        for slot in self.slots.iter_mut() {
            let stale = matches!(slot, Some(s) if s.valid && s.block.covers(addr));
            if stale {
                let block = &slot.as_ref().unwrap().block;
                log::debug!(
                    "invalidating block {:#05x}..={:#05x}: write to {addr:#05x}",
                    block.start_pc,
                    block.end_pc,
                );
                slot.as_mut().unwrap().valid = false;
            }
        }
    }

    /// Drop every cached block and reset to an empty cache. Used when
    /// recovering from executable-buffer exhaustion (`spec.md` §7).
    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_block(start_pc: u16, end_pc: u16) -> BasicBlock {
        let mut ops = dynasmrt::x64::Assembler::new().unwrap();
        let offset = ops.offset();
        dynasmrt::dynasm!(ops
            ; .arch x64
            ; ret
        );
        let code = ops.finalize().unwrap();
        BasicBlock::new(start_pc, end_pc, code, offset)
    }

    #[test]
    fn lookup_misses_on_empty_cache() {
        let cache = TranslationCache::new();
        assert!(cache.lookup(0x200).is_none());
    }

    #[test]
    fn insert_then_lookup_hits_exact_pc() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x206));
        assert!(cache.lookup(0x200).is_some());
        assert!(cache.lookup(0x202).is_none());
    }

    #[test]
    fn slot_collision_overwrites() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x202));
        cache.insert(dummy_block(0x200 + CACHE_SLOTS as u16, 0x202));
        assert!(cache.lookup(0x200).is_none());
        assert!(cache.lookup(0x200 + CACHE_SLOTS as u16).is_some());
    }

    #[test]
    fn invalidate_drops_covering_blocks_only() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x20A));
        cache.invalidate_containing(0x205);
        assert!(cache.lookup(0x200).is_none());
    }

    #[test]
    fn invalidate_below_rom_start_is_ignored() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x20A));
        cache.invalidate_containing(0x050);
        assert!(cache.lookup(0x200).is_some());
    }

    #[test]
    fn invalidating_twice_is_idempotent() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x20A));
        cache.invalidate_containing(0x205);
        cache.invalidate_containing(0x205);
        assert!(cache.lookup(0x200).is_none());
    }

    #[test]
    fn flush_clears_every_slot() {
        let mut cache = TranslationCache::new();
        cache.insert(dummy_block(0x200, 0x202));
        cache.insert(dummy_block(0x204, 0x206));
        cache.flush();
        assert!(cache.lookup(0x200).is_none());
        assert!(cache.lookup(0x204).is_none());
    }
}
