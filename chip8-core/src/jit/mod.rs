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

//! The dynamic binary translator: basic-block discovery, host-code
//! emission, the translation cache, and the outer dispatch loop --
//! `spec.md` §2 items 3 through 7, folded together behind one `Jit`
//! handle.
//!
//! A block is compiled the first time its `pc` is reached and
//! re-invoked straight out of the cache on every later hit. A write to
//! guest RAM that overlaps a cached block's byte range drops that
//! block immediately (`spec.md` §4.5), so a stale translation can
//! never run again.
//!
//! Code generation only exists for `x86_64` host targets, where
//! `dynasmrt` can emit into an executable mapping. On any other target
//! `Jit` falls back to stepping the reference interpreter one guest
//! instruction at a time -- functionally identical, just without the
//! speedup (see the `portable` submodule).

#[cfg(target_arch = "x86_64")]
mod block;
#[cfg(target_arch = "x86_64")]
mod cache;
#[cfg(target_arch = "x86_64")]
mod helpers;
#[cfg(not(target_arch = "x86_64"))]
mod portable;

#[cfg(target_arch = "x86_64")]
pub use cache::{BasicBlock, TranslationCache, CACHE_SLOTS};
#[cfg(not(target_arch = "x86_64"))]
pub use portable::Jit;

#[cfg(target_arch = "x86_64")]
use crate::error::{CoreError, CoreResult};
#[cfg(target_arch = "x86_64")]
use crate::guest::GuestState;

/// Passed to every compiled block in a fixed host register (`spec.md`
/// §4.3's calling-convention contract: "one host register (`ctx`)
/// holds a pointer to the Guest State on entry" -- generalized here to
/// also carry the cache, since `Fx33`/`Fx55` must reach it to
/// invalidate after writing guest RAM).
///
/// `trap*` fields let emitted code report a fatal condition (stack
/// overflow on `2nnn`, underflow on `00EE`) without unwinding through
/// raw machine code: the block finishes normally and [`Jit::step`]
/// checks `trap` once control returns to Rust.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
pub(crate) struct ExecCtx {
    pub guest: *mut GuestState,
    pub cache: *mut TranslationCache,
    pub trap: u32,
    pub trap_op: u16,
    pub trap_pc: u16,
}

/// The JIT: a translation cache plus the logic to look up or compile a
/// block for the current guest `pc` and invoke it (`spec.md` §4.4's
/// Execution Dispatcher, folded into this one call).
/// Per-session compile budget (`spec.md` §3's "an implementation may
/// cap it and fall back to the interpreter when exhausted").
///
/// `chip8_core::jit::block::compile` gives each block its own
/// independently-allocated `dynasmrt::ExecutableBuffer` rather than
/// bump-allocating out of one monolithic append-only region
/// (`DESIGN.md` records this as a deliberate simplification of
/// `spec.md` §3's Executable Buffer), so there is no literal mmap to
/// run out of. This cap realizes the same recoverable-exhaustion
/// contract anyway: once a session has compiled this many blocks
/// without a flush, further compiles report
/// [`CoreError::BufferExhausted`] instead of growing without bound.
#[cfg(target_arch = "x86_64")]
const MAX_BLOCKS_PER_SESSION: usize = 8192;

#[cfg(target_arch = "x86_64")]
pub struct Jit {
    cache: TranslationCache,
    blocks_compiled: usize,
}

#[cfg(target_arch = "x86_64")]
impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
impl Jit {
    pub fn new() -> Self {
        Self {
            cache: TranslationCache::new(),
            blocks_compiled: 0,
        }
    }

    /// Advance the guest by one basic block: look up a cached
    /// translation for the current `pc`, compiling and inserting one
    /// first if there isn't one, then run it.
    ///
    /// If the translator can't proceed -- the opcode it prefetched is
    /// unknown -- it aborts before emitting anything and this falls
    /// back to the reference interpreter for exactly one instruction
    /// (`spec.md` §4.6), which reports the same fatal error the JIT
    /// itself would have.
    pub fn step(&mut self, state: &mut GuestState) -> CoreResult<()> {
        let pc = state.pc;

        if self.cache.lookup(pc).is_none() {
            if self.blocks_compiled >= MAX_BLOCKS_PER_SESSION {
                return Err(CoreError::BufferExhausted {
                    blocks_compiled: self.blocks_compiled,
                });
            }

            match block::compile(state, pc) {
                Ok(compiled) => {
                    log::debug!(
                        "compiled block {:#05x}..={:#05x} (compile #{})",
                        compiled.start_pc,
                        compiled.end_pc,
                        self.blocks_compiled + 1
                    );
                    self.cache.insert(compiled);
                    self.blocks_compiled += 1;
                }
                Err(CoreError::UnknownOpcode { .. }) => {
                    return crate::interp::step(state);
                }
                Err(other) => return Err(other),
            }
        }

        // `lookup` only ever borrows `self.cache`; coercing straight to
        // a raw pointer lets that borrow end here so `ExecCtx` below
        // can take its own pointer into the same field.
        let block_ptr = self.cache.lookup(pc).expect("just compiled") as *const BasicBlock;

        let mut ctx = ExecCtx {
            guest: state as *mut GuestState,
            cache: &mut self.cache as *mut TranslationCache,
            trap: 0,
            trap_op: 0,
            trap_pc: 0,
        };

        // Safety: `block_ptr` was just looked up for `pc`, and
        // `ctx.guest` points at the very `state` that block was
        // compiled against.
        unsafe { (*block_ptr).call(&mut ctx as *mut ExecCtx) };

        if ctx.trap != 0 {
            return Err(CoreError::UnknownOpcode {
                opcode: ctx.trap_op,
                pc: ctx.trap_pc,
            });
        }

        Ok(())
    }

    /// Drop every cached block and reset the compile counter. Called
    /// after a [`CoreError::BufferExhausted`] (`spec.md` §7): the next
    /// `step` recompiles everything from a clean cache and a fresh
    /// compile budget.
    pub fn flush(&mut self) {
        log::debug!(
            "flushing translation cache after {} compiled blocks",
            self.blocks_compiled
        );
        self.cache.flush();
        self.blocks_compiled = 0;
    }

    /// Number of blocks compiled since the last flush. Exposed for
    /// logging and tests, not used in any correctness decision.
    pub fn blocks_compiled(&self) -> usize {
        self.blocks_compiled
    }
}
