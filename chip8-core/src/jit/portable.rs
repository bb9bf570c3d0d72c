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

//! Fallback `Jit` for host targets `dynasmrt` doesn't emit code for.
//!
//! `spec.md` §4 describes the Host Assembler as an external
//! dependency the core only wraps; on a target where that dependency
//! can't generate machine code, the correctness contract ("the JIT
//! leaves the Guest State byte-identical to ... the reference
//! interpreter", `spec.md` §8) is trivially preserved by *being* the
//! reference interpreter. This keeps `chip8-cli` and any other caller
//! working unmodified on every host, just without the translation
//! speedup `dynasmrt`-backed targets get.

use crate::error::CoreResult;
use crate::guest::GuestState;
use crate::interp;

/// Drop-in replacement for the `x86_64` [`super::Jit`] with the same
/// public surface, backed entirely by [`interp::step`].
#[derive(Debug, Default)]
pub struct Jit {
    steps: usize,
}

impl Jit {
    pub fn new() -> Self {
        Self { steps: 0 }
    }

    /// Advance the guest by exactly one instruction via the reference
    /// interpreter. There is no basic-block concept to discover here,
    /// so this advances one guest opcode rather than one block --
    /// still observably identical, just at interpreter granularity.
    pub fn step(&mut self, state: &mut GuestState) -> CoreResult<()> {
        self.steps += 1;
        interp::step(state)
    }

    /// No cache to flush; kept so callers don't need to special-case
    /// the fallback after a [`crate::error::CoreError::BufferExhausted`],
    /// which this backend never produces.
    pub fn flush(&mut self) {}

    /// Always zero: this backend never compiles a block.
    pub fn blocks_compiled(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_one_instruction_at_a_time() {
        let mut state = GuestState::new();
        state.load_rom(&[0x62, 0x05, 0x12, 0x00]).unwrap();
        let mut jit = Jit::new();

        jit.step(&mut state).unwrap();
        assert_eq!(state.v[2], 0x05);
        assert_eq!(state.pc, 0x202);
        assert_eq!(jit.blocks_compiled(), 0);
    }
}
