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

//! The machine's architectural state, shared bit-for-bit between the
//! reference interpreter and the JIT.

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::fmt;

use crate::error::{CoreError, CoreResult, MAX_ROM_LEN};
use crate::font::{FONT_END, FONT_SPRITES, FONT_START};

/// Programs start execution here; `ram[0x200..0x1000)` is theirs.
pub const ROM_START: usize = 0x200;

/// Virtual CPU frequency the timer cadence is derived from. Matches
/// the constant the system this backend's semantics were distilled
/// from uses for its own `kTimersRate` computation.
pub const CPU_FREQ: u32 = 3_355_443;

/// `floor(CPU_FREQ / 60)`: number of guest instructions between
/// successive delay/sound timer decrements.
pub const TIMERS_RATE: u32 = CPU_FREQ / 60;

/// Injectable source of randomness for `Cxkk`.
///
/// Exists so that `Cxkk` can be made deterministic under test instead
/// of reaching for a process-global RNG, per the design note in
/// `spec.md` about eliminating globals for randomness.
pub trait RandomSource: fmt::Debug + Send {
    fn next_byte(&mut self) -> u8;
}

/// Default `RandomSource`, backed by a non-cryptographic PRNG.
#[derive(Debug)]
pub struct Rng(SmallRng);

impl Rng {
    pub fn from_entropy() -> Self {
        Self(SmallRng::from_entropy())
    }
}

impl Default for Rng {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource for Rng {
    fn next_byte(&mut self) -> u8 {
        (self.0.next_u32() & 0xFF) as u8
    }
}

/// The CHIP-8 machine's full architectural state.
///
/// `#[repr(C)]` is load-bearing: the JIT computes field offsets with
/// `memoffset::offset_of!` and bakes them into emitted host code as
/// `[reg + offset]` operands, so this layout must stay stable and
/// C-compatible.
#[repr(C)]
pub struct GuestState {
    /// Program counter. `0x000 <= pc <= 0xFFE`.
    pub pc: u16,

    /// Address register; 12 meaningful bits.
    pub i: u16,

    /// General-purpose registers `V0..VF`. `v[0xF]` doubles as the
    /// flag register for several ALU opcodes.
    pub v: [u8; 16],

    /// Subroutine return-address stack. Entries below `sp` are live.
    pub stack: [u16; 16],

    /// Stack pointer, `0..=16`.
    pub sp: u8,

    /// 4 KiB working memory. `ram[0x050..0x0A0)` holds the font
    /// table; `ram[0x200..)` holds the loaded ROM.
    pub ram: [u8; 4096],

    /// 32 rows of 64 bits each; bit `x` of row `y` is pixel `(x, y)`.
    pub display: [u64; 32],

    /// Delay timer, decremented at the `TIMERS_RATE` cadence.
    pub delay: u8,

    /// Sound timer, decremented at the `TIMERS_RATE` cadence.
    pub sound: u8,

    /// Instruction counter used to pace the two timers above.
    pub cycles: u32,

    /// Set by `00E0`/`Dxyn`; an external collaborator clears it after
    /// presenting a frame.
    pub draw: bool,

    /// Source of randomness for `Cxkk`.
    pub rng: Box<dyn RandomSource>,
}

impl fmt::Debug for GuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestState")
            .field("pc", &self.pc)
            .field("i", &self.i)
            .field("v", &self.v)
            .field("sp", &self.sp)
            .field("delay", &self.delay)
            .field("sound", &self.sound)
            .field("cycles", &self.cycles)
            .field("draw", &self.draw)
            .finish_non_exhaustive()
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestState {
    /// Build a fresh machine: zeroed memory and registers, the font
    /// table resident, `pc` at `0x200`, and a non-deterministic RNG.
    pub fn new() -> Self {
        Self::with_random_source(Box::new(Rng::from_entropy()))
    }

    /// As [`GuestState::new`], but with an explicit `RandomSource` --
    /// the seam tests use to make `Cxkk` deterministic.
    pub fn with_random_source(rng: Box<dyn RandomSource>) -> Self {
        let mut ram = [0u8; 4096];
        ram[FONT_START..FONT_END].copy_from_slice(&FONT_SPRITES);

        Self {
            pc: ROM_START as u16,
            i: 0,
            v: [0; 16],
            stack: [0; 16],
            sp: 0,
            ram,
            display: [0; 32],
            delay: 0,
            sound: 0,
            cycles: 0,
            draw: false,
            rng,
        }
    }

    /// Load a ROM image into `ram[0x200..0x200+len)`.
    ///
    /// Rejects images larger than the `0xE00`-byte window without
    /// mutating any state.
    pub fn load_rom(&mut self, image: &[u8]) -> CoreResult<()> {
        if image.len() > MAX_ROM_LEN {
            return Err(CoreError::RomTooLarge {
                len: image.len(),
                max: MAX_ROM_LEN,
            });
        }

        self.ram[ROM_START..ROM_START + image.len()].copy_from_slice(image);
        Ok(())
    }

    /// Fetch the VRAM as a `(rows, row bits)` bitplane, 32 rows of 64
    /// bits each.
    pub fn display(&self) -> &[u64; 32] {
        &self.display
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        (self.display[y % 32] >> (x % 64)) & 1 != 0
    }

    /// Draw a single row's worth of sprite bits at `(x, y)`, wrapping
    /// at the screen edges, and report whether any already-set pixel
    /// was cleared (the caller ORs this into `v[0xF]`).
    pub(crate) fn xor_sprite_row(&mut self, x: usize, y: usize, bits: u8) -> bool {
        let row = y % 32;
        let mut collided = false;

        for bit in 0..8 {
            if bits & (0x80 >> bit) == 0 {
                continue;
            }

            let col = (x + bit) % 64;
            let mask = 1u64 << col;

            if self.display[row] & mask != 0 {
                collided = true;
            }

            self.display[row] ^= mask;
        }

        collided
    }

    /// Draw an `n`-byte sprite resident at `ram[i..i+n)` at `(x, y)`,
    /// XORing each row into `display` and reporting collision in
    /// `v[0xF]`. Shared by the reference interpreter and the JIT's
    /// `Dxyn` helper so the two can never disagree (`spec.md` §4.2).
    pub(crate) fn draw_sprite(&mut self, x: u8, y: u8, n: u8) {
        let base = self.i as usize;
        let mut collided = false;

        for row in 0..n as usize {
            let bits = self.ram[(base + row) % self.ram.len()];
            collided |= self.xor_sprite_row(x as usize, y as usize + row, bits);
        }

        self.v[0xF] = collided as u8;
        self.draw = true;
    }

    /// Draw the next pseudo-random byte masked by `kk` (`Cxkk`). Takes
    /// the mask here rather than returning a bare byte so the JIT
    /// helper and the interpreter share one call site for the whole
    /// opcode, not just the RNG draw.
    pub(crate) fn random_masked(&mut self, kk: u8) -> u8 {
        self.rng.next_byte() & kk
    }
}
