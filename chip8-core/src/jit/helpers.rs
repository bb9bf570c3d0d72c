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

//! Native callbacks emitted code calls back into for the opcodes that
//! are impractical to inline in host assembly (`spec.md` §4.3,
//! "Complex opcodes as helper calls"): sprite drawing, BCD conversion,
//! the register/memory block transfers, and anything that touches the
//! injected [`crate::guest::RandomSource`]. Every one of these calls
//! straight into the same [`GuestState`] methods or [`crate::interp`]
//! functions the reference interpreter uses, so the two engines cannot
//! quietly drift apart on the parts that are hard to get right twice.
//!
//! `x`/`y`/`n` arguments are always compile-time constants the
//! emitter bakes in as immediates (they come from the literal opcode
//! word, not a runtime register); only the *values* these helpers read
//! out of `v[x]`/`v[y]`/`ram[i..]` are live guest state.

use crate::guest::GuestState;
use crate::interp::tick_timers;
use crate::jit::ExecCtx;

/// `Dxyn`.
///
/// Safety: `guest` must be a live, exclusively-held `*mut GuestState`.
pub(crate) unsafe extern "C" fn helper_dxyn(guest: *mut GuestState, x: u8, y: u8, n: u8) {
    let guest = &mut *guest;
    let (vx, vy) = (guest.v[x as usize], guest.v[y as usize]);
    guest.draw_sprite(vx, vy, n);
}

/// `Cxkk`. Routed through a helper because the injected
/// `RandomSource` trait object has no representation emitted code
/// could call directly.
///
/// Safety: `guest` must be a live, exclusively-held `*mut GuestState`.
pub(crate) unsafe extern "C" fn helper_cxkk(guest: *mut GuestState, x: u8, kk: u8) {
    let guest = &mut *guest;
    guest.v[x as usize] = guest.random_masked(kk);
}

/// `Fx33`: BCD-encodes `v[x]` into `ram[i..i+3)`, then invalidates
/// every cached block whose range covers any of the three written
/// addresses (`spec.md` §4.5's Self-modification Monitor).
///
/// Safety: `ctx` must be a live `*mut ExecCtx` whose `guest` and
/// `cache` pointers are both exclusively held for the duration of the
/// call.
pub(crate) unsafe extern "C" fn helper_fx33(ctx: *mut ExecCtx, x: u8) {
    let guest = &mut *(*ctx).guest;
    let vx = guest.v[x as usize];
    let len = guest.ram.len();
    let base = guest.i as usize;
    let addrs = [base % len, (base + 1) % len, (base + 2) % len];

    guest.ram[addrs[0]] = vx / 100;
    guest.ram[addrs[1]] = (vx / 10) % 10;
    guest.ram[addrs[2]] = vx % 10;

    let cache = &mut *(*ctx).cache;
    for &addr in &addrs {
        cache.invalidate_containing(addr as u16);
    }
}

/// `Fx55`: copies `v[0..=x]` into `ram[i..=i+x]`, then invalidates the
/// written range the same way `helper_fx33` does.
///
/// Safety: see `helper_fx33`.
pub(crate) unsafe extern "C" fn helper_fx55(ctx: *mut ExecCtx, x: u8) {
    let guest = &mut *(*ctx).guest;
    let len = guest.ram.len();
    let base = guest.i as usize;

    for offset in 0..=x as usize {
        guest.ram[(base + offset) % len] = guest.v[offset];
    }

    let cache = &mut *(*ctx).cache;
    for offset in 0..=x as usize {
        cache.invalidate_containing(((base + offset) % len) as u16);
    }
}

/// `Fx65`: the read-only counterpart of `helper_fx55`. Never writes
/// guest RAM, so no invalidation is needed and `guest` alone suffices.
///
/// Safety: `guest` must be a live, exclusively-held `*mut GuestState`.
pub(crate) unsafe extern "C" fn helper_fx65(guest: *mut GuestState, x: u8) {
    let guest = &mut *guest;
    let len = guest.ram.len();
    let base = guest.i as usize;

    for offset in 0..=x as usize {
        guest.v[offset] = guest.ram[(base + offset) % len];
    }
}

/// Applies `n` instructions' worth of the timer cadence in one call --
/// the "timer update may be batched at block end" relaxation
/// (`spec.md` §4.3), realized by calling the exact function the
/// reference interpreter calls once per step, `n` times in a row.
///
/// Safety: `guest` must be a live, exclusively-held `*mut GuestState`.
pub(crate) unsafe extern "C" fn helper_tick_n(guest: *mut GuestState, n: u16) {
    let guest = &mut *guest;
    for _ in 0..n {
        tick_timers(guest);
    }
}
