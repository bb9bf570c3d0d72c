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

//! The Block Translator (`spec.md` §4.3): reads guest opcodes starting
//! at a given `pc`, emits x86-64 machine code for each with
//! `dynasmrt`, and stops at the first control-flow-altering opcode.
//!
//! Every emitted opcode leaves the guest state as the reference
//! interpreter would have, with two relaxations `spec.md` explicitly
//! allows: the per-instruction timer tick is batched into as few calls
//! as possible (one at the end of the block, plus an early flush
//! whenever `Fx07`/`Fx15`/`Fx18` needs the cadence caught up first --
//! see `touches_timer` -- so a block can't let one of those opcodes
//! observe a stale `delay`/`sound`), and the guest `pc` is never read
//! back out of memory mid-block -- every instruction up to and
//! including the terminator already knows its own address at
//! translation time, so the "dedicated host register caching `pc`" the
//! spec describes is realized here as a compile-time constant instead,
//! which is strictly stronger (no register traffic for `pc` at all
//! until the one field write at the very end).

use dynasmrt::x64::Assembler;
use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmLabelApi};
use memoffset::offset_of;

use crate::error::{CoreError, CoreResult};
use crate::guest::GuestState;
use crate::interp::{decode, fetch_at, is_control_flow, Decoded};
use crate::jit::cache::BasicBlock;
use crate::jit::helpers::{
    helper_cxkk, helper_dxyn, helper_fx33, helper_fx55, helper_fx65, helper_tick_n,
};
use crate::jit::ExecCtx;

/// Named host-register operands, in place of the source's
/// macro-aliased `gen->r8`/`gen->rdi`-style locals (`spec.md` §9,
/// "Eliminated source patterns"). `CTX` and `GUEST` are callee-saved
/// on both the SysV and Windows x64 ABIs, so they survive every helper
/// `call` in this module untouched -- no reload after a call is ever
/// needed, unlike the source's `contextPtr`.
mod regs {
    pub const CTX: u8 = 3; // rbx
    pub const GUEST: u8 = 12; // r12
    pub const T0: u8 = 8; // r8
    pub const T1: u8 = 9; // r9
    pub const T2: u8 = 10; // r10
    pub const T3: u8 = 11; // r11 -- also used to hold call targets
}

/// Platform argument-register placement and shadow-space requirement
/// (`spec.md` §4.3's calling-convention contract: "honors the host
/// platform's ABI for argument-register placement"). `CTX`/`GUEST`
/// above don't appear here because they're never passed as arguments
/// -- they're copied into a genuine argument register right before
/// each call.
#[cfg(windows)]
mod abi {
    pub const ENTRY_ARG0: u8 = 1; // rcx
    pub const ARG0: u8 = 1; // rcx
    pub const ARG1: u8 = 2; // rdx
    pub const ARG2: u8 = 8; // r8
    pub const ARG3: u8 = 9; // r9
    pub const SHADOW_SPACE: i32 = 32;
}

#[cfg(not(windows))]
mod abi {
    pub const ENTRY_ARG0: u8 = 7; // rdi
    pub const ARG0: u8 = 7; // rdi
    pub const ARG1: u8 = 6; // rsi
    pub const ARG2: u8 = 2; // rdx
    pub const ARG3: u8 = 1; // rcx
    pub const SHADOW_SPACE: i32 = 0;
}

const GUEST_OFF_PC: i32 = offset_of!(GuestState, pc) as i32;
const GUEST_OFF_I: i32 = offset_of!(GuestState, i) as i32;
const GUEST_OFF_V: i32 = offset_of!(GuestState, v) as i32;
const GUEST_OFF_STACK: i32 = offset_of!(GuestState, stack) as i32;
const GUEST_OFF_SP: i32 = offset_of!(GuestState, sp) as i32;
const GUEST_OFF_DISPLAY: i32 = offset_of!(GuestState, display) as i32;
const GUEST_OFF_DELAY: i32 = offset_of!(GuestState, delay) as i32;
const GUEST_OFF_SOUND: i32 = offset_of!(GuestState, sound) as i32;
const GUEST_OFF_DRAW: i32 = offset_of!(GuestState, draw) as i32;

const CTX_OFF_GUEST: i32 = offset_of!(ExecCtx, guest) as i32;
const CTX_OFF_TRAP: i32 = offset_of!(ExecCtx, trap) as i32;
const CTX_OFF_TRAP_OP: i32 = offset_of!(ExecCtx, trap_op) as i32;
const CTX_OFF_TRAP_PC: i32 = offset_of!(ExecCtx, trap_pc) as i32;

fn v_off(x: usize) -> i32 {
    GUEST_OFF_V + x as i32
}

/// Compile the basic block starting at `start_pc`: emit host code for
/// every guest instruction up to and including the first
/// control-flow-altering one (`spec.md` §4.3's boundary policy).
///
/// Returns [`CoreError::UnknownOpcode`] if the *first* opcode -- or
/// any later one before the terminator -- can't be classified, in
/// which case nothing has been emitted for it and the caller
/// (`spec.md` §4.6) falls back to the reference interpreter for one
/// step instead of caching a half-built block.
pub(crate) fn compile(state: &GuestState, start_pc: u16) -> CoreResult<BasicBlock> {
    let mut ops = Assembler::new().map_err(|_| CoreError::BufferExhausted {
        blocks_compiled: 0,
    })?;
    let entry = ops.offset();
    let epilogue = ops.new_dynamic_label();

    emit_prologue(&mut ops);

    let mut pc = start_pc;
    let mut pending_ticks: u16 = 0;
    loop {
        let op = fetch_at(state, pc);
        let inst = classify(op).ok_or(CoreError::UnknownOpcode { opcode: op, pc })?;

        // `Fx07`/`Fx15`/`Fx18` observe or overwrite `delay`/`sound`
        // directly; any ticks deferred from earlier instructions in
        // this block must land first, or this opcode would read (or
        // get immediately overwritten past) a value the interpreter
        // would never have produced at this point.
        if touches_timer(&inst) && pending_ticks > 0 {
            emit_tick_call(&mut ops, pending_ticks);
            pending_ticks = 0;
        }

        let terminates = is_control_flow(op);
        emit_instruction(&mut ops, &inst, op, pc, epilogue);
        pending_ticks += 1;

        if terminates {
            break;
        }
        pc = pc.wrapping_add(2);
    }
    let end_pc = pc;

    emit_tail(&mut ops, epilogue, pending_ticks);

    let buf = ops.finalize().map_err(|_| CoreError::BufferExhausted {
        blocks_compiled: 0,
    })?;

    Ok(BasicBlock::new(start_pc, end_pc, buf, entry))
}

/// One classified guest instruction, carrying whatever operands its
/// emission needs. Produced by [`classify`], consumed by
/// [`emit_instruction`] -- kept as a separate step (rather than
/// switching on the raw opcode word twice) so "is this opcode known"
/// and "how do I emit it" can never disagree.
enum Inst {
    Cls,
    Ret,
    Jp { addr: u16 },
    Call { addr: u16 },
    SeImm { x: usize, kk: u8 },
    SneImm { x: usize, kk: u8 },
    SeReg { x: usize, y: usize },
    SneReg { x: usize, y: usize },
    LdImm { x: usize, kk: u8 },
    AddImm { x: usize, kk: u8 },
    LdReg { x: usize, y: usize },
    Or { x: usize, y: usize },
    And { x: usize, y: usize },
    Xor { x: usize, y: usize },
    AddReg { x: usize, y: usize },
    SubReg { x: usize, y: usize },
    Shr { x: usize },
    SubnReg { x: usize, y: usize },
    Shl { x: usize },
    LdI { addr: u16 },
    JpV0 { addr: u16 },
    Rnd { x: usize, kk: u8 },
    Drw { x: usize, y: usize, n: u8 },
    LdVxDt { x: usize },
    LdDtVx { x: usize },
    LdStVx { x: usize },
    AddIVx { x: usize },
    LdFVx { x: usize },
    LdBVx { x: usize },
    LdIVx { x: usize },
    LdVxI { x: usize },
}

/// Mirrors `interp::step`'s opcode-group match exactly (same groups,
/// same unimplemented cases), but builds an [`Inst`] instead of
/// executing one. `examples/original_source/src/Chip8.cpp`'s
/// `RunInterpreter`/`EmitInstruction` pair is the same shape: one
/// decode, two consumers.
fn classify(op: u16) -> Option<Inst> {
    let d: Decoded = decode(op);

    Some(match op & 0xF000 {
        0x0000 => match d.addr {
            0x0E0 => Inst::Cls,
            0x0EE => Inst::Ret,
            _ => return None,
        },
        0x1000 => Inst::Jp { addr: d.addr },
        0x2000 => Inst::Call { addr: d.addr },
        0x3000 => Inst::SeImm { x: d.x, kk: d.kk },
        0x4000 => Inst::SneImm { x: d.x, kk: d.kk },
        0x5000 if d.n == 0 => Inst::SeReg { x: d.x, y: d.y },
        0x6000 => Inst::LdImm { x: d.x, kk: d.kk },
        0x7000 => Inst::AddImm { x: d.x, kk: d.kk },
        0x8000 => match d.n {
            0x0 => Inst::LdReg { x: d.x, y: d.y },
            0x1 => Inst::Or { x: d.x, y: d.y },
            0x2 => Inst::And { x: d.x, y: d.y },
            0x3 => Inst::Xor { x: d.x, y: d.y },
            0x4 => Inst::AddReg { x: d.x, y: d.y },
            0x5 => Inst::SubReg { x: d.x, y: d.y },
            0x6 => Inst::Shr { x: d.x },
            0x7 => Inst::SubnReg { x: d.x, y: d.y },
            0xE => Inst::Shl { x: d.x },
            _ => return None,
        },
        0x9000 if d.n == 0 => Inst::SneReg { x: d.x, y: d.y },
        0xA000 => Inst::LdI { addr: d.addr },
        0xB000 => Inst::JpV0 { addr: d.addr },
        0xC000 => Inst::Rnd { x: d.x, kk: d.kk },
        0xD000 => Inst::Drw { x: d.x, y: d.y, n: d.n },
        0xF000 => match d.kk {
            0x07 => Inst::LdVxDt { x: d.x },
            0x15 => Inst::LdDtVx { x: d.x },
            0x18 => Inst::LdStVx { x: d.x },
            0x1E => Inst::AddIVx { x: d.x },
            0x29 => Inst::LdFVx { x: d.x },
            0x33 => Inst::LdBVx { x: d.x },
            0x55 => Inst::LdIVx { x: d.x },
            0x65 => Inst::LdVxI { x: d.x },
            _ => return None,
        },
        _ => return None,
    })
}

/// Prologue: spill the two callee-saved registers this module
/// dedicates to `ctx`/`guest` (`spec.md` §4.3: "the block's prologue
/// spills the platform's callee-saved registers that the block may
/// clobber"), align the stack and reserve Windows shadow space, load
/// `ctx` from the entry argument register, and dereference `guest`
/// out of it once up front.
fn emit_prologue(ops: &mut Assembler) {
    let reserve = 8 + abi::SHADOW_SPACE;
    dynasm!(ops
        ; .arch x64
        ; push Rq(regs::CTX)
        ; push Rq(regs::GUEST)
        ; sub rsp, reserve
        ; mov Rq(regs::CTX), Rq(abi::ENTRY_ARG0)
        ; mov Rq(regs::GUEST), QWORD [Rq(regs::CTX) + CTX_OFF_GUEST]
    );
}

/// Whether `inst` observes or overwrites `delay`/`sound` directly
/// (`Fx07`/`Fx15`/`Fx18`). Any instruction like this must see the
/// timer cadence fully caught up before it runs -- `compile` uses this
/// to flush `pending_ticks` early instead of deferring them to the
/// block's tail.
fn touches_timer(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::LdVxDt { .. } | Inst::LdDtVx { .. } | Inst::LdStVx { .. }
    )
}

/// Apply `n` deferred timer ticks by calling `helper_tick_n`, which
/// runs `tick_timers` `n` times in a row -- bit-identical to the
/// interpreter calling it after each of those `n` instructions in
/// turn, since nothing else reads `delay`/`sound` between them.
fn emit_tick_call(ops: &mut Assembler, n: u16) {
    let helper = helper_tick_n as usize as i64;
    dynasm!(ops
        ; .arch x64
        ; mov Rq(abi::ARG0), Rq(regs::GUEST)
        ; mov Rd(abi::ARG1), n as i32
        ; mov Rq(regs::T3), QWORD helper
        ; call Rq(regs::T3)
    );
}

/// Shared block tail: flush whatever timer ticks are still pending
/// since the last flush point (`spec.md` §4.3's batching relaxation,
/// applied only across instructions that don't themselves observe
/// `delay`/`sound`), then the epilogue proper. The `epilogue` label
/// sits *after* the timer call, so a trapping terminator can jump
/// straight to it and skip ticking an instruction that never actually
/// completed -- matching `interp::step`, which returns before calling
/// `tick_timers` on the same failure paths.
fn emit_tail(ops: &mut Assembler, epilogue: DynamicLabel, pending_ticks: u16) {
    if pending_ticks > 0 {
        emit_tick_call(ops, pending_ticks);
    }
    let restore = 8 + abi::SHADOW_SPACE;
    dynasm!(ops
        ; .arch x64
        ; =>epilogue
        ; add rsp, restore
        ; pop Rq(regs::GUEST)
        ; pop Rq(regs::CTX)
        ; ret
    );
}

/// Emit a trap: record the opcode/pc the fault happened at into
/// `ExecCtx`, then jump straight to the epilogue, skipping the timer
/// tick for this never-completed instruction.
fn emit_trap(ops: &mut Assembler, op: u16, pc: u16, epilogue: DynamicLabel) {
    dynasm!(ops
        ; .arch x64
        ; mov DWORD [Rq(regs::CTX) + CTX_OFF_TRAP], 1
        ; mov WORD [Rq(regs::CTX) + CTX_OFF_TRAP_OP], op as i16
        ; mov WORD [Rq(regs::CTX) + CTX_OFF_TRAP_PC], pc as i16
        ; jmp =>epilogue
    );
}

fn emit_helper_call(ops: &mut Assembler, helper: i64) {
    dynasm!(ops
        ; .arch x64
        ; mov Rq(regs::T3), QWORD helper
        ; call Rq(regs::T3)
    );
}

fn emit_instruction(ops: &mut Assembler, inst: &Inst, op: u16, pc: u16, epilogue: DynamicLabel) {
    match *inst {
        Inst::Cls => {
            for row in 0..32i32 {
                let off = GUEST_OFF_DISPLAY + row * 8;
                dynasm!(ops
                    ; .arch x64
                    ; mov QWORD [Rq(regs::GUEST) + off], 0
                );
            }
            dynasm!(ops
                ; .arch x64
                ; mov BYTE [Rq(regs::GUEST) + GUEST_OFF_DRAW], 1
            );
        }

        Inst::Ret => {
            dynasm!(ops
                ; .arch x64
                ; movzx Rd(regs::T0), BYTE [Rq(regs::GUEST) + GUEST_OFF_SP]
                ; cmp Rb(regs::T0), 0
                ; jne >ok
            );
            emit_trap(ops, op, pc, epilogue);
            dynasm!(ops
                ; .arch x64
                ; ok:
                ; sub Rb(regs::T0), 1
                ; mov BYTE [Rq(regs::GUEST) + GUEST_OFF_SP], Rb(regs::T0)
                ; movzx Rq(regs::T1), Rb(regs::T0)
                ; movzx Rd(regs::T2), WORD [Rq(regs::GUEST) + GUEST_OFF_STACK + Rq(regs::T1) * 2]
                ; add Rw(regs::T2), 2
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_PC], Rw(regs::T2)
            );
        }

        Inst::Jp { addr } => {
            dynasm!(ops
                ; .arch x64
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_PC], addr as i16
            );
        }

        Inst::Call { addr } => {
            let ret_pc = pc as i16;
            dynasm!(ops
                ; .arch x64
                ; movzx Rd(regs::T0), BYTE [Rq(regs::GUEST) + GUEST_OFF_SP]
                ; cmp Rb(regs::T0), 16
                ; jl >ok
            );
            emit_trap(ops, op, pc, epilogue);
            dynasm!(ops
                ; .arch x64
                ; ok:
                ; movzx Rq(regs::T1), Rb(regs::T0)
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_STACK + Rq(regs::T1) * 2], ret_pc
                ; add Rb(regs::T0), 1
                ; mov BYTE [Rq(regs::GUEST) + GUEST_OFF_SP], Rb(regs::T0)
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_PC], addr as i16
            );
        }

        // 3xkk/4xkk/5xy0/9xy0: the skip distance (2 or 4) added to a
        // `pc` that is already a translation-time constant collapses
        // to "store one of two compile-time-known values, chosen by a
        // runtime compare" -- a `cmov`, exactly like the source, just
        // without needing to first load the old `pc` out of memory.
        Inst::SeImm { x, kk } => emit_skip(ops, pc, |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; cmp Rb(regs::T0), kk as i8
                ; sete Rb(regs::T1)
            );
        }),
        Inst::SneImm { x, kk } => emit_skip(ops, pc, |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; cmp Rb(regs::T0), kk as i8
                ; setne Rb(regs::T1)
            );
        }),
        Inst::SeReg { x, y } => emit_skip(ops, pc, |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T2), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; cmp Rb(regs::T0), Rb(regs::T2)
                ; sete Rb(regs::T1)
            );
        }),
        Inst::SneReg { x, y } => emit_skip(ops, pc, |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T2), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; cmp Rb(regs::T0), Rb(regs::T2)
                ; setne Rb(regs::T1)
            );
        }),

        Inst::LdImm { x, kk } => {
            dynasm!(ops
                ; .arch x64
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], kk as i8
            );
        }
        Inst::AddImm { x, kk } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; add Rb(regs::T0), kk as i8
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
            );
        }

        Inst::LdReg { x, y } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
            );
        }
        Inst::Or { x, y } => emit_bitwise(ops, x, y, |ops| {
            dynasm!(ops ; .arch x64 ; or Rb(regs::T0), Rb(regs::T1));
        }),
        Inst::And { x, y } => emit_bitwise(ops, x, y, |ops| {
            dynasm!(ops ; .arch x64 ; and Rb(regs::T0), Rb(regs::T1));
        }),
        Inst::Xor { x, y } => emit_bitwise(ops, x, y, |ops| {
            dynasm!(ops ; .arch x64 ; xor Rb(regs::T0), Rb(regs::T1));
        }),

        // `8xy4`/`8xy5`/`8xy6`/`8xy7`/`8xyE`: both operands are read
        // into scratch registers before *any* memory write, so the
        // `v[0xF]`-aliases-`v[x]` case (`x == 0xF`) resolves the same
        // way the reference interpreter's plain-field-aliasing does --
        // whichever write happens second wins.
        Inst::AddReg { x, y } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T1), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; mov Rb(regs::T2), Rb(regs::T0)
                ; add Rb(regs::T2), Rb(regs::T1)
                ; setc Rb(regs::T3)
                ; mov BYTE [Rq(regs::GUEST) + v_off(0xF)], Rb(regs::T3)
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T2)
            );
        }
        Inst::SubReg { x, y } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T1), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; cmp Rb(regs::T0), Rb(regs::T1)
                ; seta Rb(regs::T3)
                ; mov BYTE [Rq(regs::GUEST) + v_off(0xF)], Rb(regs::T3)
                ; mov Rb(regs::T2), Rb(regs::T0)
                ; sub Rb(regs::T2), Rb(regs::T1)
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T2)
            );
        }
        Inst::Shr { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T1), Rb(regs::T0)
                ; and Rb(regs::T1), 1
                ; mov BYTE [Rq(regs::GUEST) + v_off(0xF)], Rb(regs::T1)
                ; shr Rb(regs::T0), 1
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
            );
        }
        Inst::SubnReg { x, y } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T1), BYTE [Rq(regs::GUEST) + v_off(y)]
                ; cmp Rb(regs::T1), Rb(regs::T0)
                ; seta Rb(regs::T3)
                ; mov BYTE [Rq(regs::GUEST) + v_off(0xF)], Rb(regs::T3)
                ; mov Rb(regs::T2), Rb(regs::T1)
                ; sub Rb(regs::T2), Rb(regs::T0)
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T2)
            );
        }
        Inst::Shl { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov Rb(regs::T1), Rb(regs::T0)
                ; and Rb(regs::T1), 0x80u8 as i8
                ; setnz Rb(regs::T1)
                ; mov BYTE [Rq(regs::GUEST) + v_off(0xF)], Rb(regs::T1)
                ; shl Rb(regs::T0), 1
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
            );
        }

        Inst::LdI { addr } => {
            dynasm!(ops
                ; .arch x64
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_I], addr as i16
            );
        }
        Inst::JpV0 { addr } => {
            dynasm!(ops
                ; .arch x64
                ; movzx Rd(regs::T0), BYTE [Rq(regs::GUEST) + v_off(0)]
                ; add Rw(regs::T0), addr as i16
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_PC], Rw(regs::T0)
            );
        }

        // `Cxkk`: routed through a helper because the injected
        // `RandomSource` trait object has no inline representation
        // (`spec.md` §9's "inject a RandomSource capability" design
        // note, extended per `SPEC_FULL.md` §4.3).
        Inst::Rnd { x, kk } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rq(abi::ARG0), Rq(regs::GUEST)
                ; mov Rd(abi::ARG1), x as i32
                ; mov Rd(abi::ARG2), kk as i32
            );
            emit_helper_call(ops, helper_cxkk as usize as i64);
        }

        // `Dxyn`: `x`/`y`/`n` are baked in as immediates -- they're
        // register *indices* from the opcode word, not the live
        // register values, which `helper_dxyn` loads itself.
        Inst::Drw { x, y, n } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rq(abi::ARG0), Rq(regs::GUEST)
                ; mov Rd(abi::ARG1), x as i32
                ; mov Rd(abi::ARG2), y as i32
                ; mov Rd(abi::ARG3), n as i32
            );
            emit_helper_call(ops, helper_dxyn as usize as i64);
        }

        Inst::LdVxDt { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + GUEST_OFF_DELAY]
                ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
            );
        }
        Inst::LdDtVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov BYTE [Rq(regs::GUEST) + GUEST_OFF_DELAY], Rb(regs::T0)
            );
        }
        Inst::LdStVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; mov BYTE [Rq(regs::GUEST) + GUEST_OFF_SOUND], Rb(regs::T0)
            );
        }
        Inst::AddIVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; movzx Rd(regs::T0), WORD [Rq(regs::GUEST) + GUEST_OFF_I]
                ; movzx Rd(regs::T1), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; add Rw(regs::T0), Rw(regs::T1)
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_I], Rw(regs::T0)
            );
        }
        Inst::LdFVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; movzx Rd(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
                ; imul Rd(regs::T0), Rd(regs::T0), 5
                ; add Rd(regs::T0), 0x50
                ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_I], Rw(regs::T0)
            );
        }

        // `Fx33`/`Fx55` write guest RAM, so they call back into
        // helpers that also run the Self-modification Monitor
        // (`spec.md` §4.5) against the `cache` half of `ExecCtx` --
        // the reason these two take `ctx` rather than bare `guest`.
        Inst::LdBVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rq(abi::ARG0), Rq(regs::CTX)
                ; mov Rd(abi::ARG1), x as i32
            );
            emit_helper_call(ops, helper_fx33 as usize as i64);
        }
        Inst::LdIVx { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rq(abi::ARG0), Rq(regs::CTX)
                ; mov Rd(abi::ARG1), x as i32
            );
            emit_helper_call(ops, helper_fx55 as usize as i64);
        }
        Inst::LdVxI { x } => {
            dynasm!(ops
                ; .arch x64
                ; mov Rq(abi::ARG0), Rq(regs::GUEST)
                ; mov Rd(abi::ARG1), x as i32
            );
            emit_helper_call(ops, helper_fx65 as usize as i64);
        }
    }
}

/// Shared shape of the four skip opcodes (`3xkk`, `4xkk`, `5xy0`,
/// `9xy0`): a condition (built by `cond`, leaving a 0/1 byte in `T1`),
/// then select between `pc+2` and `pc+4` -- both compile-time
/// constants -- with a `cmov`, and store the result.
fn emit_skip(ops: &mut Assembler, pc: u16, cond: impl FnOnce(&mut Assembler)) {
    cond(ops);
    let not_taken = pc.wrapping_add(2) as i32;
    let taken = pc.wrapping_add(4) as i32;
    dynasm!(ops
        ; .arch x64
        ; mov Rw(regs::T0), not_taken as i16
        ; mov Rw(regs::T2), taken as i16
        ; test Rb(regs::T1), Rb(regs::T1)
        ; cmovnz Rw(regs::T0), Rw(regs::T2)
        ; mov WORD [Rq(regs::GUEST) + GUEST_OFF_PC], Rw(regs::T0)
    );
}

/// Shared shape of `8xy1`/`8xy2`/`8xy3`: load both operands, combine
/// with `op`, store back to `v[x]`.
fn emit_bitwise(ops: &mut Assembler, x: usize, y: usize, op: impl FnOnce(&mut Assembler)) {
    dynasm!(ops
        ; .arch x64
        ; mov Rb(regs::T0), BYTE [Rq(regs::GUEST) + v_off(x)]
        ; mov Rb(regs::T1), BYTE [Rq(regs::GUEST) + v_off(y)]
    );
    op(ops);
    dynasm!(ops
        ; .arch x64
        ; mov BYTE [Rq(regs::GUEST) + v_off(x)], Rb(regs::T0)
    );
}
