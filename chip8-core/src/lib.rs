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

//! A CHIP-8 dynamic binary translator, backed by a reference
//! interpreter that defines the canonical semantics both engines must
//! agree on bit-for-bit.
//!
//! [`interp::step`] is the oracle: one call, one guest instruction,
//! no shortcuts. [`jit::Jit`] discovers basic blocks starting at a
//! guest `pc`, compiles them to host machine code the first time they
//! are reached, and re-invokes the compiled block directly on every
//! subsequent hit, falling back to the interpreter for single steps it
//! cannot safely translate (see `jit` module docs).

pub mod error;
pub mod font;
pub mod guest;
pub mod interp;
pub mod jit;

pub use error::{CoreError, CoreResult};
pub use guest::{GuestState, RandomSource};
pub use jit::Jit;
