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

//! Error kinds for the interpreter/JIT backend.
//!
//! Mirrors the three kinds of failure a CHIP-8 session can hit: a
//! ROM that cannot be loaded, an opcode neither engine understands,
//! and (optionally, recoverably) an exhausted executable buffer.

use std::path::PathBuf;

/// Maximum ROM size: `0x1000 - 0x200` bytes.
pub const MAX_ROM_LEN: usize = 0x0E00;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// The ROM file could not be read from disk.
    #[error("failed to read ROM at {path}: {source}")]
    RomRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ROM exceeds the `0x1000 - 0x200` byte window.
    #[error("ROM is {len} bytes, exceeds the {max} byte limit")]
    RomTooLarge { len: usize, max: usize },

    /// Neither the interpreter nor the translator recognized the
    /// opcode. Not recoverable: a well-formed CHIP-8 ROM never
    /// contains one.
    #[error("unknown opcode {opcode:#06x} at pc={pc:#05x}")]
    UnknownOpcode { opcode: u16, pc: u16 },

    /// The JIT's executable buffer ran out of room. Recoverable by
    /// flushing the translation cache and resetting the buffer.
    #[error("executable buffer exhausted after {blocks_compiled} compiled blocks")]
    BufferExhausted { blocks_compiled: usize },
}

pub type CoreResult<T> = Result<T, CoreError>;
