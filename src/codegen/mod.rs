//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The code-generation surface of the crate: the node stream that functions
//! are represented as, the target description, and the register allocation
//! pass itself.
//!
//! Most users only care about three things here:
//!
//! 1. [`Function`], the linear stream of instruction-like nodes,
//! 2. [`TargetDesc`] + [`RAEmitter`], what the pass needs to know about the
//!    machine being targeted,
//! 3. [`RAPass`], the pass that rewrites a function in place so that every
//!    operand names a physical register.

mod node;
mod target;

pub mod regalloc;
pub mod testing;

pub use node::*;
pub use regalloc::{RAPass, WorkId};
pub use target::*;

use thiserror::Error;

/// Everything that can go wrong inside the register allocation pipeline.
///
/// Errors are surfaced to the caller verbatim: the first failure aborts the
/// function being compiled, nothing is retried or recovered locally.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// A pass-owned container could not grow any further.
    #[error("out of memory while growing pass-local storage")]
    NoHeapMemory,
    /// Two references to one virtual register inside a single instruction
    /// each demanded a distinct fixed output register.
    #[error("overlapping fixed register assignments in one instruction")]
    OverlappedRegs,
    /// An operand referenced a virtual register id that the function never
    /// declared.
    #[error("invalid virtual register id")]
    InvalidVirtId,
    /// The control-flow graph is malformed: a dangling block, a missing
    /// entry, or a liveness bit-vector size mismatch.
    #[error("invalid control-flow graph state")]
    InvalidState,
    /// The allocator could not satisfy register pressure under the selected
    /// strategy's spill budget.
    #[error("out of physical registers")]
    OutOfPhysRegs,
    /// An architecture-specific constraint was reported by an emitter hook.
    #[error("architecture constraint violated: {0}")]
    ArchConstraint(&'static str),
}

/// The result type used by every fallible operation in the pass.
pub type RAResult<T> = Result<T, Error>;
