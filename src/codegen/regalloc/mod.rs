//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The register allocation pass.
//!
//! The pipeline run over one function:
//!
//! 1. the CFG is built over the node stream and every instruction gets its
//!    tied-register record,
//! 2. the post-order view and dominator tree are derived,
//! 3. liveness bitsets and per-work-register live spans are computed,
//! 4. the global allocator binpacks non-conflicting work registers onto
//!    physical registers,
//! 5. the local allocator walks the blocks in dominator order and
//!    completes the assignment, emitting moves, loads and spills,
//! 6. the stack frame is finalized, the prologue/epilogue inserted, and
//!    every operand rewritten to a physical register.
//!
//! [`RAPass::run_on_function`] drives all of it.

mod assignment;
mod block;
mod cfg;
mod global;
mod inst;
mod liveness;
mod local;
mod pass;
mod rewriter;
mod stack;
mod views;
mod workreg;

pub use assignment::{AssignLayout, RAAssignment};
pub use block::{BlockFlags, BlockId, RABlock};
pub use inst::{RAInst, RAInstBuilder, RAInstFlags, RAInstId, RegsStats, TiedFlags, TiedReg};
pub use pass::RAPass;
pub use stack::{SlotId, StackAllocator, StackSlot};
pub use workreg::{LiveSpan, WorkId, WorkReg, WorkRegFlags};
