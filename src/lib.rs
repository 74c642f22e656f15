//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

#![deny(
    unreachable_pub,
    missing_docs,
    missing_abi,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

//! # Opal
//!
//! A register allocation pass for JIT compiler back-ends.
//!
//! The pass consumes a function represented as a linear stream of
//! instruction-like nodes referencing an unbounded set of virtual registers,
//! and transforms it into an equivalent stream whose operands only name
//! physical registers and stack slots of the target machine. Moves, loads,
//! spills and a prologue/epilogue are synthesized along the way.
//!
//! See [`codegen::RAPass`] for the entry point, and [`codegen::Function`]
//! for the node stream the pass operates on.

pub mod arena;
pub mod codegen;
pub mod utility;
