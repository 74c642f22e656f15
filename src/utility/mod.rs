//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Various utilities used in the rest of the crate that aren't specific
//! to register allocation in any way.

mod bitset;
mod hash;

pub use bitset::BitVector;
pub use hash::{SaHashMap, SaHashSet};
