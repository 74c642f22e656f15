//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::{BlockFlags, BlockId, RAPass};
use crate::codegen::{Error, RAResult};
use crate::utility::SaHashSet;
use log::{debug, trace};

impl RAPass {
    /// Builds the post-order view of the CFG with an iterative DFS from
    /// the entry block.
    ///
    /// A block's `pov_order` is assigned when the DFS exits it, so
    /// iterating the view backwards yields a reverse post-order. Only
    /// reachable blocks get numbered; back-edges found along the way bump
    /// the loop weight of every block in the loop they close.
    pub(super) fn build_views(&mut self) -> RAResult<()> {
        let entry = self.entry_block();

        let mut seen = SaHashSet::<BlockId>::default();
        let mut on_stack = SaHashSet::<BlockId>::default();
        let mut stack: Vec<(BlockId, usize)> = Vec::new();

        seen.insert(entry);
        on_stack.insert(entry);
        stack.push((entry, 0));
        self.blocks[entry].add_flags(BlockFlags::REACHABLE);

        while let Some(&(block, index)) = stack.last() {
            let succ = self.blocks[block].successors().get(index).copied();

            match succ {
                Some(succ) => {
                    stack.last_mut().unwrap().1 = index + 1;

                    if seen.insert(succ) {
                        self.blocks[succ].add_flags(BlockFlags::REACHABLE);
                        on_stack.insert(succ);
                        stack.push((succ, 0));
                    } else if on_stack.contains(&succ) {
                        // a back-edge closing a loop headed by `succ`
                        self.mark_loop(block, succ);
                    }
                }
                None => {
                    stack.pop();
                    on_stack.remove(&block);
                    self.blocks[block].set_pov_order(self.pov.len() as u32);
                    self.pov.push(block);
                }
            }
        }

        debug!(
            "POV: {} reachable of {} blocks",
            self.pov.len(),
            self.blocks.len()
        );

        Ok(())
    }

    /// Bumps the weight of every block in the natural loop closed by the
    /// back-edge `from -> header`: the header plus everything that reaches
    /// `from` backwards without crossing the header.
    fn mark_loop(&mut self, from: BlockId, header: BlockId) {
        let timestamp = self.next_timestamp();

        self.blocks[header].mark_visited(timestamp);
        self.blocks[header].bump_weight();

        let mut work = vec![from];

        while let Some(block) = work.pop() {
            if self.blocks[block].visited() == timestamp {
                continue;
            }

            self.blocks[block].mark_visited(timestamp);
            self.blocks[block].bump_weight();
            work.extend_from_slice(self.blocks[block].predecessors());
        }

        trace!("back-edge {from:?} -> {header:?} closed a loop");
    }

    /// Computes immediate dominators with the iterative data-flow scheme
    /// over the reverse post-order: `idom(b)` is the intersection of the
    /// already-computed idoms of `b`'s predecessors, where intersection
    /// walks the two idom chains toward the root comparing post-order
    /// numbers. The entry block is its own immediate dominator.
    pub(super) fn build_dominators(&mut self) -> RAResult<()> {
        let entry = self.entry_block();

        if self.pov.last() != Some(&entry) {
            // the entry must be the last block the DFS exits
            return Err(Error::InvalidState);
        }

        self.blocks[entry].set_idom(entry);

        let mut changed = true;
        let mut rounds = 0usize;

        while changed {
            changed = false;
            rounds += 1;

            for index in (0..self.pov.len()).rev() {
                let block = self.pov[index];

                if block == entry {
                    continue;
                }

                let mut new_idom: Option<BlockId> = None;

                for i in 0..self.blocks[block].predecessors().len() {
                    let pred = self.blocks[block].predecessors()[i];

                    if self.blocks[pred].idom().is_none() {
                        continue;
                    }

                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => self.intersect(current, pred),
                    });
                }

                if let Some(idom) = new_idom {
                    if self.blocks[block].idom() != Some(idom) {
                        self.blocks[block].set_idom(idom);
                        changed = true;
                    }
                }
            }
        }

        debug!("dominator tree converged after {rounds} rounds");

        Ok(())
    }

    fn intersect(&self, a: BlockId, b: BlockId) -> BlockId {
        let order = |block: BlockId| self.blocks[block].pov_order().unwrap();
        let (mut f1, mut f2) = (a, b);

        while f1 != f2 {
            while order(f1) < order(f2) {
                f1 = self.blocks[f1].idom().unwrap();
            }

            while order(f2) < order(f1) {
                f2 = self.blocks[f2].idom().unwrap();
            }
        }

        f1
    }

    /// Checks whether `a` dominates `b`. Non-strict: `true` when `a == b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        a == b || self.strictly_dominates(a, b)
    }

    /// Checks whether `a` strictly dominates `b`: every path from the
    /// entry to `b` passes through `a`, and `a != b`.
    ///
    /// Walks `b`'s idom chain toward the root, O(tree depth).
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        let entry = self.entry_block();

        if a == b {
            return false;
        }

        if a == entry {
            return self.blocks[b].idom().is_some();
        }

        let mut current = b;

        while current != entry {
            let idom = match self.blocks[current].idom() {
                Some(idom) => idom,
                None => return false,
            };

            if idom == a {
                return true;
            }

            current = idom;
        }

        false
    }

    /// The closest block dominating both `a` and `b`.
    pub fn nearest_common_dominator(&self, a: BlockId, b: BlockId) -> BlockId {
        self.intersect(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::testing::{branch_on, gp, ret, test_target, three, two};
    use crate::codegen::{Function, Inst};

    fn built(f: &Function) -> RAPass {
        let mut pass = RAPass::new(test_target());

        pass.build_cfg(f).unwrap();
        pass.build_views().unwrap();
        pass
    }

    fn diamond() -> Function {
        let mut f = Function::new("diamond");
        let v0 = gp(&mut f);
        let vc = gp(&mut f);
        let t = gp(&mut f);
        let u = gp(&mut f);

        f.set_args([(v0, 0), (vc, 1)]);

        let l_then = f.new_label();
        let l_join = f.new_label();

        branch_on(&mut f, vc, l_then);
        two(&mut f, "neg", t, v0);
        f.append_inst(Inst::jump("jmp", l_join));
        f.append_label(l_then);
        two(&mut f, "not", u, v0);
        f.append_label(l_join);
        ret(&mut f, v0);

        f
    }

    #[test]
    fn pov_covers_exactly_the_reachable_blocks() {
        let f = diamond();
        let pass = built(&f);

        assert_eq!(pass.reachable_block_count(), 4);

        // the entry exits the DFS last
        assert_eq!(pass.pov().last(), Some(&pass.entry_block()));

        for &block in pass.pov() {
            assert!(pass.block(block).has_flag(BlockFlags::REACHABLE));
            assert!(pass.block(block).pov_order().is_some());
        }
    }

    #[test]
    fn pov_is_deterministic() {
        let f = diamond();
        let a = built(&f);
        let b = built(&f);

        assert_eq!(a.pov(), b.pov());

        for &block in a.pov() {
            assert_eq!(a.block(block).pov_order(), b.block(block).pov_order());
        }
    }

    #[test]
    fn diamond_dominators() {
        let f = diamond();
        let mut pass = built(&f);

        pass.build_dominators().unwrap();

        let entry = pass.entry_block();
        let arms = pass.block(entry).successors().to_vec();
        let join = pass.block(arms[0]).successors()[0];

        assert_eq!(pass.block(entry).idom(), Some(entry));
        assert_eq!(pass.block(arms[0]).idom(), Some(entry));
        assert_eq!(pass.block(arms[1]).idom(), Some(entry));
        assert_eq!(pass.block(join).idom(), Some(entry));

        assert!(pass.dominates(entry, join));
        assert!(pass.strictly_dominates(entry, join));
        assert!(!pass.strictly_dominates(arms[0], join));
        assert!(!pass.strictly_dominates(join, join));
        assert_eq!(pass.nearest_common_dominator(arms[0], arms[1]), entry);
        assert_eq!(pass.nearest_common_dominator(join, arms[1]), entry);
        assert_eq!(pass.nearest_common_dominator(join, entry), entry);
    }

    #[test]
    fn back_edges_weight_the_loop() {
        let mut f = Function::new("loopy");
        let i = gp(&mut f);
        let lh = f.new_label();

        f.set_args([(i, 0)]);
        f.append_label(lh);
        three(&mut f, "add", i, i, i);
        branch_on(&mut f, i, lh);
        ret(&mut f, i);

        let pass = built(&f);
        let header = pass.entry_block();

        assert_eq!(pass.block(header).weight(), 1);

        // the exit block is outside the loop
        let exit = pass.block(header).consecutive().unwrap();

        assert_eq!(pass.block(exit).weight(), 0);
    }
}
