//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaKey;
use crate::codegen::regalloc::{BlockId, LiveSpan, RAInstId, RAPass, TiedFlags, TiedReg, WorkId};
use crate::codegen::{Function, PerGroup, RAResult, RegGroup};
use crate::utility::BitVector;
use log::{debug, trace};
use smallvec::SmallVec;

impl RAPass {
    /// Computes per-block `gen`/`kill`/`in`/`out` over the work registers,
    /// then derives each work register's live spans, stamps last-use flags
    /// onto the tied records, and collects live-count statistics.
    pub(super) fn build_liveness(&mut self, func: &Function) -> RAResult<()> {
        let work_count = self.work_regs.len();
        let pov: Vec<BlockId> = self.pov.clone();

        for &block in pov.iter() {
            self.blocks[block].resize_live_sets(work_count);
        }

        self.build_gen_kill(func, &pov);
        self.solve_in_out(&pov);
        self.build_spans(func, &pov);

        for (_, reg) in self.work_regs.iter_mut() {
            reg.finish_spans();
        }

        for &block in pov.iter() {
            let max = self.blocks[block].max_live_count();

            for group in RegGroup::ALL {
                self.global_max_live[group] = self.global_max_live[group].max(max[group]);
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            self.dump_liveness(&pov);
        }

        debug!(
            "liveness over {} work regs converged, global max live {:?}",
            work_count, self.global_max_live
        );

        Ok(())
    }

    /// Derives `gen` (upward-exposed uses) and `kill` (definitions) from
    /// the tied records: a use joins `gen` only when the register was not
    /// killed earlier in the block, a def joins `kill`.
    fn build_gen_kill(&mut self, func: &Function, pov: &[BlockId]) {
        for &block in pov.iter() {
            let insts = self.block_insts(func, block);

            for ri in insts {
                // tied reads happen before tied writes within one record
                for i in 0..self.insts[ri].tied_all().len() {
                    let tied = self.insts[ri].tied_all()[i];
                    let index = tied.work.key_index();
                    let (_, _, gen, kill) = self.blocks[block].live_sets_mut();

                    if tied.is_use() && !kill.get(index) {
                        gen.set(index);
                    }

                    if tied.is_out() {
                        kill.set(index);
                    }
                }
            }
        }
    }

    /// Iterates the backward data-flow equations over the post-order until
    /// no bit changes:
    ///
    /// ```text
    /// out[b] = ⋃ in[s] for s ∈ successors(b)
    /// in[b]  = gen[b] ∪ (out[b] \ kill[b])
    /// ```
    fn solve_in_out(&mut self, pov: &[BlockId]) {
        let work_count = self.work_regs.len();
        let mut scratch = BitVector::with_len(work_count);
        let mut changed = true;
        let mut rounds = 0usize;

        while changed {
            changed = false;
            rounds += 1;

            for &block in pov.iter() {
                scratch.clear_all();

                for i in 0..self.blocks[block].successors().len() {
                    let succ = self.blocks[block].successors()[i];

                    // successors always have sized sets: unreachable ones
                    // were removed before liveness runs
                    scratch.union_with(self.blocks[succ].live_in());
                }

                let (live_in, live_out, gen, kill) = self.blocks[block].live_sets_mut();

                if *live_out != scratch {
                    live_out.copy_from(&scratch);
                    changed = true;
                }

                scratch.difference_with(kill);
                scratch.union_with(gen);

                if *live_in != scratch {
                    live_in.copy_from(&scratch);
                    changed = true;
                }
            }
        }

        trace!("liveness fixed point after {rounds} rounds");
    }

    /// Walks each block backward from its `out` set, closing a live span
    /// whenever a definition is crossed and opening one at each latest
    /// use. Also stamps [`TiedFlags::LAST`] and snapshots live counts.
    fn build_spans(&mut self, func: &Function, pov: &[BlockId]) {
        let work_count = self.work_regs.len();
        let mut open_end = vec![u32::MAX; work_count];

        for &block in pov.iter() {
            let insts = self.block_insts(func, block);
            let weight = self.blocks[block].weight();
            let first_pos = self.blocks[block].first_position();
            let end_pos = self.blocks[block].end_position();

            let mut live = self.blocks[block].live_out().clone();
            let mut counts = PerGroup::<u32>::default();

            for index in live.iter_ones() {
                open_end[index] = end_pos;
            }

            for index in live.iter_ones() {
                counts[self.work_regs[WorkId::key_new(index)].group()] += 1;
            }

            for &ri in insts.iter().rev() {
                let pos = self.insts[ri].position;
                let mut defs = PerGroup::<u32>::default();

                let mut tieds: SmallVec<[TiedReg; 8]> =
                    self.insts[ri].tied_all().iter().copied().collect();

                // defs first: scanning backward, the write is the latest
                // event at this position
                for tied in tieds.iter_mut() {
                    if !tied.is_out() {
                        continue;
                    }

                    let index = tied.work.key_index();
                    let group = self.work_regs[tied.work].group();

                    if !tied.is_use() {
                        defs[group] += 1;
                    }

                    if live.get(index) {
                        live.clear(index);
                        counts[group] -= 1;

                        let end = open_end[index];
                        open_end[index] = u32::MAX;

                        self.work_regs[tied.work].push_span(LiveSpan::new(pos, end), weight);
                    } else {
                        // a def whose value is never read still occupies
                        // the register at its own position
                        self.work_regs[tied.work]
                            .push_span(LiveSpan::new(pos, pos + 1), weight);
                        tied.flags |= TiedFlags::LAST;
                    }
                }

                for tied in tieds.iter_mut() {
                    if !tied.is_use() {
                        continue;
                    }

                    let index = tied.work.key_index();
                    let group = self.work_regs[tied.work].group();

                    if !live.get(index) {
                        live.set(index);
                        counts[group] += 1;
                        open_end[index] = pos + 1;

                        if !tied.is_out() {
                            // nothing after this position reads the value
                            tied.flags |= TiedFlags::LAST;
                        }
                    }
                }

                // every value whose span covers this position: the ones
                // live ahead of it plus the pure definitions made here
                let mut snapshot = counts;

                for group in RegGroup::ALL {
                    snapshot[group] += defs[group];
                }

                {
                    let inst = &mut self.insts[ri];

                    inst.live_count = snapshot;

                    for (dst, src) in inst.tied_all_mut().iter_mut().zip(tieds.iter()) {
                        dst.flags = src.flags;
                    }
                }

                self.blocks[block].observe_live_count(snapshot);
            }

            // everything still live is live-in, its span starts where the
            // block does
            for index in live.iter_ones() {
                let end = open_end[index];

                open_end[index] = u32::MAX;

                if end > first_pos {
                    self.work_regs[WorkId::key_new(index)]
                        .push_span(LiveSpan::new(first_pos, end), weight);
                }
            }
        }
    }

    /// The instruction records of a block, in stream order.
    pub(super) fn block_insts(&self, func: &Function, block: BlockId) -> SmallVec<[RAInstId; 16]> {
        let mut out = SmallVec::new();

        let first = match self.blocks[block].first() {
            Some(first) => first,
            None => return out,
        };
        let last = self.blocks[block].last().unwrap();

        let mut cursor = Some(first);

        while let Some(node) = cursor {
            if let Some(&ri) = self.node_data.get(node) {
                out.push(ri);
            }

            cursor = if node == last {
                None
            } else {
                func.node(node).next()
            };
        }

        out
    }

    fn dump_liveness(&self, pov: &[BlockId]) {
        for &block in pov.iter() {
            let b = &self.blocks[block];

            trace!(
                "{block:?}: in={:?} out={:?} gen={:?} kill={:?}",
                b.live_in(),
                b.live_out(),
                b.gen(),
                b.kill()
            );
        }

        for (id, reg) in self.work_regs.iter() {
            trace!("{id:?}: spans={:?} width={}", reg.spans(), reg.width());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::testing::{branch_on, gp, ret, test_target, three, two};
    use crate::codegen::Inst;

    fn analyzed(f: &mut Function) -> RAPass {
        let mut pass = RAPass::new(test_target());

        pass.build_cfg(f).unwrap();
        pass.build_views().unwrap();
        pass.remove_unreachable_code(f).unwrap();
        pass.build_dominators().unwrap();
        pass.build_liveness(f).unwrap();
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
    fn fixed_point_equations_hold() {
        let mut f = diamond();
        let pass = analyzed(&mut f);

        for &block in pass.pov() {
            let b = pass.block(block);

            // in = gen ∪ (out \ kill)
            let mut expect_in = b.live_out().clone();

            expect_in.difference_with(b.kill());
            expect_in.union_with(b.gen());
            assert_eq!(&expect_in, b.live_in());

            // out = ∪ successor in
            let mut expect_out = BitVector::with_len(pass.work_reg_count());

            for &succ in b.successors() {
                expect_out.union_with(pass.block(succ).live_in());
            }

            assert_eq!(&expect_out, b.live_out());
        }
    }

    #[test]
    fn recomputation_is_identical() {
        let mut f1 = diamond();
        let mut f2 = diamond();
        let a = analyzed(&mut f1);
        let b = analyzed(&mut f2);

        for (&x, &y) in a.pov().iter().zip(b.pov().iter()) {
            assert_eq!(a.block(x).live_in(), b.block(y).live_in());
            assert_eq!(a.block(x).live_out(), b.block(y).live_out());
        }
    }

    #[test]
    fn spans_are_sorted_and_disjoint() {
        let mut f = diamond();
        let pass = analyzed(&mut f);

        for i in 0..pass.work_reg_count() {
            let spans = pass.work_reg(WorkId::key_new(i)).spans();

            for pair in spans.windows(2) {
                assert!(pair[0].end <= pair[1].start, "{pair:?} out of order");
            }
        }
    }

    #[test]
    fn straight_line_spans_cross_their_uses() {
        let mut f = Function::new("straight");
        let a = gp(&mut f);
        let b = gp(&mut f);
        let c = gp(&mut f);

        f.set_args([(a, 0), (b, 1)]);

        // position 0: c = add a, b; position 2: ret c
        three(&mut f, "add", c, a, b);
        ret(&mut f, c);

        let pass = analyzed(&mut f);

        // work ids follow operand order: the defined output first, then
        // the two inputs. The output lives from the add into the ret, the
        // inputs from block entry into the add.
        assert_eq!(pass.work_reg(WorkId::key_new(0)).spans(), &[LiveSpan::new(0, 3)]);
        assert_eq!(pass.work_reg(WorkId::key_new(1)).spans(), &[LiveSpan::new(0, 1)]);
        assert_eq!(pass.work_reg(WorkId::key_new(2)).spans(), &[LiveSpan::new(0, 1)]);

        let entry = pass.entry_block();

        assert_eq!(pass.block(entry).max_live_count()[RegGroup::Gp], 3);
        assert_eq!(pass.global_max_live_count(RegGroup::Gp), 3);
    }

    #[test]
    fn loop_variable_is_live_around_the_back_edge() {
        let mut f = Function::new("loopy");
        let i = gp(&mut f);
        let lh = f.new_label();

        f.set_args([(i, 0)]);
        f.append_label(lh);
        three(&mut f, "add", i, i, i);
        branch_on(&mut f, i, lh);
        ret(&mut f, i);

        let pass = analyzed(&mut f);
        let header = pass.entry_block();

        // i is live into and out of the loop header
        assert!(pass.block(header).live_in().get(0));
        assert!(pass.block(header).live_out().get(0));
    }
}
