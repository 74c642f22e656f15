//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! End-to-end allocation scenarios driven through the public API and the
//! synthetic test machine.

use opal::codegen::testing::{
    branch_on, gp, ret, test_call_clobbers, test_target, three, two, EmittedOp, TestMachine,
};
use opal::codegen::{
    Function, Inst, NodeKind, Operand, OperandKind, PhysReg, RAPass, RegGroup, RegRef,
};

/// After a successful run, no executable node may reference a virtual
/// register anymore.
fn assert_fully_physical(func: &Function) {
    for (_, node) in func.iter() {
        if let NodeKind::Inst(inst) = node.kind() {
            for op in inst.operands.iter() {
                assert!(
                    matches!(op.reg, RegRef::Phys(_)),
                    "operand {op:?} of '{}' still virtual",
                    inst.op
                );
            }
        }
    }
}

fn run(func: &mut Function) -> (RAPass, TestMachine) {
    let mut pass = RAPass::new(test_target());
    let mut machine = TestMachine::new();

    pass.run_on_function(func, &mut machine).unwrap();
    assert_fully_physical(func);

    (pass, machine)
}

#[test]
fn straight_line_needs_no_traffic() {
    let mut f = Function::new("straight");
    let a = gp(&mut f);
    let b = gp(&mut f);
    let c = gp(&mut f);

    f.set_args([(a, 0), (b, 1)]);
    three(&mut f, "add", c, a, b);
    ret(&mut f, c);

    let (pass, machine) = run(&mut f);

    assert_eq!(pass.block_count(), 1);
    assert_eq!(pass.reachable_block_count(), 1);
    assert_eq!(machine.traffic(), (0, 0, 0, 0));

    // the add reads the two argument registers
    let add = f
        .iter()
        .find_map(|(_, n)| n.kind().as_inst().filter(|i| i.op == "add"))
        .unwrap();

    assert_eq!(add.operands[1].reg, RegRef::Phys(PhysReg::gp(0)));
    assert_eq!(add.operands[2].reg, RegRef::Phys(PhysReg::gp(1)));
}

#[test]
fn diamond_shares_the_register_across_both_arms() {
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

    let (pass, machine) = run(&mut f);
    let (_, loads, saves, _) = machine.traffic();

    assert_eq!(pass.reachable_block_count(), 4);

    // the value stays in its register over both arms, nothing touches
    // memory
    assert_eq!(loads, 0);
    assert_eq!(saves, 0);
}

#[test]
fn call_in_loop_spills_once_and_reloads_once() {
    let mut f = Function::new("loop_call");
    let i = gp(&mut f);

    f.set_args([(i, 0)]);

    let lh = f.new_label();

    f.append_label(lh);
    f.append_inst(Inst::call("call", [], test_call_clobbers()));
    three(&mut f, "add", i, i, i);
    branch_on(&mut f, i, lh);
    ret(&mut f, i);

    let (_, machine) = run(&mut f);
    let (_, loads, saves, _) = machine.traffic();

    // the induction variable either lives in a callee-saved register or
    // is saved before the call and reloaded after it; the allocator must
    // not do both
    if saves == 0 {
        assert_eq!(loads, 0);
    } else {
        assert_eq!(saves, 1);
        assert_eq!(loads, 1);
    }
}

#[test]
fn pressure_beyond_the_register_file_spills_exactly_once() {
    let mut f = Function::new("pressure");
    let v0 = gp(&mut f);
    let v1 = gp(&mut f);
    let v2 = gp(&mut f);
    let v3 = gp(&mut f);
    let v4 = gp(&mut f);
    let s1 = gp(&mut f);
    let s2 = gp(&mut f);
    let s3 = gp(&mut f);
    let s4 = gp(&mut f);

    f.set_args([(v0, 0)]);

    // five simultaneously live values on a four register machine
    two(&mut f, "cp", v1, v0);
    two(&mut f, "cp", v2, v0);
    two(&mut f, "cp", v3, v0);
    two(&mut f, "cp", v4, v0);
    three(&mut f, "add", s1, v0, v1);
    three(&mut f, "add", s2, s1, v2);
    three(&mut f, "add", s3, s2, v3);
    three(&mut f, "add", s4, s3, v4);
    ret(&mut f, s4);

    let (pass, machine) = run(&mut f);
    let (_, loads, saves, _) = machine.traffic();

    assert_eq!(saves, 1);
    assert_eq!(loads, 1);
    assert_eq!(pass.global_max_live_count(RegGroup::Gp), 5);

    // a frame now exists for the spill slot
    let frame = pass.frame().unwrap();

    assert!(frame.local_size >= 8);
    assert!(frame.frame_size >= frame.local_size);
}

#[test]
fn fixed_use_with_occupied_register_swaps() {
    let mut f = Function::new("fixed");
    let va = gp(&mut f);
    let vb = gp(&mut f);
    let d = gp(&mut f);

    f.set_args([(va, 0), (vb, 1)]);

    // vb must sit in r0 here, but r0 holds va; both stay live afterwards
    f.append_inst(Inst::new("pin", [Operand::read(vb).fixed_to(0)]));
    three(&mut f, "add", d, va, vb);
    ret(&mut f, d);

    let (_, machine) = run(&mut f);
    let (_, loads, saves, swaps) = machine.traffic();

    assert_eq!(swaps, 1);
    assert_eq!(loads, 0);
    assert_eq!(saves, 0);

    // the pinned operand got its register
    let pin = f
        .iter()
        .find_map(|(_, n)| n.kind().as_inst().filter(|i| i.op == "pin"))
        .unwrap();

    assert_eq!(pin.operands[0].reg, RegRef::Phys(PhysReg::gp(0)));
}

#[test]
fn unreachable_code_is_dropped_before_allocation() {
    let mut f = Function::new("dead");
    let v = gp(&mut f);
    let d = gp(&mut f);

    f.set_args([(v, 0)]);
    ret(&mut f, v);

    // unreachable: no label, directly after a return
    two(&mut f, "neg", d, v);
    ret(&mut f, d);

    let (pass, _) = run(&mut f);

    assert_eq!(pass.block_count(), 2);
    assert_eq!(pass.reachable_block_count(), 1);

    // the dead instructions were unlinked, only one ret survives
    let rets = f
        .iter()
        .filter(|(_, n)| matches!(n.kind(), NodeKind::Inst(i) if i.op == "ret"))
        .count();

    assert_eq!(rets, 1);
}

#[test]
fn already_physical_function_is_a_no_op() {
    let mut f = Function::new("physical");

    f.append_inst(Inst::new(
        "mov",
        [
            Operand::phys(PhysReg::gp(0), OperandKind::Def),
            Operand::phys(PhysReg::gp(1), OperandKind::Use),
        ],
    ));
    f.append_inst(Inst::ret("ret", [Operand::phys(PhysReg::gp(0), OperandKind::Use)]));

    let (_, machine) = run(&mut f);

    assert_eq!(machine.traffic(), (0, 0, 0, 0));
}

#[test]
fn allocating_the_allocated_output_changes_nothing() {
    let mut f = Function::new("twice");
    let a = gp(&mut f);
    let b = gp(&mut f);
    let c = gp(&mut f);

    f.set_args([(a, 0), (b, 1)]);
    three(&mut f, "add", c, a, b);
    ret(&mut f, c);

    run(&mut f);

    // the output of the first run is a fully physical function; running a
    // fresh pass over it must emit no traffic at all
    let mut second = RAPass::new(test_target());
    let mut machine = TestMachine::new();

    second.run_on_function(&mut f, &mut machine).unwrap();

    let traffic: Vec<&EmittedOp> = machine
        .ops
        .iter()
        .filter(|op| !matches!(op, EmittedOp::Prolog | EmittedOp::Epilog))
        .collect();

    assert!(traffic.is_empty(), "second run emitted {traffic:?}");
}

#[test]
fn prolog_and_epilogs_are_placed() {
    let mut f = Function::new("frames");
    let v = gp(&mut f);
    let l = f.new_label();

    f.set_args([(v, 0)]);
    branch_on(&mut f, v, l);
    ret(&mut f, v);
    f.append_label(l);
    ret(&mut f, v);

    let (_, machine) = run(&mut f);

    let prologs = machine
        .ops
        .iter()
        .filter(|op| matches!(op, EmittedOp::Prolog))
        .count();
    let epilogs = machine
        .ops
        .iter()
        .filter(|op| matches!(op, EmittedOp::Epilog))
        .count();

    assert_eq!(prologs, 1);
    assert_eq!(epilogs, 2);

    // the prologue leads the stream
    let first = f.iter().next().unwrap().1;

    assert!(matches!(first.kind(), NodeKind::Inst(i) if i.op == "prolog"));
}

#[test]
fn callee_saved_preservation_follows_clobbers() {
    let mut f = Function::new("saves");
    let a = gp(&mut f);
    let r = gp(&mut f);

    f.set_args([(a, 0)]);
    f.append_inst(Inst::call("call", [], test_call_clobbers()));
    two(&mut f, "neg", r, a);
    ret(&mut f, r);

    let (pass, _) = run(&mut f);
    let frame = pass.frame().unwrap();

    // whatever callee-saved registers were written must be in the
    // preservation set, and nothing else
    let saved = frame.saved_regs[RegGroup::Gp];
    let expected = pass.clobbered_regs(RegGroup::Gp) & test_target().callee_saved[RegGroup::Gp];

    assert_eq!(saved, expected);

    // `a` survives the call, so some callee-saved register was written
    // and must now be preserved
    assert!(!saved.is_empty());
}

#[test]
fn edge_symmetry_holds_after_allocation() {
    use opal::arena::ArenaKey;
    use opal::codegen::regalloc::BlockId;

    let mut f = Function::new("sym");
    let v0 = gp(&mut f);
    let vc = gp(&mut f);
    let t = gp(&mut f);

    f.set_args([(v0, 0), (vc, 1)]);

    let l_then = f.new_label();
    let l_join = f.new_label();

    branch_on(&mut f, vc, l_then);
    two(&mut f, "neg", t, v0);
    f.append_inst(Inst::jump("jmp", l_join));
    f.append_label(l_then);
    two(&mut f, "not", t, v0);
    f.append_label(l_join);
    ret(&mut f, v0);

    let (pass, _) = run(&mut f);

    for i in 0..pass.block_count() {
        let id = BlockId::key_new(i);
        let block = pass.block(id);

        for &succ in block.successors() {
            assert!(pass.block(succ).predecessors().contains(&id));
        }

        for &pred in block.predecessors() {
            assert!(pass.block(pred).successors().contains(&id));
        }
    }
}
