//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaMap;
use crate::codegen::regalloc::SlotId;
use crate::codegen::{PerGroup, PhysReg, RegGroup, RegMask};
use crate::dense_arena_key;
use smallvec::SmallVec;

dense_arena_key! {
    /// A reference to a single node in a function's node stream.
    pub struct NodeId;

    /// A reference to a label that nodes can jump to.
    pub struct LabelId;

    /// A reference to a virtual register declared by a function.
    pub struct VirtId;
}

/// A virtual register as declared by the instruction stream producer.
///
/// Virtual registers are unbounded in number; the whole point of the pass
/// is to map them down onto the target's physical registers.
#[derive(Copy, Clone, Debug)]
pub struct VirtReg {
    /// The register group this value allocates from.
    pub group: RegGroup,
    /// The size of the value, in bytes. Used when a stack slot has to be
    /// created for it.
    pub size: u32,
    /// The required alignment of the value's stack home.
    pub align: u32,
}

/// Either a virtual or a physical register named by an operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegRef {
    /// A virtual register, to be replaced by the pass.
    Virt(VirtId),
    /// A physical register, pre-colored by the producer.
    Phys(PhysReg),
}

impl RegRef {
    /// Returns the virtual register, if this is one.
    #[inline]
    pub fn as_virt(self) -> Option<VirtId> {
        match self {
            RegRef::Virt(v) => Some(v),
            RegRef::Phys(_) => None,
        }
    }

    /// Returns the physical register, if this is one.
    #[inline]
    pub fn as_phys(self) -> Option<PhysReg> {
        match self {
            RegRef::Phys(p) => Some(p),
            RegRef::Virt(_) => None,
        }
    }
}

/// What an operand does to the register it names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// The register is read.
    Use,
    /// The register is written.
    Def,
    /// The register is read, then written.
    UseDef,
}

impl OperandKind {
    /// Checks whether the operand reads its register.
    #[inline]
    pub fn is_use(self) -> bool {
        !matches!(self, OperandKind::Def)
    }

    /// Checks whether the operand writes its register.
    #[inline]
    pub fn is_def(self) -> bool {
        !matches!(self, OperandKind::Use)
    }
}

/// One register reference inside an instruction.
///
/// Instructions are otherwise opaque to the pass; their entire register
/// behavior is described by their operand list (plus the clobber masks for
/// calls). An operand can optionally demand a specific physical register id,
/// which is how calling conventions are expressed.
#[derive(Copy, Clone, Debug)]
pub struct Operand {
    /// The register being referenced.
    pub reg: RegRef,
    /// Whether the reference reads, writes, or both.
    pub kind: OperandKind,
    /// A fixed physical register id (within the register's group) that this
    /// reference must occupy, if constrained.
    pub fixed: Option<u8>,
}

impl Operand {
    /// An unconstrained read of a virtual register.
    pub fn read(virt: VirtId) -> Self {
        Self {
            reg: RegRef::Virt(virt),
            kind: OperandKind::Use,
            fixed: None,
        }
    }

    /// An unconstrained write of a virtual register.
    pub fn write(virt: VirtId) -> Self {
        Self {
            reg: RegRef::Virt(virt),
            kind: OperandKind::Def,
            fixed: None,
        }
    }

    /// An unconstrained read-modify-write of a virtual register.
    pub fn read_write(virt: VirtId) -> Self {
        Self {
            reg: RegRef::Virt(virt),
            kind: OperandKind::UseDef,
            fixed: None,
        }
    }

    /// A reference to a physical register (pre-colored by the producer).
    pub fn phys(reg: PhysReg, kind: OperandKind) -> Self {
        Self {
            reg: RegRef::Phys(reg),
            kind,
            fixed: None,
        }
    }

    /// Constrains this operand to a fixed physical register id.
    pub fn fixed_to(mut self, id: u8) -> Self {
        self.fixed = Some(id);
        self
    }
}

/// The effect an instruction has on control flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstControl {
    /// Control falls through to the next instruction.
    None,
    /// Control unconditionally transfers to the label.
    Jump(LabelId),
    /// Control either transfers to the label or falls through.
    Branch(LabelId),
    /// Control leaves the function.
    Ret,
}

impl InstControl {
    /// Checks whether the instruction ends a basic block.
    #[inline]
    pub fn is_terminator(self) -> bool {
        !matches!(self, InstControl::None)
    }
}

/// An instruction-like node in the stream.
///
/// The mnemonic is opaque to the pass, it exists for logging and for the
/// encoder downstream. Everything the allocator needs to know is in
/// `control`, `operands` and `clobbers`.
#[derive(Clone, Debug)]
pub struct Inst {
    /// The mnemonic, for human consumption only.
    pub op: &'static str,
    /// The instruction's effect on control flow.
    pub control: InstControl,
    /// Whether this instruction is a function call.
    pub is_call: bool,
    /// Registers whose values this instruction destroys without them being
    /// operands, per group. Typically the caller-saved set at a call.
    pub clobbers: PerGroup<RegMask>,
    /// The register references of the instruction. Rewrite masks index
    /// into this list.
    pub operands: SmallVec<[Operand; 4]>,
    /// The stack slot referenced by allocator-synthesized loads and saves.
    pub slot: Option<SlotId>,
}

impl Inst {
    /// Creates a plain instruction with the given operands.
    pub fn new(op: &'static str, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            op,
            control: InstControl::None,
            is_call: false,
            clobbers: PerGroup::default(),
            operands: SmallVec::from_iter(operands),
            slot: None,
        }
    }

    /// Creates an unconditional jump to `target`.
    pub fn jump(op: &'static str, target: LabelId) -> Self {
        let mut inst = Self::new(op, []);
        inst.control = InstControl::Jump(target);
        inst
    }

    /// Creates a conditional branch to `target` that otherwise falls
    /// through, with the given operands (e.g. a compared register).
    pub fn branch(
        op: &'static str,
        target: LabelId,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Self {
        let mut inst = Self::new(op, operands);
        inst.control = InstControl::Branch(target);
        inst
    }

    /// Creates a return instruction with the given operands.
    pub fn ret(op: &'static str, operands: impl IntoIterator<Item = Operand>) -> Self {
        let mut inst = Self::new(op, operands);
        inst.control = InstControl::Ret;
        inst
    }

    /// Creates a call instruction with the given operands and clobbered
    /// register masks.
    pub fn call(
        op: &'static str,
        operands: impl IntoIterator<Item = Operand>,
        clobbers: PerGroup<RegMask>,
    ) -> Self {
        let mut inst = Self::new(op, operands);
        inst.is_call = true;
        inst.clobbers = clobbers;
        inst
    }
}

/// The kinds of node that can appear in the stream.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// A position a jump can target.
    Label(LabelId),
    /// An executable instruction.
    Inst(Inst),
    /// An alignment directive. Decorative as far as the pass cares.
    Align(u32),
    /// A comment. Decorative.
    Comment(String),
}

impl NodeKind {
    /// Checks whether the node is neither executable code nor data, i.e.
    /// whether control flow analysis can skip over it.
    #[inline]
    pub fn is_decorative(&self) -> bool {
        matches!(self, NodeKind::Align(_) | NodeKind::Comment(_))
    }

    /// Returns the instruction, if this node is one.
    #[inline]
    pub fn as_inst(&self) -> Option<&Inst> {
        match self {
            NodeKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    /// Returns the instruction mutably, if this node is one.
    #[inline]
    pub fn as_inst_mut(&mut self) -> Option<&mut Inst> {
        match self {
            NodeKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }
}

/// A single node in the doubly linked stream.
#[derive(Clone, Debug)]
pub struct Node {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    kind: NodeKind,
}

impl Node {
    /// The node before this one, if any.
    #[inline]
    pub fn prev(&self) -> Option<NodeId> {
        self.prev
    }

    /// The node after this one, if any.
    #[inline]
    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    /// What this node is.
    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Mutable access to what this node is.
    #[inline]
    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }
}

/// A function: a linear, doubly linked stream of nodes, the virtual
/// registers it references, and the entry mapping of arguments onto
/// physical registers.
///
/// Node storage is arena-keyed; unlinking a node detaches it from the
/// stream but never invalidates other [`NodeId`]s.
pub struct Function {
    name: String,
    nodes: ArenaMap<NodeId, Node>,
    first: Option<NodeId>,
    last: Option<NodeId>,
    labels: ArenaMap<LabelId, Option<NodeId>>,
    virt_regs: ArenaMap<VirtId, VirtReg>,
    args: SmallVec<[(VirtId, u8); 8]>,
}

impl Function {
    /// Creates an empty function.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: ArenaMap::new(),
            first: None,
            last: None,
            labels: ArenaMap::new(),
            virt_regs: ArenaMap::new(),
            args: SmallVec::new(),
        }
    }

    /// The name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a new virtual register.
    pub fn new_virt(&mut self, group: RegGroup, size: u32, align: u32) -> VirtId {
        self.virt_regs.insert(VirtReg { group, size, align })
    }

    /// Looks up a virtual register declaration.
    pub fn virt_reg(&self, virt: VirtId) -> Option<&VirtReg> {
        self.virt_regs.get(virt)
    }

    /// The number of virtual registers declared.
    pub fn virt_count(&self) -> usize {
        self.virt_regs.len()
    }

    /// Creates a new label. The label exists but is placed nowhere until a
    /// label node for it is appended.
    pub fn new_label(&mut self) -> LabelId {
        self.labels.insert(None)
    }

    /// The node at which `label` was placed, if it was.
    pub fn label_node(&self, label: LabelId) -> Option<NodeId> {
        self.labels.get(label).copied().flatten()
    }

    /// Declares the calling-convention argument mapping: each argument
    /// virtual register and the physical register id (within its group) it
    /// occupies on entry.
    pub fn set_args(&mut self, args: impl IntoIterator<Item = (VirtId, u8)>) {
        self.args = SmallVec::from_iter(args);
    }

    /// The calling-convention argument mapping.
    pub fn args(&self) -> &[(VirtId, u8)] {
        &self.args
    }

    /// The first node of the stream.
    #[inline]
    pub fn first(&self) -> Option<NodeId> {
        self.first
    }

    /// The last node of the stream.
    #[inline]
    pub fn last(&self) -> Option<NodeId> {
        self.last
    }

    /// Reads a node.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Mutable access to a node.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Appends a node at the end of the stream.
    pub fn append(&mut self, kind: NodeKind) -> NodeId {
        self.note_label_placement(&kind);

        let id = self.nodes.insert(Node {
            prev: self.last,
            next: None,
            kind,
        });

        match self.last {
            Some(last) => self.nodes[last].next = Some(id),
            None => self.first = Some(id),
        }

        self.last = Some(id);
        id
    }

    /// Appends an instruction at the end of the stream.
    pub fn append_inst(&mut self, inst: Inst) -> NodeId {
        self.append(NodeKind::Inst(inst))
    }

    /// Places `label` by appending its label node.
    pub fn append_label(&mut self, label: LabelId) -> NodeId {
        debug_assert!(self.labels[label].is_none(), "label placed twice");

        self.append(NodeKind::Label(label))
    }

    /// Inserts a node immediately before `at`.
    pub fn insert_before(&mut self, at: NodeId, kind: NodeKind) -> NodeId {
        self.note_label_placement(&kind);

        let prev = self.nodes[at].prev;
        let id = self.nodes.insert(Node {
            prev,
            next: Some(at),
            kind,
        });

        self.nodes[at].prev = Some(id);

        match prev {
            Some(prev) => self.nodes[prev].next = Some(id),
            None => self.first = Some(id),
        }

        id
    }

    /// Inserts a node immediately after `at`.
    pub fn insert_after(&mut self, at: NodeId, kind: NodeKind) -> NodeId {
        self.note_label_placement(&kind);

        let next = self.nodes[at].next;
        let id = self.nodes.insert(Node {
            prev: Some(at),
            next,
            kind,
        });

        self.nodes[at].next = Some(id);

        match next {
            Some(next) => self.nodes[next].prev = Some(id),
            None => self.last = Some(id),
        }

        id
    }

    /// Detaches the inclusive range `first..=last` from the stream. The
    /// nodes stay in the arena but are no longer reachable by walking
    /// the links.
    pub fn unlink_range(&mut self, first: NodeId, last: NodeId) {
        let before = self.nodes[first].prev;
        let after = self.nodes[last].next;

        match before {
            Some(before) => self.nodes[before].next = after,
            None => self.first = after,
        }

        match after {
            Some(after) => self.nodes[after].prev = before,
            None => self.last = before,
        }

        self.nodes[first].prev = None;
        self.nodes[last].next = None;
    }

    /// Iterates over the stream from the first node to the last.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        let mut cursor = self.first;

        std::iter::from_fn(move || {
            let id = cursor?;
            let node = &self.nodes[id];

            cursor = node.next;
            Some((id, node))
        })
    }

    fn note_label_placement(&mut self, kind: &NodeKind) {
        if let NodeKind::Label(label) = kind {
            self.labels[*label] = Some(self.nodes.next_key());
        }
    }
}

/// The insertion point handed to emitter hooks.
#[derive(Copy, Clone, Debug)]
pub enum InsertPoint {
    /// New nodes go immediately before the given node.
    Before(NodeId),
    /// New nodes go at the end of the stream.
    AtEnd,
}

/// A cursor into a function's node stream that emitter hooks splice
/// synthesized nodes through.
pub struct EmitContext<'f> {
    func: &'f mut Function,
    at: InsertPoint,
}

impl<'f> EmitContext<'f> {
    /// Creates a context inserting at the given point.
    pub fn new(func: &'f mut Function, at: InsertPoint) -> Self {
        Self { func, at }
    }

    /// Splices a node at the cursor. Successive insertions keep their
    /// relative order.
    pub fn insert(&mut self, kind: NodeKind) -> NodeId {
        match self.at {
            InsertPoint::Before(at) => self.func.insert_before(at, kind),
            InsertPoint::AtEnd => self.func.append(kind),
        }
    }

    /// Splices an instruction at the cursor.
    pub fn insert_inst(&mut self, inst: Inst) -> NodeId {
        self.insert(NodeKind::Inst(inst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_links_nodes() {
        let mut f = Function::new("f");
        let a = f.append(NodeKind::Comment("a".into()));
        let b = f.append(NodeKind::Align(16));

        assert_eq!(f.first(), Some(a));
        assert_eq!(f.last(), Some(b));
        assert_eq!(f.node(a).next(), Some(b));
        assert_eq!(f.node(b).prev(), Some(a));
    }

    #[test]
    fn insert_before_first_updates_head() {
        let mut f = Function::new("f");
        let a = f.append(NodeKind::Align(4));
        let b = f.insert_before(a, NodeKind::Align(8));

        assert_eq!(f.first(), Some(b));
        assert_eq!(f.node(a).prev(), Some(b));
    }

    #[test]
    fn unlink_range_detaches() {
        let mut f = Function::new("f");
        let a = f.append(NodeKind::Align(1));
        let b = f.append(NodeKind::Align(2));
        let c = f.append(NodeKind::Align(4));
        let d = f.append(NodeKind::Align(8));

        f.unlink_range(b, c);

        let order: Vec<NodeId> = f.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, d]);
    }

    #[test]
    fn labels_resolve_to_their_node() {
        let mut f = Function::new("f");
        let l = f.new_label();

        assert_eq!(f.label_node(l), None);

        let node = f.append_label(l);
        assert_eq!(f.label_node(l), Some(node));
    }
}
