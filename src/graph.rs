/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The IR consumed and decorated by the register allocator.
//!
//! Nodes live in a single arena indexed by [`NodeId`]; blocks hold ordered id
//! lists, so inserting gap moves never invalidates a node reference. Ids are
//! assigned in program order as the graph is built: per block, phis first,
//! then ordinary nodes, then the control node. Gap moves created during
//! allocation receive ids past the end of the program order; they never
//! participate in liveness.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::data_structures::MergePointState;
use crate::index::{BlockId, NodeId};
use crate::{
    AllocatedOperand, MachineEnv, Operand, OperandPolicy, RegAllocError, RegList, Register,
};

/// The inclusive node-id interval during which a value may be used.
/// `start` is the defining node's id; `end` is the id of the last use (or
/// the defining id for values without uses).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveRange {
    pub start: NodeId,
    pub end: NodeId,
}

/// Allocation-relevant side effects of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeProperties {
    /// Calls clobber every register; all live values are spilled and the
    /// register file is cleared.
    pub is_call: bool,
    /// Deoptimization points need every live value to have a stack slot, but
    /// values stay in their registers.
    pub can_deopt: bool,
}

impl NodeProperties {
    pub fn call() -> Self {
        NodeProperties {
            is_call: true,
            can_deopt: false,
        }
    }

    pub fn deopt() -> Self {
        NodeProperties {
            is_call: false,
            can_deopt: true,
        }
    }
}

/// An operand slot that starts out as a policy and is overwritten with the
/// chosen allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueLocation {
    operand: Operand,
}

impl ValueLocation {
    pub fn new(policy: OperandPolicy) -> Self {
        ValueLocation {
            operand: Operand::Unallocated(policy),
        }
    }

    #[inline(always)]
    pub fn operand(&self) -> Operand {
        self.operand
    }

    #[inline(always)]
    pub fn policy(&self) -> OperandPolicy {
        self.operand.policy()
    }

    #[inline(always)]
    pub fn is_allocated(&self) -> bool {
        self.operand.is_allocated()
    }

    pub(crate) fn set_allocated(&mut self, allocation: AllocatedOperand) {
        self.operand = Operand::Allocated(allocation);
    }
}

/// A use of a value. `next_use_id` is the id of the node containing the
/// following use of the same value, filled in during liveness preparation.
#[derive(Clone, Debug)]
pub struct Input {
    node: NodeId,
    location: ValueLocation,
    next_use_id: Option<NodeId>,
}

impl Input {
    fn new(node: NodeId, policy: OperandPolicy) -> Self {
        Input {
            node,
            location: ValueLocation::new(policy),
            next_use_id: None,
        }
    }

    /// The value this input consumes.
    #[inline(always)]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[inline(always)]
    pub fn operand(&self) -> Operand {
        self.location.operand()
    }

    #[inline(always)]
    pub fn policy(&self) -> OperandPolicy {
        self.location.policy()
    }

    #[inline(always)]
    pub fn next_use_id(&self) -> Option<NodeId> {
        self.next_use_id
    }

    /// The register this input was allocated to. Panics if the input was
    /// given a slot or has not been allocated yet.
    pub fn assigned_register(&self) -> Register {
        self.operand().allocated().register()
    }

    pub(crate) fn set_allocated(&mut self, allocation: AllocatedOperand) {
        self.location.set_allocated(allocation);
    }
}

/// Control-transfer kinds. `next_post_dominating_hole` lives in the common
/// [`ControlNode`] header; dispatch is by `match`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    Jump { target: BlockId },
    Branch { if_true: BlockId, if_false: BlockId },
    JumpLoop { target: BlockId },
    Return,
}

#[derive(Clone, Debug)]
pub struct ControlNode {
    pub kind: ControlKind,
    /// The next non-fallthrough control transfer reached on every path from
    /// this node, computed by the post-dominating-hole analysis. `None` for
    /// terminal nodes (returns and loop back-edges).
    pub next_post_dominating_hole: Option<NodeId>,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// A generic operation; may or may not produce a value.
    Operation,
    /// A function parameter or other value that starts its life in a
    /// caller-provided frame slot.
    InitialValue,
    /// A value merged from one input per predecessor at a join block.
    Phi,
    /// A location-reconciliation move inserted by the allocator.
    GapMove {
        source: AllocatedOperand,
        target: AllocatedOperand,
    },
    Control(ControlNode),
}

/// A node in the graph. All kinds share one uniform shape; the allocator
/// only needs the operand/input/result/liveness view.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    inputs: SmallVec<[Input; 2]>,
    result: Option<ValueLocation>,
    properties: NodeProperties,
    num_temporaries: u8,
    temporaries: RegList,
    live_range: LiveRange,
    first_use: Option<NodeId>,
    spilled: Option<AllocatedOperand>,
}

impl Node {
    #[inline(always)]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline(always)]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[inline(always)]
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    #[inline(always)]
    pub fn input(&self, index: usize) -> &Input {
        &self.inputs[index]
    }

    pub(crate) fn input_mut(&mut self, index: usize) -> &mut Input {
        &mut self.inputs[index]
    }

    /// The node's result slot; `None` for nodes that produce no value.
    #[inline(always)]
    pub fn result(&self) -> Option<&ValueLocation> {
        self.result.as_ref()
    }

    pub(crate) fn result_mut(&mut self) -> Option<&mut ValueLocation> {
        self.result.as_mut()
    }

    #[inline(always)]
    pub fn properties(&self) -> NodeProperties {
        self.properties
    }

    #[inline(always)]
    pub fn num_temporaries_needed(&self) -> u8 {
        self.num_temporaries
    }

    /// The free registers reserved for this node's code generation.
    #[inline(always)]
    pub fn temporaries(&self) -> RegList {
        self.temporaries
    }

    pub(crate) fn assign_temporaries(&mut self, temporaries: RegList) {
        self.temporaries = temporaries;
    }

    #[inline(always)]
    pub fn live_range(&self) -> LiveRange {
        self.live_range
    }

    #[inline(always)]
    pub fn first_use(&self) -> Option<NodeId> {
        self.first_use
    }

    /// The slot the code emitter must write this value to at definition
    /// time, if the allocator decided to spill it.
    #[inline(always)]
    pub fn spilled(&self) -> Option<AllocatedOperand> {
        self.spilled
    }

    pub(crate) fn spill(&mut self, slot: AllocatedOperand) {
        debug_assert!(self.spilled.is_none());
        self.spilled = Some(slot);
    }

    #[inline(always)]
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, NodeKind::Phi)
    }

    #[inline(always)]
    pub fn is_initial_value(&self) -> bool {
        matches!(self.kind, NodeKind::InitialValue)
    }

    #[inline(always)]
    pub fn is_gap_move(&self) -> bool {
        matches!(self.kind, NodeKind::GapMove { .. })
    }

    /// The source and target of a gap move.
    pub fn gap_move(&self) -> Option<(AllocatedOperand, AllocatedOperand)> {
        match self.kind {
            NodeKind::GapMove { source, target } => Some((source, target)),
            _ => None,
        }
    }

    pub fn as_control(&self) -> &ControlNode {
        match &self.kind {
            NodeKind::Control(control) => control,
            _ => unreachable!("{} is not a control node", self.id),
        }
    }

    pub(crate) fn as_control_mut(&mut self) -> &mut ControlNode {
        match &mut self.kind {
            NodeKind::Control(control) => control,
            _ => unreachable!("{} is not a control node", self.id),
        }
    }
}

/// A basic block: phis, ordinary nodes, and one control node, all by id.
#[derive(Clone, Debug, Default)]
pub struct Block {
    phis: Vec<NodeId>,
    nodes: Vec<NodeId>,
    control: Option<NodeId>,
    predecessors: Vec<BlockId>,
    predecessor_id: u32,
    merge_state: Option<MergePointState>,
    is_empty_block: bool,
}

impl Block {
    #[inline(always)]
    pub fn phis(&self) -> &[NodeId] {
        &self.phis
    }

    #[inline(always)]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// The block's control node. Panics if the block was never terminated.
    #[inline(always)]
    pub fn control(&self) -> NodeId {
        self.control.unwrap()
    }

    #[inline(always)]
    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    /// This block's index in its unconditional successor's predecessor list.
    #[inline(always)]
    pub fn predecessor_id(&self) -> u32 {
        debug_assert!(self.predecessor_id != u32::MAX);
        self.predecessor_id
    }

    #[inline(always)]
    pub fn has_merge_state(&self) -> bool {
        self.merge_state.is_some()
    }

    #[inline(always)]
    pub fn merge_state(&self) -> Option<&MergePointState> {
        self.merge_state.as_ref()
    }

    pub(crate) fn merge_state_mut(&mut self) -> Option<&mut MergePointState> {
        self.merge_state.as_mut()
    }

    /// True for blocks holding nothing but an unconditional jump. Such
    /// blocks are merged as part of their predecessor's control transfer.
    #[inline(always)]
    pub fn is_empty_block(&self) -> bool {
        self.is_empty_block
    }

    pub(crate) fn insert_node(&mut self, index: usize, node: NodeId) {
        self.nodes.insert(index, node);
    }

    pub(crate) fn push_node(&mut self, node: NodeId) {
        self.nodes.push(node);
    }
}

/// The graph: an arena of nodes plus the block structure, with a builder
/// API for the embedding compiler (and the tests).
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    blocks: Vec<Block>,
    stack_slots: u32,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    #[inline(always)]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.index()]
    }

    pub(crate) fn block_mut(&mut self, block: BlockId) -> &mut Block {
        &mut self.blocks[block.index()]
    }

    #[inline(always)]
    pub fn node(&self, node: NodeId) -> &Node {
        &self.nodes[node.index()]
    }

    pub(crate) fn node_mut(&mut self, node: NodeId) -> &mut Node {
        &mut self.nodes[node.index()]
    }

    /// The number of local stack slots the allocated code needs, set when
    /// allocation finishes.
    #[inline(always)]
    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub(crate) fn set_stack_slots(&mut self, stack_slots: u32) {
        self.stack_slots = stack_slots;
    }

    /// The id of the block's first phi, else its first node, else its
    /// control node. Gap moves inserted at the block head carry ids outside
    /// the program order; use [`Graph::first_non_gap_move_id`] when those
    /// must be skipped.
    pub fn first_id(&self, block: BlockId) -> NodeId {
        let block = self.block(block);
        if let Some(&phi) = block.phis.first() {
            return self.node(phi).id();
        }
        if let Some(&node) = block.nodes.first() {
            return self.node(node).id();
        }
        self.node(block.control()).id()
    }

    pub fn first_non_gap_move_id(&self, block: BlockId) -> NodeId {
        let block = self.block(block);
        if let Some(&phi) = block.phis.first() {
            return self.node(phi).id();
        }
        for &node in &block.nodes {
            if !self.node(node).is_gap_move() {
                return self.node(node).id();
            }
        }
        self.node(block.control()).id()
    }

    // ------------------------------------------------------------------
    // Builder API
    // ------------------------------------------------------------------

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(Block {
            predecessor_id: u32::MAX,
            ..Block::default()
        });
        id
    }

    fn push_node_data(
        &mut self,
        kind: NodeKind,
        inputs: SmallVec<[Input; 2]>,
        result: Option<ValueLocation>,
        properties: NodeProperties,
    ) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node {
            id,
            kind,
            inputs,
            result,
            properties,
            num_temporaries: 0,
            temporaries: RegList::empty(),
            live_range: LiveRange { start: id, end: id },
            first_use: None,
            spilled: None,
        });
        id
    }

    /// Append an ordinary operation to `block`. `result` is `None` for pure
    /// effect nodes.
    pub fn add_node(
        &mut self,
        block: BlockId,
        inputs: &[(NodeId, OperandPolicy)],
        result: Option<OperandPolicy>,
        properties: NodeProperties,
    ) -> NodeId {
        debug_assert!(self.block(block).control.is_none());
        let inputs = inputs
            .iter()
            .map(|&(node, policy)| Input::new(node, policy))
            .collect();
        let id = self.push_node_data(
            NodeKind::Operation,
            inputs,
            result.map(ValueLocation::new),
            properties,
        );
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Append an initial-value node bound to the caller-provided frame slot
    /// `slot` (a negative index).
    pub fn add_initial_value(&mut self, block: BlockId, slot: i32) -> NodeId {
        debug_assert!(self.block(block).control.is_none());
        let id = self.push_node_data(
            NodeKind::InitialValue,
            SmallVec::new(),
            Some(ValueLocation::new(OperandPolicy::FixedSlot(slot))),
            NodeProperties::default(),
        );
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Add a phi to `block`, with one input per predecessor in predecessor
    /// order. Phis must be added before the block's ordinary nodes so that
    /// their ids precede the block body.
    pub fn add_phi(&mut self, block: BlockId, inputs: &[NodeId]) -> NodeId {
        debug_assert!(self.block(block).nodes.is_empty());
        debug_assert!(self.block(block).control.is_none());
        let inputs = inputs
            .iter()
            .map(|&node| Input::new(node, OperandPolicy::RegisterOrSlot))
            .collect();
        let id = self.push_node_data(
            NodeKind::Phi,
            inputs,
            Some(ValueLocation::new(OperandPolicy::RegisterOrSlot)),
            NodeProperties::default(),
        );
        self.blocks[block.index()].phis.push(id);
        id
    }

    /// Terminate `block` with a control node, registering the control-flow
    /// edges it introduces. Unconditional edges record this block's position
    /// in the target's predecessor list.
    pub fn set_control(
        &mut self,
        block: BlockId,
        kind: ControlKind,
        inputs: &[(NodeId, OperandPolicy)],
        properties: NodeProperties,
    ) -> NodeId {
        debug_assert!(self.block(block).control.is_none());
        let inputs = inputs
            .iter()
            .map(|&(node, policy)| Input::new(node, policy))
            .collect();
        let id = self.push_node_data(
            NodeKind::Control(ControlNode {
                kind,
                next_post_dominating_hole: None,
            }),
            inputs,
            None,
            properties,
        );
        self.blocks[block.index()].control = Some(id);
        match kind {
            ControlKind::Jump { target } | ControlKind::JumpLoop { target } => {
                let predecessor_id = self.blocks[target.index()].predecessors.len() as u32;
                self.blocks[target.index()].predecessors.push(block);
                self.blocks[block.index()].predecessor_id = predecessor_id;
            }
            ControlKind::Branch { if_true, if_false } => {
                self.blocks[if_true.index()].predecessors.push(block);
                self.blocks[if_false.index()].predecessors.push(block);
            }
            ControlKind::Return => {}
        }
        id
    }

    pub fn set_temporaries_needed(&mut self, node: NodeId, count: u8) {
        self.node_mut(node).num_temporaries = count;
    }

    pub(crate) fn new_gap_move(
        &mut self,
        source: AllocatedOperand,
        target: AllocatedOperand,
    ) -> NodeId {
        self.push_node_data(
            NodeKind::GapMove { source, target },
            SmallVec::new(),
            None,
            NodeProperties::default(),
        )
    }

    // ------------------------------------------------------------------
    // Pre-allocation passes
    // ------------------------------------------------------------------

    fn block_is_empty(&self, block: BlockId) -> bool {
        let block = self.block(block);
        block.phis.is_empty()
            && block.nodes.is_empty()
            && matches!(
                block.control.map(|c| self.node(c).as_control().kind),
                Some(ControlKind::Jump { .. })
            )
    }

    /// Check that the graph only uses the operand policies and block shapes
    /// this allocator supports.
    pub(crate) fn validate(&self, mach_env: &MachineEnv) -> Result<(), RegAllocError> {
        for (index, block) in self.blocks.iter().enumerate() {
            let id = BlockId::new(index);
            if block.control.is_none() {
                return Err(RegAllocError::MalformedBlock(id));
            }
            for &phi in &block.phis {
                if self.node(phi).inputs.len() != block.predecessors.len() {
                    return Err(RegAllocError::MalformedBlock(id));
                }
            }
            // Only conditional branches may target empty blocks; jumps to
            // them would bypass the merge shortcut.
            if let ControlKind::Jump { target } | ControlKind::JumpLoop { target } =
                self.node(block.control()).as_control().kind
            {
                if self.block_is_empty(target) {
                    return Err(RegAllocError::MalformedBlock(id));
                }
            }
        }

        for node in &self.nodes {
            for input in &node.inputs {
                match input.policy() {
                    OperandPolicy::RegisterOrSlot
                    | OperandPolicy::RegisterOrSlotOrConstant
                    | OperandPolicy::MustHaveRegister => {}
                    OperandPolicy::FixedRegister(reg) => {
                        if !mach_env.allocatable_regs.contains(&reg) {
                            return Err(RegAllocError::UnsupportedPolicy(node.id));
                        }
                    }
                    _ => return Err(RegAllocError::UnsupportedPolicy(node.id)),
                }
            }
            if node.is_phi() {
                continue;
            }
            if let Some(result) = &node.result {
                match result.policy() {
                    OperandPolicy::MustHaveRegister => {}
                    OperandPolicy::FixedRegister(reg) => {
                        if !mach_env.allocatable_regs.contains(&reg) {
                            return Err(RegAllocError::UnsupportedPolicy(node.id));
                        }
                    }
                    OperandPolicy::SameAsInput(input) => {
                        if input >= node.inputs.len() {
                            return Err(RegAllocError::UnsupportedPolicy(node.id));
                        }
                    }
                    OperandPolicy::FixedSlot(slot) => {
                        if !node.is_initial_value() || slot >= 0 {
                            return Err(RegAllocError::UnsupportedPolicy(node.id));
                        }
                    }
                    _ => return Err(RegAllocError::UnsupportedPolicy(node.id)),
                }
            }
        }
        Ok(())
    }

    /// Compute everything allocation needs from the finished graph: the
    /// empty-block flags, the merge states of blocks entered through
    /// non-fallthrough edges, and the per-value use chains.
    pub(crate) fn prepare_for_allocation(&mut self) {
        for index in 0..self.blocks.len() {
            let id = BlockId::new(index);
            self.blocks[index].is_empty_block = self.block_is_empty(id);
        }

        // A block needs a merge state if any edge into it is not a simple
        // fallthrough from the previous block. Empty blocks never get one;
        // they are merged at their predecessor's control node instead.
        let mut needs_state = vec![false; self.blocks.len()];
        for (index, block) in self.blocks.iter().enumerate() {
            if block.predecessors.len() >= 2 {
                needs_state[index] = true;
            }
            let control = block.control();
            match self.node(control).as_control().kind {
                ControlKind::Jump { target } | ControlKind::JumpLoop { target } => {
                    needs_state[target.index()] = true;
                }
                ControlKind::Branch { if_true, if_false } => {
                    for target in [if_true, if_false] {
                        if self.node(control).id().next() != self.first_id(target) {
                            needs_state[target.index()] = true;
                        }
                    }
                }
                ControlKind::Return => {}
            }
        }
        for (index, block) in self.blocks.iter_mut().enumerate() {
            if needs_state[index] && !block.is_empty_block {
                block.merge_state = Some(MergePointState::new(block.predecessors.len() as u32));
            }
        }

        self.compute_use_chains();
    }

    /// Collect every use of every value, in consuming-node id order, and
    /// fill in live ranges, first uses, and per-input next-use chains. A phi
    /// input counts as a use at the corresponding predecessor's control
    /// node.
    fn compute_use_chains(&mut self) {
        let mut uses: FxHashMap<NodeId, Vec<(NodeId, NodeId, usize)>> = FxHashMap::default();
        let record = |uses: &mut FxHashMap<NodeId, Vec<(NodeId, NodeId, usize)>>,
                          value: NodeId,
                          use_id: NodeId,
                          owner: NodeId,
                          input_index: usize| {
            uses.entry(value)
                .or_default()
                .push((use_id, owner, input_index));
        };

        for block in &self.blocks {
            for &phi in &block.phis {
                for (index, input) in self.node(phi).inputs.iter().enumerate() {
                    let predecessor = block.predecessors[index];
                    let use_id = self.node(self.block(predecessor).control()).id();
                    record(&mut uses, input.node(), use_id, phi, index);
                }
            }
            for &node in block.nodes.iter().chain(block.control.iter()) {
                for (index, input) in self.node(node).inputs.iter().enumerate() {
                    record(&mut uses, input.node(), self.node(node).id(), node, index);
                }
            }
        }

        for (value, mut list) in uses {
            list.sort_by_key(|&(use_id, _, _)| use_id);
            for i in 0..list.len() {
                let next = list.get(i + 1).map(|&(use_id, _, _)| use_id);
                let (_, owner, input_index) = list[i];
                self.nodes[owner.index()].inputs[input_index].next_use_id = next;
            }
            let first = list.first().map(|&(use_id, _, _)| use_id);
            let last = list.last().map(|&(use_id, _, _)| use_id).unwrap();
            let node = &mut self.nodes[value.index()];
            debug_assert!(last >= node.live_range.start);
            node.first_use = first;
            node.live_range.end = last;
        }
    }
}
