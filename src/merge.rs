/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Register-state reconciliation at control-flow edges.
//!
//! The first edge into a block copies the live part of the register file
//! into the block's merge state; every further edge merges into it. When
//! predecessors disagree about where a value lives, the entry is promoted to
//! a [`RegisterMerge`] carrying one operand per predecessor, which the code
//! emitter turns into per-edge moves.

use crate::allocator::Env;
use crate::data_structures::{RegisterMerge, RegisterState};
use crate::graph::ControlKind;
use crate::index::{BlockId, NodeId};
use crate::AllocatedOperand;

impl<'a> Env<'a> {
    /// Is `value` (an entry of the register file, possibly empty) live on
    /// entry to `target` when arriving from control node `source`?
    pub(crate) fn is_live_at_target(
        &self,
        value: Option<NodeId>,
        source: NodeId,
        target: BlockId,
    ) -> bool {
        let Some(value) = value else {
            return false;
        };
        let source_id = self.graph.node(source).id();
        let target_control_id = self.graph.node(self.graph.block(target).control()).id();
        if target_control_id <= source_id {
            // Back edge. Gap moves may already sit at the target's head, so
            // skip them: only values defined before the loop can flow
            // around it.
            return self.graph.node(value).id() < self.graph.first_non_gap_move_id(target);
        }
        self.live(value).last_use >= self.graph.first_id(target)
    }

    /// Handle one outgoing edge of a conditional branch.
    pub(crate) fn initialize_conditional_branch_registers(
        &mut self,
        control: NodeId,
        target: BlockId,
    ) {
        if self.graph.block(target).is_empty_block() {
            // Jumping over an empty block, so this is in fact a merge into
            // the block beyond it.
            let jump = self.graph.block(target).control();
            let ControlKind::Jump { target: final_target } =
                self.graph.node(jump).as_control().kind
            else {
                unreachable!("empty block {} must end in a jump", target)
            };
            let predecessor_id = self.graph.block(target).predecessor_id();
            self.merge_register_values(control, final_target, predecessor_id);
            return;
        }
        if self.graph.block(target).has_merge_state() {
            // Not a fallthrough branch; copy the state over.
            self.initialize_branch_target_register_values(control, target);
            return;
        }
        // Fallthrough: the target inherits the register file, minus the
        // values that are dead there.
        debug_assert_eq!(self.graph.node(control).id().next(), self.graph.first_id(target));
        for i in 0..self.num_registers() {
            let value = self.register_values[i];
            if value.is_some() && !self.is_live_at_target(value, control, target) {
                self.live_mut(value.unwrap()).reg = None;
                self.register_values[i] = None;
            }
        }
    }

    /// First edge into `target`: store the live part of the register file
    /// as the target's expected incoming state.
    pub(crate) fn initialize_branch_target_register_values(
        &mut self,
        source: NodeId,
        target: BlockId,
    ) {
        trace!("initialize register state of {}", target);
        let mut registers = Vec::with_capacity(self.num_registers());
        for i in 0..self.num_registers() {
            let mut value = self.register_values[i];
            if !self.is_live_at_target(value, source, target) {
                value = None;
            }
            registers.push(match value {
                Some(value) => RegisterState::Value(value),
                None => RegisterState::Empty,
            });
        }
        let state = self.graph.block_mut(target).merge_state_mut().unwrap();
        state.initialize(registers);
    }

    /// A further edge into `target`: merge the register file into the
    /// stored state, promoting entries to [`RegisterMerge`]s where the
    /// predecessors disagree.
    pub(crate) fn merge_register_values(
        &mut self,
        control: NodeId,
        target: BlockId,
        predecessor_id: u32,
    ) {
        if !self.graph.block(target).merge_state().unwrap().is_initialized() {
            // This is the first edge we're merging; initialize the values.
            return self.initialize_branch_target_register_values(control, target);
        }
        trace!("merge into {} from predecessor {}", target, predecessor_id);
        let predecessor_count = self
            .graph
            .block(target)
            .merge_state()
            .unwrap()
            .predecessor_count();

        for i in 0..self.num_registers() {
            let entry = self.graph.block(target).merge_state().unwrap().registers()[i].clone();
            let register_info = AllocatedOperand::reg(self.register_at(i));
            let node = entry.node();
            let mut incoming = self.register_values[i];
            if !self.is_live_at_target(incoming, control, target) {
                incoming = None;
            }

            if incoming == node {
                // This predecessor delivers the same value the target
                // already expects. If locations are merged, record that it
                // arrives in the register here.
                if let RegisterState::Merged(mut merge) = entry {
                    merge.operands[predecessor_id as usize] = register_info;
                    self.store_merge_entry(target, i, RegisterState::Merged(merge));
                }
                continue;
            }

            if let RegisterState::Merged(mut merge) = entry {
                // The register is occupied by a different node at the merge
                // point; record where that node lives on this edge.
                merge.operands[predecessor_id as usize] = self.live(merge.node).allocation();
                self.store_merge_entry(target, i, RegisterState::Merged(merge));
                // A spilled incoming value stays reachable through its
                // slot only until its death; it must also appear in some
                // register of the merge state.
                if let Some(incoming) = incoming {
                    if self.live(incoming).stack_slot.is_some() {
                        self.ensure_in_register(target, incoming);
                    }
                }
                continue;
            }

            debug_assert!(node.is_some() || incoming.is_some());
            if node.is_none() && self.live(incoming.unwrap()).stack_slot.is_none() {
                // The register is unallocated at the merge point and the
                // incoming value isn't spilled, so we must have seen it in
                // a different register already.
                self.ensure_in_register(target, incoming.unwrap());
                continue;
            }

            let merge_node = match node {
                Some(node) => node,
                None => incoming.unwrap(),
            };
            // If the register is unallocated at the merge point, the spill
            // slot of the incoming value is the only location valid for the
            // predecessors seen so far. Otherwise they all agree the node
            // sits in this register.
            let info_so_far = match node {
                Some(_) => register_info,
                None => self.live(incoming.unwrap()).stack_slot.unwrap(),
            };
            // Seed the whole operand array with that location; predecessors
            // we haven't visited yet overwrite their entry when they merge.
            let mut operands = vec![info_so_far; predecessor_count as usize];
            operands[predecessor_id as usize] = match node {
                Some(node) => self.live(node).allocation(),
                None => register_info,
            };
            trace!(
                "merge {} register {}: {:?}",
                target,
                register_info,
                operands
            );
            self.store_merge_entry(
                target,
                i,
                RegisterState::Merged(RegisterMerge {
                    node: merge_node,
                    operands,
                }),
            );
        }
    }

    /// Load a block's stored merge state into the register file.
    pub(crate) fn initialize_register_values(&mut self, block: BlockId) {
        trace!("restore register state of {}", block);
        // First clear the register state left over from the previous block.
        for i in 0..self.num_registers() {
            let Some(value) = self.register_values[i] else {
                continue;
            };
            self.live_mut(value).reg = None;
            self.register_values[i] = None;
        }
        // Then fill it in with the target information.
        for i in 0..self.num_registers() {
            let node = {
                let state = self.graph.block(block).merge_state().unwrap();
                debug_assert!(state.is_initialized());
                state.registers()[i].node()
            };
            let Some(value) = node else {
                continue;
            };
            self.register_values[i] = Some(value);
            let reg = self.register_at(i);
            self.live_mut(value).reg = Some(reg);
        }
    }

    fn store_merge_entry(&mut self, target: BlockId, index: usize, state: RegisterState) {
        self.graph
            .block_mut(target)
            .merge_state_mut()
            .unwrap()
            .set_register(index, state);
    }

    /// Debug check: a displaced incoming value must be present somewhere in
    /// the target's merge state.
    fn ensure_in_register(&self, target: BlockId, incoming: NodeId) {
        if cfg!(debug_assertions) {
            let state = self.graph.block(target).merge_state().unwrap();
            assert!(
                state.registers().iter().any(|entry| entry.node() == Some(incoming)),
                "{} does not flow into {} through any register",
                incoming,
                target
            );
        }
    }
}
