/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The allocator driver: a single pass over the blocks in program order.
//!
//! For every node: assign locations to the inputs, reserve temporaries,
//! consume uses (freeing dead values), apply call/deopt side effects, and
//! allocate the result. Control nodes additionally inject allocations into
//! their target's phis and reconcile the register state into their
//! successors (see the `merge` module).

use fxhash::FxHashMap;

use crate::data_structures::{LiveNodeInfo, SpillSlots};
use crate::graph::{ControlKind, Graph};
use crate::index::{BlockId, NodeId};
use crate::postdom;
use crate::{AllocatedOperand, MachineEnv, Operand, OperandPolicy, RegList, RegallocOptions, Register};

pub(crate) struct Env<'a> {
    pub graph: &'a mut Graph,
    pub mach_env: &'a MachineEnv,
    pub options: &'a RegallocOptions,
    /// Liveness records for every currently-live value, keyed by value id.
    pub values: FxHashMap<NodeId, LiveNodeInfo>,
    /// The register file: which value sits in each register right now.
    pub register_values: Vec<Option<NodeId>>,
    pub slots: SpillSlots,
    /// Gap-move insertion point: the current block and the index of the
    /// node being processed (== the node count when at the control node).
    current_block: BlockId,
    cursor: usize,
}

impl<'a> Env<'a> {
    pub fn new(graph: &'a mut Graph, mach_env: &'a MachineEnv, options: &'a RegallocOptions) -> Self {
        let register_count = mach_env.register_count();
        Env {
            graph,
            mach_env,
            options,
            values: FxHashMap::default(),
            register_values: vec![None; register_count],
            slots: SpillSlots::new(),
            current_block: BlockId::new(0),
            cursor: 0,
        }
    }

    #[inline(always)]
    pub fn num_registers(&self) -> usize {
        self.register_values.len()
    }

    #[inline(always)]
    pub fn index_of(&self, reg: Register) -> usize {
        self.mach_env.map_register_to_index(reg)
    }

    #[inline(always)]
    pub fn register_at(&self, index: usize) -> Register {
        self.mach_env.map_index_to_register(index)
    }

    pub fn live(&self, value: NodeId) -> &LiveNodeInfo {
        &self.values[&value]
    }

    pub fn live_mut(&mut self, value: NodeId) -> &mut LiveNodeInfo {
        self.values.get_mut(&value).unwrap()
    }

    fn tracing(&self) -> bool {
        trace_enabled!() || self.options.trace_regalloc
    }

    pub fn allocate_registers(&mut self) {
        for index in 0..self.graph.num_blocks() {
            let block = BlockId::new(index);
            self.current_block = block;
            self.cursor = 0;

            // Restore the register state expected at a merge point.
            if self.graph.block(block).has_merge_state() {
                self.initialize_register_values(block);
            }
            if self.tracing() {
                self.log_block_state(block);
            }

            if !self.graph.block(block).phis().is_empty() {
                self.allocate_phis(block);
            }

            let mut i = 0;
            while i < self.graph.block(block).nodes().len() {
                self.cursor = i;
                let node = self.graph.block(block).nodes()[i];
                self.allocate_node(node);
                i = self.cursor + 1;
            }
            self.cursor = self.graph.block(block).nodes().len();
            self.allocate_control_node(block);
        }
        self.graph.set_stack_slots(self.slots.top_of_stack);
    }

    // ------------------------------------------------------------------
    // Node processing
    // ------------------------------------------------------------------

    fn allocate_node(&mut self, node: NodeId) {
        let num_inputs = self.graph.node(node).inputs().len();
        for i in 0..num_inputs {
            self.assign_input(node, i);
        }
        self.assign_temporaries(node);
        let use_id = self.graph.node(node).id();
        for i in 0..num_inputs {
            self.update_input_use_and_clear_dead(use_id, node, i);
        }

        let properties = self.graph.node(node).properties();
        if properties.is_call {
            self.spill_and_clear_registers();
        }
        // TODO: spilling everything live at a deopt point allocates slots
        // for values the deopt frame never reads; restrict this to values
        // captured by the deopt state.
        if properties.can_deopt {
            self.spill_registers();
        }

        if self.graph.node(node).result().is_some() {
            self.allocate_node_result(node);
        }

        if self.tracing() {
            self.log_node_state(node);
        }
        self.check_invariants();
    }

    /// Place one input according to its policy, emitting a gap move if the
    /// chosen location differs from where the value currently lives.
    fn assign_input(&mut self, owner: NodeId, input_index: usize) {
        let (value, policy) = {
            let input = self.graph.node(owner).input(input_index);
            (input.node(), input.policy())
        };
        let location = self.live(value).allocation();

        let allocation = match policy {
            OperandPolicy::RegisterOrSlot | OperandPolicy::RegisterOrSlotOrConstant => location,
            OperandPolicy::FixedRegister(reg) => self.force_allocate(reg, value, true),
            OperandPolicy::MustHaveRegister => {
                if location.is_register() {
                    location
                } else {
                    self.allocate_register(value)
                }
            }
            OperandPolicy::None
            | OperandPolicy::MustHaveSlot
            | OperandPolicy::FixedFpRegister(_)
            | OperandPolicy::SameAsInput(_)
            | OperandPolicy::FixedSlot(_) => {
                unreachable!("unsupported input policy {:?} on {}", policy, owner)
            }
        };

        self.graph
            .node_mut(owner)
            .input_mut(input_index)
            .set_allocated(allocation);
        if location != allocation {
            trace!("gap move: {} ← {}", allocation, location);
            self.add_move_before_current_node(location, allocation);
        }
    }

    /// Consume one use. If it was the value's last use, the value dies: its
    /// registers are released, its local slot is recycled, and the record is
    /// destroyed. Otherwise the record's next-use advances.
    fn update_input_use_and_clear_dead(&mut self, use_id: NodeId, owner: NodeId, input_index: usize) {
        let (value, next_use_id) = {
            let input = self.graph.node(owner).input(input_index);
            (input.node(), input.next_use_id())
        };
        if self.graph.node(value).live_range().end == use_id {
            // A value used several times by one node dies on the first of
            // those inputs; the record is already gone for the rest.
            let Some(info) = self.values.remove(&value) else {
                return;
            };
            for i in 0..self.num_registers() {
                if self.register_values[i] == Some(value) {
                    self.register_values[i] = None;
                }
            }
            if let Some(slot) = info.stack_slot {
                self.slots.free(slot.slot_index());
            }
            trace!("dead: {}", value);
            return;
        }
        if let Some(next_use) = next_use_id {
            self.live_mut(value).next_use = next_use;
        }
    }

    fn allocate_node_result(&mut self, node: NodeId) {
        debug_assert!(!self.graph.node(node).is_phi());
        self.make_live(node);
        let policy = self.graph.node(node).result().unwrap().policy();

        if let OperandPolicy::FixedSlot(index) = policy {
            debug_assert!(self.graph.node(node).is_initial_value());
            debug_assert!(index < 0);
            // The value begins its life in a caller-provided frame slot.
            let slot = AllocatedOperand::stack(index);
            self.live_mut(node).stack_slot = Some(slot);
            self.graph.node_mut(node).result_mut().unwrap().set_allocated(slot);
            return;
        }

        let allocation = match policy {
            OperandPolicy::FixedRegister(reg) => self.force_allocate(reg, node, true),
            OperandPolicy::MustHaveRegister => self.allocate_register(node),
            OperandPolicy::SameAsInput(input_index) => {
                // The reused input's last use must be this node, so its
                // register was released by the use update above.
                let reg = self.graph.node(node).input(input_index).assigned_register();
                self.force_allocate(reg, node, true)
            }
            _ => unreachable!("unsupported result policy {:?} on {}", policy, node),
        };
        trace!("result of {}: {}", node, allocation);
        self.graph.node_mut(node).result_mut().unwrap().set_allocated(allocation);
    }

    fn allocate_control_node(&mut self, block: BlockId) {
        let control = self.graph.block(block).control();
        let num_inputs = self.graph.node(control).inputs().len();
        for i in 0..num_inputs {
            self.assign_input(control, i);
        }
        self.assign_temporaries(control);
        let use_id = self.graph.node(control).id();
        for i in 0..num_inputs {
            self.update_input_use_and_clear_dead(use_id, control, i);
        }

        if self.graph.node(control).properties().is_call {
            self.spill_and_clear_registers();
        }

        let kind = self.graph.node(control).as_control().kind;

        // Hand the phis of an unconditional target their incoming
        // allocations, then consume those uses.
        if let ControlKind::Jump { target } | ControlKind::JumpLoop { target } = kind {
            if !self.graph.block(target).phis().is_empty() {
                let predecessor_id = self.graph.block(block).predecessor_id() as usize;
                let phis = self.graph.block(target).phis().to_vec();
                for &phi in &phis {
                    let value = self.graph.node(phi).input(predecessor_id).node();
                    let allocation = self.live(value).allocation();
                    trace!("phi input {} of {}: {}", predecessor_id, phi, allocation);
                    self.graph
                        .node_mut(phi)
                        .input_mut(predecessor_id)
                        .set_allocated(allocation);
                }
                for &phi in &phis {
                    self.update_input_use_and_clear_dead(use_id, phi, predecessor_id);
                }
            }
        }

        // TODO: spilling everything live at a deopt point allocates slots
        // for values the deopt frame never reads; restrict this to values
        // captured by the deopt state.
        if self.graph.node(control).properties().can_deopt {
            self.spill_registers();
        }

        // Values that only flow into phis and are not independently live
        // die as part of the merge below.
        match kind {
            ControlKind::Jump { target } | ControlKind::JumpLoop { target } => {
                // Empty blocks were merged at their predecessor's control
                // node already.
                if !self.graph.block(block).is_empty_block() {
                    let predecessor_id = self.graph.block(block).predecessor_id();
                    self.merge_register_values(control, target, predecessor_id);
                }
            }
            ControlKind::Branch { if_true, if_false } => {
                self.initialize_conditional_branch_registers(control, if_true);
                self.initialize_conditional_branch_registers(control, if_false);
            }
            ControlKind::Return => {}
        }

        if self.tracing() {
            self.log_node_state(control);
        }
        self.check_invariants();
    }

    // ------------------------------------------------------------------
    // Phi resolution
    // ------------------------------------------------------------------

    fn allocate_phis(&mut self, block: BlockId) {
        let phis = self.graph.block(block).phis().to_vec();
        // First make the phis live and try to take over a register one of
        // their inputs arrives in.
        for &phi in &phis {
            self.make_live(phi);
            self.try_allocate_to_input(phi);
        }
        // Then try any free register.
        for &phi in &phis {
            if self.graph.node(phi).result().unwrap().is_allocated() {
                continue;
            }
            if let Some(allocation) = self.try_allocate_register(phi) {
                trace!("phi (new reg) {}: {}", phi, allocation);
                self.graph.node_mut(phi).result_mut().unwrap().set_allocated(allocation);
            }
        }
        // Finally fall back to a stack slot.
        for &phi in &phis {
            if self.graph.node(phi).result().unwrap().is_allocated() {
                continue;
            }
            let slot = self.allocate_spill_slot(phi);
            trace!("phi (stack) {}: {}", phi, slot);
            self.graph.node_mut(phi).result_mut().unwrap().set_allocated(slot);
        }
        if self.tracing() {
            log::trace!("{}: after phis: live regs: {}", block, self.live_regs_string());
        }
    }

    fn try_allocate_to_input(&mut self, phi: NodeId) {
        for i in 0..self.graph.node(phi).inputs().len() {
            let Operand::Allocated(allocation) = self.graph.node(phi).input(i).operand() else {
                // Back-edge inputs have not been visited yet.
                continue;
            };
            if !allocation.is_register() {
                continue;
            }
            let reg = allocation.register();
            if self.register_values[self.index_of(reg)].is_none() {
                let allocation = self.do_allocate(reg, phi);
                trace!("phi (reuse) {}: {}", phi, allocation);
                self.graph.node_mut(phi).result_mut().unwrap().set_allocated(allocation);
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation primitives
    // ------------------------------------------------------------------

    pub fn make_live(&mut self, node: NodeId) {
        let (live_range, first_use) = {
            let node = self.graph.node(node);
            (node.live_range(), node.first_use())
        };
        trace!("make live: {} [{}-{}]", node, live_range.start, live_range.end);
        self.values.insert(
            node,
            LiveNodeInfo {
                node,
                reg: None,
                stack_slot: None,
                next_use: first_use.unwrap_or(live_range.end),
                last_use: live_range.end,
            },
        );
    }

    /// Bind `reg` to `value`, asserting the register is free (or already
    /// holds the value).
    fn set_register(&mut self, reg: Register, value: NodeId) {
        let index = self.index_of(reg);
        debug_assert!(
            self.register_values[index].is_none() || self.register_values[index] == Some(value)
        );
        self.register_values[index] = Some(value);
        self.live_mut(value).reg = Some(reg);
    }

    /// Find the lowest-index empty register, or fail.
    fn try_allocate_register(&mut self, value: NodeId) -> Option<AllocatedOperand> {
        let index = (0..self.num_registers()).find(|&i| self.register_values[i].is_none())?;
        Some(self.do_allocate(self.register_at(index), value))
    }

    fn do_allocate(&mut self, reg: Register, value: NodeId) -> AllocatedOperand {
        self.set_register(reg, value);
        AllocatedOperand::reg(reg)
    }

    /// Allocate any register, evicting the occupant with the farthest next
    /// use when none is free.
    fn allocate_register(&mut self, value: NodeId) -> AllocatedOperand {
        if let Some(allocation) = self.try_allocate_register(value) {
            return allocation;
        }
        let mut furthest = 0;
        for i in 1..self.num_registers() {
            let best = self.live(self.register_values[furthest].unwrap()).next_use;
            let candidate = self.live(self.register_values[i].unwrap()).next_use;
            if best < candidate {
                furthest = i;
            }
        }
        self.force_allocate(self.register_at(furthest), value, false)
    }

    /// Put `value` into `reg`, displacing any current occupant.
    fn force_allocate(&mut self, reg: Register, value: NodeId, try_move: bool) -> AllocatedOperand {
        let index = self.index_of(reg);
        if self.register_values[index] == Some(value) {
            return AllocatedOperand::reg(reg);
        }
        self.free(reg, try_move);
        debug_assert!(self.register_values[index].is_none());
        self.do_allocate(reg, value)
    }

    /// Release a register, rescuing its occupant: into another register it
    /// already lives in, into a free register (with a gap move) when
    /// `try_move` allows it, or failing all that onto the stack.
    fn free(&mut self, reg: Register, try_move: bool) {
        let index = self.index_of(reg);
        let Some(value) = self.register_values[index] else {
            return;
        };
        trace!("free {} (holds {})", reg, value);
        self.register_values[index] = None;

        // If this wasn't the value's primary register it is still resident
        // elsewhere; the record needs no update.
        if self.live(value).reg != Some(reg) {
            debug_assert!(matches!(
                self.live(value).reg,
                Some(other) if self.register_values[self.index_of(other)] == Some(value)
            ));
            return;
        }
        self.live_mut(value).reg = None;

        // Already spilled: the slot keeps the value reachable.
        if self.live(value).stack_slot.is_some() {
            return;
        }

        if try_move {
            let mut target = None;
            for i in 0..self.num_registers() {
                if i == index {
                    continue;
                }
                match self.register_values[i] {
                    Some(other) if other == value => {
                        // Another register already holds this value.
                        self.live_mut(value).reg = Some(self.register_at(i));
                        return;
                    }
                    None if target.is_none() => target = Some(i),
                    _ => {}
                }
            }
            if let Some(i) = target {
                let target_reg = self.register_at(i);
                self.set_register(target_reg, value);
                trace!("gap move (rescue {}): {} ← {}", value, target_reg, reg);
                self.add_move_before_current_node(
                    AllocatedOperand::reg(reg),
                    AllocatedOperand::reg(target_reg),
                );
                return;
            }
        } else {
            for i in 0..self.num_registers() {
                if self.register_values[i] == Some(value) {
                    self.live_mut(value).reg = Some(self.register_at(i));
                    return;
                }
            }
        }

        self.spill(value);
    }

    // ------------------------------------------------------------------
    // Spilling
    // ------------------------------------------------------------------

    pub fn spill(&mut self, value: NodeId) {
        if self.live(value).stack_slot.is_some() {
            return;
        }
        let slot = self.allocate_spill_slot(value);
        trace!("spill: {} ← {}", slot, value);
        // The code emitter writes the slot at definition time, so the slot
        // is valid on every path from here on.
        self.graph.node_mut(value).spill(slot);
    }

    fn allocate_spill_slot(&mut self, value: NodeId) -> AllocatedOperand {
        debug_assert!(self.live(value).stack_slot.is_none());
        let slot = AllocatedOperand::stack(self.slots.allocate());
        self.live_mut(value).stack_slot = Some(slot);
        slot
    }

    fn spill_registers(&mut self) {
        for i in 0..self.num_registers() {
            let Some(value) = self.register_values[i] else {
                continue;
            };
            self.spill(value);
        }
    }

    fn spill_and_clear_registers(&mut self) {
        for i in 0..self.num_registers() {
            let Some(value) = self.register_values[i] else {
                continue;
            };
            self.spill(value);
            self.live_mut(value).reg = None;
            self.register_values[i] = None;
        }
    }

    // ------------------------------------------------------------------
    // Temporaries
    // ------------------------------------------------------------------

    fn assign_temporaries(&mut self, node: NodeId) {
        let count = self.graph.node(node).num_temporaries_needed();
        let temporaries = self.get_free_registers(count);
        self.graph.node_mut(node).assign_temporaries(temporaries);
    }

    fn get_free_registers(&mut self, count: u8) -> RegList {
        let mut free_registers = RegList::empty();
        if count == 0 {
            return free_registers;
        }
        let mut count = count as usize;
        for i in 0..self.num_registers() {
            if self.register_values[i].is_none() {
                free_registers.add(self.register_at(i));
                count -= 1;
                if count == 0 {
                    return free_registers;
                }
            }
        }
        // Not enough empty registers; evict the farthest next uses.
        while count != 0 {
            let mut furthest: Option<usize> = None;
            for i in 0..self.num_registers() {
                let Some(value) = self.register_values[i] else {
                    continue;
                };
                let next_use = self.live(value).next_use;
                if furthest.is_none()
                    || next_use > self.live(self.register_values[furthest.unwrap()].unwrap()).next_use
                {
                    furthest = Some(i);
                }
            }
            let reg = self.register_at(furthest.unwrap());
            self.free(reg, false);
            free_registers.add(reg);
            count -= 1;
        }
        free_registers
    }

    // ------------------------------------------------------------------
    // Gap moves
    // ------------------------------------------------------------------

    /// Insert a move right before the node being processed, or at the block
    /// end when the control node is being processed.
    fn add_move_before_current_node(&mut self, source: AllocatedOperand, target: AllocatedOperand) {
        let gap_move = self.graph.new_gap_move(source, target);
        let block = self.graph.block_mut(self.current_block);
        if self.cursor < block.nodes().len() {
            block.insert_node(self.cursor, gap_move);
            self.cursor += 1;
        } else {
            block.push_node(gap_move);
            self.cursor = block.nodes().len();
        }
    }

    // ------------------------------------------------------------------
    // Tracing and invariant checks
    // ------------------------------------------------------------------

    fn live_regs_string(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut first = true;
        for i in 0..self.num_registers() {
            let Some(value) = self.register_values[i] else {
                continue;
            };
            if !first {
                out.push_str(", ");
            }
            first = false;
            write!(out, "{}={}", self.register_at(i), value).unwrap();
        }
        out
    }

    fn log_block_state(&self, block: BlockId) {
        use std::fmt::Write;
        log::trace!("{}: live regs: {}", block, self.live_regs_string());
        let mut hole =
            postdom::nearest_post_dominating_hole(self.graph, self.graph.block(block).control());
        if matches!(
            self.graph.node(hole).as_control().kind,
            ControlKind::JumpLoop { .. }
        ) {
            return;
        }
        let mut chain = String::new();
        loop {
            let node = self.graph.node(hole);
            match node.as_control().kind {
                ControlKind::Jump { target } => {
                    write!(chain, " {}-{}", node.id(), self.graph.first_id(target)).unwrap();
                    hole = node.as_control().next_post_dominating_hole.unwrap();
                }
                ControlKind::Return => {
                    write!(chain, " {}.", node.id()).unwrap();
                    break;
                }
                ControlKind::JumpLoop { .. } => {
                    write!(chain, " {}↰", node.id()).unwrap();
                    break;
                }
                ControlKind::Branch { .. } => unreachable!(),
            }
        }
        log::trace!("{}: holes:{}", block, chain);
    }

    fn log_node_state(&self, node: NodeId) {
        log::trace!("{}: live regs: {}", node, self.live_regs_string());
    }

    /// Debug-build coherence checks between the register file, the liveness
    /// records, and the slot pool, run after every node.
    fn check_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        for i in 0..self.num_registers() {
            let Some(value) = self.register_values[i] else {
                continue;
            };
            let info = self
                .values
                .get(&value)
                .unwrap_or_else(|| panic!("register file holds dead value {}", value));
            let reg = info.reg.expect("file entry points at record without a register");
            assert_eq!(self.register_values[self.index_of(reg)], Some(value));
        }
        for info in self.values.values() {
            if let Some(reg) = info.reg {
                assert_eq!(self.register_values[self.index_of(reg)], Some(info.node));
            }
            if let Some(slot) = info.stack_slot {
                if slot.slot_index() >= 0 {
                    assert!((slot.slot_index() as u32) < self.slots.top_of_stack);
                }
            }
        }
        #[cfg(debug_assertions)]
        for &slot in self.slots.free_slots() {
            assert!(slot >= 0 && (slot as u32) < self.slots.top_of_stack);
        }
    }
}
