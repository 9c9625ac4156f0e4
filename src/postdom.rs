//! Post-dominating control-flow-hole analysis.
//!
//! Control flow that interrupts linear fallthrough introduces a "hole": a
//! non-fallthrough jump, a conditional branch target, a return, or a loop
//! back-edge. For every forward control node this pass computes the next
//! hole that is reached on *every* path towards the function exit, by
//! walking blocks in reverse so successors are annotated before their
//! predecessors. The allocator uses the chain to reason about register
//! lifetimes across branches without building an interval graph; returns
//! and loop back-edges terminate a chain.

use crate::graph::{ControlKind, Graph};
use crate::index::{BlockId, NodeId};

pub(crate) fn compute_post_dominating_holes(graph: &mut Graph) {
    for index in (0..graph.num_blocks()).rev() {
        let block = BlockId::new(index);
        let control = graph.block(block).control();
        match graph.node(control).as_control().kind {
            ControlKind::Jump { target } => {
                // A jump's next hole is whatever its target's control
                // resolves to.
                let hole = nearest_post_dominating_hole(graph, graph.block(target).control());
                graph.node_mut(control).as_control_mut().next_post_dominating_hole = Some(hole);
            }
            ControlKind::Branch { if_true, if_false } => {
                let mut first =
                    nearest_post_dominating_hole(graph, graph.block(if_true).control());
                let mut second =
                    nearest_post_dominating_hole(graph, graph.block(if_false).control());

                // Either find the merge point of both branches, or the
                // highest reachable control node of the longer branch once
                // the shorter one has terminated.
                while first != second {
                    if graph.node(first).id() > graph.node(second).id() {
                        std::mem::swap(&mut first, &mut second);
                    }
                    if matches!(
                        graph.node(first).as_control().kind,
                        ControlKind::Return | ControlKind::JumpLoop { .. }
                    ) {
                        first = second;
                        break;
                    }
                    // Step along the shorter branch. This can cross over the
                    // other branch if that one returns or loops, swapping
                    // which branch is ahead several times before a
                    // return/loop/merge is discovered.
                    first = graph
                        .node(first)
                        .as_control()
                        .next_post_dominating_hole
                        .unwrap();
                }
                graph.node_mut(control).as_control_mut().next_post_dominating_hole = Some(first);
            }
            // Only forward control matters; these terminate chains.
            ControlKind::JumpLoop { .. } | ControlKind::Return => {}
        }
    }
}

/// The nearest hole at or after the given control node. Conditionals are
/// not themselves holes, and neither are fallthrough jumps; both delegate to
/// their own chain.
pub(crate) fn nearest_post_dominating_hole(graph: &Graph, control: NodeId) -> NodeId {
    let node = graph.node(control).as_control();
    match node.kind {
        ControlKind::Branch { .. } => node.next_post_dominating_hole.unwrap(),
        ControlKind::Jump { target } if is_fallthrough_target(graph, control, target) => {
            node.next_post_dominating_hole.unwrap()
        }
        _ => control,
    }
}

/// A target is a fallthrough of a control node if its first id is the next
/// id after the control node.
pub(crate) fn is_fallthrough_target(graph: &Graph, control: NodeId, target: BlockId) -> bool {
    graph.node(control).id().next() == graph.first_id(target)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{ControlKind, Graph, NodeProperties};
    use crate::OperandPolicy;

    fn branch(graph: &mut Graph, block: BlockId, if_true: BlockId, if_false: BlockId) -> NodeId {
        graph.set_control(
            block,
            ControlKind::Branch { if_true, if_false },
            &[],
            NodeProperties::default(),
        )
    }

    #[test]
    fn diamond_converges_at_return() {
        let mut graph = Graph::new();
        let b0 = graph.add_block();
        let b1 = graph.add_block();
        let b2 = graph.add_block();
        let b3 = graph.add_block();
        let cond = branch(&mut graph, b0, b1, b2); // id 0
        let left = graph.set_control(
            b1,
            ControlKind::Jump { target: b3 },
            &[],
            NodeProperties::default(),
        ); // id 1, not a fallthrough (b2 sits in between)
        let right = graph.set_control(
            b2,
            ControlKind::Jump { target: b3 },
            &[],
            NodeProperties::default(),
        ); // id 2, fallthrough
        let ret = graph.set_control(b3, ControlKind::Return, &[], NodeProperties::default()); // id 3

        compute_post_dominating_holes(&mut graph);

        assert_eq!(
            graph.node(left).as_control().next_post_dominating_hole,
            Some(ret)
        );
        assert_eq!(
            graph.node(right).as_control().next_post_dominating_hole,
            Some(ret)
        );
        assert_eq!(
            graph.node(cond).as_control().next_post_dominating_hole,
            Some(ret)
        );
        // The non-fallthrough jump is a hole itself; the fallthrough jump
        // and the conditional both resolve past themselves.
        assert_eq!(nearest_post_dominating_hole(&graph, left), left);
        assert_eq!(nearest_post_dominating_hole(&graph, right), ret);
        assert_eq!(nearest_post_dominating_hole(&graph, cond), ret);
    }

    #[test]
    fn loop_back_edge_terminates_chain() {
        let mut graph = Graph::new();
        let b0 = graph.add_block();
        let b1 = graph.add_block();
        let b2 = graph.add_block();
        let b3 = graph.add_block();
        let entry = graph.set_control(
            b0,
            ControlKind::Jump { target: b1 },
            &[],
            NodeProperties::default(),
        ); // id 0, fallthrough into the header
        let header = branch(&mut graph, b1, b2, b3); // id 1
        let back = graph.set_control(
            b2,
            ControlKind::JumpLoop { target: b1 },
            &[],
            NodeProperties::default(),
        ); // id 2
        let ret = graph.set_control(b3, ControlKind::Return, &[], NodeProperties::default()); // id 3

        compute_post_dominating_holes(&mut graph);

        // The loop branch cannot post-dominate through the back-edge; the
        // chain resolves to the loop exit's return.
        assert_eq!(
            graph.node(header).as_control().next_post_dominating_hole,
            Some(ret)
        );
        assert_eq!(
            graph.node(entry).as_control().next_post_dominating_hole,
            Some(ret)
        );
        assert_eq!(nearest_post_dominating_hole(&graph, back), back);
    }

    #[test]
    fn fallthrough_check_uses_first_ids() {
        let mut graph = Graph::new();
        let b0 = graph.add_block();
        let b1 = graph.add_block();
        let v = graph.add_node(
            b0,
            &[],
            Some(OperandPolicy::MustHaveRegister),
            NodeProperties::default(),
        ); // id 0
        let jump = graph.set_control(
            b0,
            ControlKind::Jump { target: b1 },
            &[],
            NodeProperties::default(),
        ); // id 1
        graph.set_control(
            b1,
            ControlKind::Return,
            &[(v, OperandPolicy::RegisterOrSlot)],
            NodeProperties::default(),
        ); // id 2
        assert!(is_fallthrough_target(&graph, jump, b1));
    }
}
