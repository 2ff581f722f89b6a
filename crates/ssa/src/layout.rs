//! Block layout: the linear order handed to the machine back end.
//!
//! Reverse postorder with one refinement: when ordering a loop header's
//! successors, blocks inside the loop are visited before blocks outside it,
//! so a loop body lands immediately after its header and the loop-exit edge
//! becomes the taken branch. Join blocks of diamonds come after both arms,
//! as RPO guarantees.

use crate::{Block, DominatorTree, Function, LoopAnalysis};

/// Compute and record the layout on `func`. Unreachable blocks are omitted.
pub fn layout_blocks(func: &mut Function, domtree: &DominatorTree, loops: &LoopAnalysis) {
    let entry = func.entry_block();
    let mut seen = cranelift_entity::SecondaryMap::<Block, bool>::new();
    let mut post: Vec<Block> = Vec::with_capacity(func.num_blocks());
    let mut stack: Vec<(Block, Vec<Block>, usize)> = Vec::new();

    seen[entry] = true;
    stack.push((entry, ordered_successors(func, loops, entry), 0));
    while let Some(frame) = stack.last_mut() {
        if frame.2 < frame.1.len() {
            let s = frame.1[frame.2];
            frame.2 += 1;
            if !seen[s] {
                seen[s] = true;
                let succs = ordered_successors(func, loops, s);
                stack.push((s, succs, 0));
            }
        } else {
            post.push(frame.0);
            stack.pop();
        }
    }
    post.reverse();

    debug_assert_eq!(post[0], entry);
    debug_assert!(post.iter().all(|&b| domtree.is_reachable(b)));
    func.layout = post;
}

/// Successors of `block`, in-loop edges last so the DFS postorder places
/// in-loop blocks right after the header once reversed.
fn ordered_successors(func: &Function, loops: &LoopAnalysis, block: Block) -> Vec<Block> {
    let mut succs = DominatorTree::successors(func, block);
    if let Some(header) = loops.loop_of(block) {
        // Stable partition: out-of-loop targets first in postorder means
        // they end up after the loop body in the reversed order.
        succs.sort_by_key(|&s| loops.loop_of(s) == Some(header));
    }
    succs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionBuilder, Type};

    #[test]
    fn loop_body_follows_header() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let header = fb.create_block();
        let exit = fb.create_block();
        let body = fb.create_block();

        fb.switch_to_block(entry);
        let c = fb.func.append_block_param(entry, Type::I32);
        fb.jump(header, &[]);
        fb.switch_to_block(header);
        fb.brnz(c, exit, &[]);
        fb.jump(body, &[]);
        fb.switch_to_block(body);
        fb.jump(header, &[]);
        fb.switch_to_block(exit);
        fb.return_(&[]);
        fb.seal_all_blocks();

        let dt = DominatorTree::compute(&func);
        let la = LoopAnalysis::compute(&func, &dt);
        layout_blocks(&mut func, &dt, &la);

        let order = func.layout_order();
        assert_eq!(order[0], entry);
        let header_pos = order.iter().position(|&b| b == header).unwrap();
        let body_pos = order.iter().position(|&b| b == body).unwrap();
        let exit_pos = order.iter().position(|&b| b == exit).unwrap();
        assert_eq!(body_pos, header_pos + 1, "loop body falls through");
        assert!(exit_pos > body_pos, "exit placed after the loop");
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let dead = fb.create_block();
        fb.switch_to_block(entry);
        fb.return_(&[]);
        fb.switch_to_block(dead);
        fb.return_(&[]);
        fb.seal_all_blocks();

        let dt = DominatorTree::compute(&func);
        let la = LoopAnalysis::compute(&func, &dt);
        layout_blocks(&mut func, &dt, &la);
        assert_eq!(func.layout_order(), &[entry]);
    }
}
