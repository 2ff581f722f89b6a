//! Dominator tree computation.
//!
//! Iterative RPO-based dominance (Cooper, Harvey, Kennedy): number the
//! reachable blocks in reverse postorder, then intersect predecessor idoms to
//! a fixpoint. The CFG here is small per function, so the simple algorithm
//! beats anything asymptotically fancier.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::{Block, Function};

pub struct DominatorTree {
    /// Immediate dominator of each reachable block; the entry maps to itself.
    idom: SecondaryMap<Block, PackedOption<Block>>,
    /// RPO number of each reachable block, 1-based; 0 means unreachable.
    rpo_number: SecondaryMap<Block, u32>,
    /// Reachable blocks in reverse postorder.
    postorder_rev: Vec<Block>,
}

impl DominatorTree {
    pub fn compute(func: &Function) -> Self {
        let entry = func.entry_block();
        let postorder = Self::postorder(func, entry);
        let mut postorder_rev: Vec<Block> = postorder.clone();
        postorder_rev.reverse();

        let mut rpo_number = SecondaryMap::new();
        for (i, &b) in postorder_rev.iter().enumerate() {
            rpo_number[b] = i as u32 + 1;
        }

        let mut idom: SecondaryMap<Block, PackedOption<Block>> = SecondaryMap::new();
        idom[entry] = Some(entry).into();
        let mut changed = true;
        while changed {
            changed = false;
            for &b in postorder_rev.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for pred in func.block_preds(b) {
                    let p = pred.block;
                    if rpo_number[p] == 0 || idom[p].is_none() {
                        continue; // unreachable or not yet processed
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => Self::intersect(&idom, &rpo_number, p, cur),
                    });
                }
                if let Some(n) = new_idom {
                    if idom[b].expand() != Some(n) {
                        idom[b] = Some(n).into();
                        changed = true;
                    }
                }
            }
        }

        Self {
            idom,
            rpo_number,
            postorder_rev,
        }
    }

    fn postorder(func: &Function, entry: Block) -> Vec<Block> {
        let mut seen = SecondaryMap::<Block, bool>::new();
        let mut post = Vec::new();
        // (block, next successor index) stack.
        let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
        seen[entry] = true;
        while let Some(frame) = stack.last_mut() {
            let (block, next) = *frame;
            let succs = Self::successors(func, block);
            if next < succs.len() {
                frame.1 += 1;
                let s = succs[next];
                if !seen[s] {
                    seen[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post
    }

    pub(crate) fn successors(func: &Function, block: Block) -> Vec<Block> {
        let mut out = Vec::new();
        for &inst in func.block_insts(block) {
            for t in func.branch_targets(inst) {
                if !out.contains(&t) {
                    out.push(t);
                }
            }
        }
        out
    }

    fn intersect(
        idom: &SecondaryMap<Block, PackedOption<Block>>,
        rpo: &SecondaryMap<Block, u32>,
        mut a: Block,
        mut b: Block,
    ) -> Block {
        while a != b {
            while rpo[a] > rpo[b] {
                a = idom[a].expand().unwrap();
            }
            while rpo[b] > rpo[a] {
                b = idom[b].expand().unwrap();
            }
        }
        a
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        let d = self.idom[block].expand()?;
        if d == block { None } else { Some(d) }
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.rpo_number[block] != 0
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }

    /// Reachable blocks in reverse postorder.
    pub fn rpo(&self) -> &[Block] {
        &self.postorder_rev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionBuilder, Type};

    /// entry → {a, b} → merge; merge's idom is entry, not a or b.
    #[test]
    fn diamond_idoms() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let a = fb.create_block();
        let b = fb.create_block();
        let merge = fb.create_block();

        fb.switch_to_block(entry);
        let c = fb.func.append_block_param(entry, Type::I32);
        fb.brnz(c, a, &[]);
        fb.jump(b, &[]);
        fb.switch_to_block(a);
        fb.jump(merge, &[]);
        fb.switch_to_block(b);
        fb.jump(merge, &[]);
        fb.switch_to_block(merge);
        fb.return_(&[]);
        fb.seal_all_blocks();

        let dt = DominatorTree::compute(&func);
        assert_eq!(dt.idom(entry), None);
        assert_eq!(dt.idom(a), Some(entry));
        assert_eq!(dt.idom(b), Some(entry));
        assert_eq!(dt.idom(merge), Some(entry));
        assert!(dt.dominates(entry, merge));
        assert!(!dt.dominates(a, merge));
        assert!(dt.dominates(merge, merge));
    }

    /// A loop back edge does not disturb dominance of the header.
    #[test]
    fn loop_dominance() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let header = fb.create_block();
        let body = fb.create_block();
        let exit = fb.create_block();

        fb.switch_to_block(entry);
        let c = fb.func.append_block_param(entry, Type::I32);
        fb.jump(header, &[]);
        fb.switch_to_block(header);
        fb.brnz(c, body, &[]);
        fb.jump(exit, &[]);
        fb.switch_to_block(body);
        fb.jump(header, &[]);
        fb.switch_to_block(exit);
        fb.return_(&[]);
        fb.seal_all_blocks();

        let dt = DominatorTree::compute(&func);
        assert_eq!(dt.idom(header), Some(entry));
        assert_eq!(dt.idom(body), Some(header));
        assert_eq!(dt.idom(exit), Some(header));
        assert!(dt.dominates(header, body));
        assert!(!dt.dominates(body, header));
    }
}
