//! Natural-loop detection.
//!
//! A block is a loop header when one of its predecessors is a block it
//! dominates (a back edge). Loop membership is the set of blocks that can
//! reach a back-edge source without passing through the header; layout uses
//! it to keep loop bodies contiguous.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::{Block, DominatorTree, Function};

pub struct LoopAnalysis {
    /// The innermost loop header a block belongs to (headers map to
    /// themselves).
    loop_header: SecondaryMap<Block, PackedOption<Block>>,
    headers: Vec<Block>,
}

impl LoopAnalysis {
    pub fn compute(func: &Function, domtree: &DominatorTree) -> Self {
        let mut analysis = Self {
            loop_header: SecondaryMap::new(),
            headers: Vec::new(),
        };
        // Headers discovered outermost-first thanks to RPO, so inner loops
        // overwrite outer membership below.
        for &block in domtree.rpo() {
            let mut sources = Vec::new();
            for pred in func.block_preds(block) {
                if domtree.dominates(block, pred.block) {
                    sources.push(pred.block);
                }
            }
            if sources.is_empty() {
                continue;
            }
            analysis.headers.push(block);
            analysis.mark_loop(func, domtree, block, &sources);
        }
        analysis
    }

    /// Walk backwards from each back-edge source to the header, claiming
    /// blocks for this loop.
    fn mark_loop(
        &mut self,
        func: &Function,
        domtree: &DominatorTree,
        header: Block,
        sources: &[Block],
    ) {
        self.loop_header[header] = Some(header).into();
        let mut stack: Vec<Block> = sources.to_vec();
        while let Some(block) = stack.pop() {
            if block == header || !domtree.is_reachable(block) {
                continue;
            }
            if self.loop_header[block].expand() == Some(header) {
                continue;
            }
            self.loop_header[block] = Some(header).into();
            for pred in func.block_preds(block) {
                stack.push(pred.block);
            }
        }
    }

    pub fn is_loop_header(&self, block: Block) -> bool {
        self.loop_header[block].expand() == Some(block)
    }

    /// The innermost loop header `block` belongs to, if any.
    pub fn loop_of(&self, block: Block) -> Option<Block> {
        self.loop_header[block].expand()
    }

    pub fn headers(&self) -> &[Block] {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionBuilder, Type};

    #[test]
    fn detects_header_and_body() {
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
        fb.brnz(c, exit, &[]);
        fb.jump(body, &[]);
        fb.switch_to_block(body);
        fb.jump(header, &[]);
        fb.switch_to_block(exit);
        fb.return_(&[]);
        fb.seal_all_blocks();

        let dt = DominatorTree::compute(&func);
        let la = LoopAnalysis::compute(&func, &dt);
        assert!(la.is_loop_header(header));
        assert!(!la.is_loop_header(entry));
        assert_eq!(la.loop_of(body), Some(header));
        assert_eq!(la.loop_of(exit), None);
        assert_eq!(la.headers(), &[header]);
    }
}
