//! Virtual-register machine code, between lowering and emission.

use crate::aarch64::inst::Inst;
use crate::buffer::Label;
use crate::reg::RegClass;

/// One lowered basic block.
pub struct VCodeBlock {
    pub label: Label,
    pub insts: Vec<Inst>,
    /// Successor block indices, for liveness.
    pub succs: Vec<usize>,
}

/// A lowered function body, in final block order.
pub struct VCode {
    pub blocks: Vec<VCodeBlock>,
    /// Number of virtual registers per class.
    pub num_vregs: [u32; 2],
    /// Spill-slot width in bytes per virtual register (8 or 16), indexed as
    /// `[class][vreg]`.
    pub vreg_bytes: [Vec<u8>; 2],
    /// Bytes of outgoing-argument area this function needs below its spills.
    pub out_args_size: u32,
}

impl VCode {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            num_vregs: [0, 0],
            vreg_bytes: [Vec::new(), Vec::new()],
            out_args_size: 0,
        }
    }

    pub fn class_index(class: RegClass) -> usize {
        match class {
            RegClass::Int => 0,
            RegClass::Float => 1,
        }
    }
}

impl Default for VCode {
    fn default() -> Self {
        Self::new()
    }
}
