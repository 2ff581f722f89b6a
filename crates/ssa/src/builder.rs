//! Function construction, including incremental SSA form.
//!
//! The builder tracks frontend *variables* (wasm locals and operand-stack
//! slots that live across control flow) and materializes block parameters on
//! demand: reading a variable in a block with multiple predecessors places a
//! parameter (a φ) and threads the value through every incoming branch.
//! Blocks whose predecessor set is not yet final are *unsealed*; reads in
//! them create incomplete φs that are resolved when [`FunctionBuilder::
//! seal_block`] is called. This is the construction algorithm of Braun et
//! al.; trivial φs discovered during construction are aliased away and the
//! φ-elimination pass removes the leftover parameters afterwards.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    AtomicRmwOp, Block, FloatCC, FuncRef, Function, Inst, InstData, IntCC, Opcode, Sig, TrapCode,
    Type, Value, Variable, VecLanes,
};

/// Builds one [`Function`]. Holds the SSA-construction state that does not
/// survive into the finished function.
pub struct FunctionBuilder<'a> {
    pub func: &'a mut Function,
    current: PackedOption<Block>,
    var_types: PrimaryMap<Variable, Type>,
    defs: FxHashMap<(Variable, Block), Value>,
    /// Incomplete φs per unsealed block.
    incomplete: FxHashMap<Block, Vec<(Variable, Value)>>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(func: &'a mut Function) -> Self {
        Self {
            func,
            current: None.into(),
            var_types: PrimaryMap::new(),
            defs: FxHashMap::default(),
            incomplete: FxHashMap::default(),
        }
    }

    // ---- blocks ----

    pub fn create_block(&mut self) -> Block {
        self.func.make_block()
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.current = Some(block).into();
    }

    pub fn current_block(&self) -> Block {
        self.current.expand().expect("no current block")
    }

    /// Declare that all of `block`'s predecessors are known, resolving any
    /// incomplete φs.
    pub fn seal_block(&mut self, block: Block) {
        debug_assert!(!self.func.is_sealed(block), "{block} sealed twice");
        if let Some(pending) = self.incomplete.remove(&block) {
            for (var, phi) in pending {
                self.add_phi_operands(var, block, phi);
            }
        }
        self.func.blocks[block].sealed = true;
    }

    /// Seal every block that is still open. Only valid once the function
    /// body is complete.
    pub fn seal_all_blocks(&mut self) {
        for block in self.func.blocks().collect::<Vec<_>>() {
            if !self.func.is_sealed(block) {
                self.seal_block(block);
            }
        }
    }

    // ---- variables ----

    pub fn declare_variable(&mut self, ty: Type) -> Variable {
        self.var_types.push(ty)
    }

    pub fn def_var(&mut self, var: Variable, value: Value) {
        let block = self.current_block();
        debug_assert_eq!(
            self.func.value_type(value),
            self.var_types[var],
            "type mismatch defining {var}"
        );
        self.defs.insert((var, block), value);
    }

    /// The current value of `var`, inserting φs as needed.
    pub fn use_var(&mut self, var: Variable) -> Value {
        let block = self.current_block();
        let v = self.read_variable(var, block);
        self.func.resolve_alias(v)
    }

    fn read_variable(&mut self, var: Variable, block: Block) -> Value {
        // Walk single-predecessor chains iteratively so deep straight-line
        // control flow does not recurse.
        let mut chain: SmallVec<[Block; 16]> = SmallVec::new();
        let mut cur = block;
        let value = loop {
            if let Some(&v) = self.defs.get(&(var, cur)) {
                break v;
            }
            if self.func.is_sealed(cur) && self.func.block_preds(cur).len() == 1 {
                chain.push(cur);
                cur = self.func.block_preds(cur)[0].block;
                continue;
            }
            break self.read_variable_slow(var, cur);
        };
        for b in chain {
            self.defs.insert((var, b), value);
        }
        value
    }

    fn read_variable_slow(&mut self, var: Variable, block: Block) -> Value {
        let ty = self.var_types[var];
        if !self.func.is_sealed(block) {
            let phi = self.func.append_block_param(block, ty);
            self.incomplete.entry(block).or_default().push((var, phi));
            self.defs.insert((var, block), phi);
            return phi;
        }
        debug_assert!(
            !self.func.block_preds(block).is_empty(),
            "read of {var} in unreachable sealed {block} with no definition"
        );
        // Multiple predecessors: place a φ first so loops terminate, then
        // fill in the operands.
        let phi = self.func.append_block_param(block, ty);
        self.defs.insert((var, block), phi);
        self.add_phi_operands(var, block, phi)
    }

    fn add_phi_operands(&mut self, var: Variable, block: Block, phi: Value) -> Value {
        let preds: SmallVec<[crate::Pred; 4]> =
            self.func.block_preds(block).iter().copied().collect();
        for pred in &preds {
            let arg = self.read_variable(var, pred.block);
            self.func.append_branch_arg(pred.inst, block, arg);
        }
        self.try_remove_trivial_phi(block, phi)
    }

    /// If every operand of `phi` is the same value (or `phi` itself), alias
    /// it away. The parameter and its branch arguments stay in place; the
    /// φ-elimination pass deletes them once construction is done.
    fn try_remove_trivial_phi(&mut self, block: Block, phi: Value) -> Value {
        let index = self
            .func
            .block_params(block)
            .iter()
            .position(|&p| p == phi)
            .expect("phi is a param of its block");
        let mut same: Option<Value> = None;
        for pred in self.func.block_preds(block) {
            let arg = self.func.resolve_alias(self.func.branch_args(pred.inst)[index]);
            if arg == phi || Some(arg) == same {
                continue;
            }
            if same.is_some() {
                return phi; // two distinct operands: not trivial
            }
            same = Some(arg);
        }
        let same = same.expect("phi has no operand other than itself");
        self.func.set_alias(phi, same);
        same
    }

    // ---- instruction constructors ----

    fn insert(&mut self, data: InstData) -> Inst {
        let block = self.current_block();
        self.func.append_inst(block, data)
    }

    fn insert_one(&mut self, data: InstData) -> Value {
        let inst = self.insert(data);
        self.func.first_result(inst)
    }

    pub fn get_exec_ctx(&mut self) -> Value {
        self.insert_one(InstData::GetExecCtx)
    }

    pub fn iconst(&mut self, ty: Type, imm: u64) -> Value {
        debug_assert!(ty.is_int());
        self.insert_one(InstData::Iconst { ty, imm })
    }

    pub fn f32const(&mut self, bits: u32) -> Value {
        self.insert_one(InstData::F32const { bits })
    }

    pub fn f64const(&mut self, bits: u64) -> Value {
        self.insert_one(InstData::F64const { bits })
    }

    pub fn vconst(&mut self, bits: u128) -> Value {
        self.insert_one(InstData::Vconst { bits })
    }

    pub fn unary(&mut self, opcode: Opcode, ty: Type, arg: Value) -> Value {
        self.insert_one(InstData::Unary { opcode, ty, arg })
    }

    pub fn binary(&mut self, opcode: Opcode, ty: Type, a: Value, b: Value) -> Value {
        self.insert_one(InstData::Binary {
            opcode,
            ty,
            args: [a, b],
        })
    }

    pub fn icmp(&mut self, cond: IntCC, a: Value, b: Value) -> Value {
        self.insert_one(InstData::IntCompare { cond, args: [a, b] })
    }

    pub fn fcmp(&mut self, cond: FloatCC, a: Value, b: Value) -> Value {
        self.insert_one(InstData::FloatCompare { cond, args: [a, b] })
    }

    pub fn select(&mut self, cond: Value, then: Value, else_: Value) -> Value {
        self.insert_one(InstData::Select {
            args: [cond, then, else_],
        })
    }

    pub fn load(&mut self, opcode: Opcode, ty: Type, addr: Value, offset: u32) -> Value {
        debug_assert!(opcode.is_load());
        self.insert_one(InstData::Load {
            opcode,
            ty,
            addr,
            offset,
        })
    }

    pub fn store(&mut self, opcode: Opcode, value: Value, addr: Value, offset: u32) {
        debug_assert!(opcode.is_store());
        self.insert(InstData::Store {
            opcode,
            args: [value, addr],
            offset,
        });
    }

    pub fn splat(&mut self, lanes: VecLanes, arg: Value) -> Value {
        self.insert_one(InstData::Splat { lanes, arg })
    }

    pub fn extract_lane(&mut self, lanes: VecLanes, lane: u8, arg: Value) -> Value {
        self.insert_one(InstData::ExtractLane { lanes, lane, arg })
    }

    pub fn insert_lane(&mut self, lanes: VecLanes, lane: u8, vector: Value, scalar: Value) -> Value {
        self.insert_one(InstData::InsertLane {
            lanes,
            lane,
            args: [vector, scalar],
        })
    }

    pub fn vec_binary(&mut self, opcode: Opcode, lanes: VecLanes, a: Value, b: Value) -> Value {
        self.insert_one(InstData::VecBinary {
            opcode,
            lanes,
            args: [a, b],
        })
    }

    pub fn atomic_load(&mut self, ty: Type, addr: Value) -> Value {
        self.insert_one(InstData::AtomicLoad { ty, addr })
    }

    pub fn atomic_store(&mut self, ty: Type, value: Value, addr: Value) {
        self.insert(InstData::AtomicStore {
            ty,
            args: [value, addr],
        });
    }

    pub fn atomic_rmw(&mut self, op: AtomicRmwOp, ty: Type, addr: Value, operand: Value) -> Value {
        self.insert_one(InstData::AtomicRmw {
            op,
            ty,
            args: [addr, operand],
        })
    }

    pub fn atomic_cas(
        &mut self,
        ty: Type,
        addr: Value,
        expected: Value,
        replacement: Value,
    ) -> Value {
        self.insert_one(InstData::AtomicCas {
            ty,
            args: [addr, expected, replacement],
        })
    }

    pub fn fence(&mut self) {
        self.insert(InstData::Fence);
    }

    pub fn jump(&mut self, dest: Block, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::Jump { dest, args })
    }

    pub fn brz(&mut self, arg: Value, dest: Block, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::Brz { arg, dest, args })
    }

    pub fn brnz(&mut self, arg: Value, dest: Block, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::Brnz { arg, dest, args })
    }

    pub fn br_table(&mut self, arg: Value, targets: Vec<Block>, default: Block) -> Inst {
        let table = self.func.create_jump_table(targets, default);
        self.insert(InstData::BrTable { arg, table })
    }

    pub fn call(&mut self, func: FuncRef, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::Call { func, args })
    }

    pub fn call_indirect(&mut self, sig: Sig, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::CallIndirect { sig, args })
    }

    pub fn return_(&mut self, args: &[Value]) -> Inst {
        let args = self.make_list(args);
        self.insert(InstData::Return { args })
    }

    pub fn trap(&mut self, code: TrapCode) -> Inst {
        self.insert(InstData::Trap { code })
    }

    pub fn nop(&mut self) -> Inst {
        self.insert(InstData::Nop)
    }

    fn make_list(&mut self, args: &[Value]) -> cranelift_entity::EntityList<Value> {
        cranelift_entity::EntityList::from_slice(args, &mut self.func.value_pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signature;

    /// Straight-line redefinition: no φ should appear.
    #[test]
    fn straight_line_variable() {
        let mut func = Function::new();
        func.signature = Signature::new(vec![Type::I32], vec![Type::I32]);
        let mut b = FunctionBuilder::new(&mut func);

        let entry = b.create_block();
        b.switch_to_block(entry);
        let p = b.func.append_block_param(entry, Type::I32);
        b.seal_block(entry);

        let var = b.declare_variable(Type::I32);
        b.def_var(var, p);
        let one = b.iconst(Type::I32, 1);
        let v = b.use_var(var);
        let sum = b.binary(Opcode::Iadd, Type::I32, v, one);
        b.def_var(var, sum);
        let out = b.use_var(var);
        b.return_(&[out]);

        assert_eq!(out, sum);
        assert_eq!(b.func.block_params(entry).len(), 1);
    }

    /// A diamond merge must create exactly one φ for the merged variable.
    #[test]
    fn diamond_creates_phi() {
        let mut func = Function::new();
        let mut b = FunctionBuilder::new(&mut func);

        let entry = b.create_block();
        let then = b.create_block();
        let els = b.create_block();
        let merge = b.create_block();

        b.switch_to_block(entry);
        let cond = b.func.append_block_param(entry, Type::I32);
        b.seal_block(entry);
        let var = b.declare_variable(Type::I32);
        let zero = b.iconst(Type::I32, 0);
        b.def_var(var, zero);
        b.brnz(cond, then, &[]);
        b.jump(els, &[]);
        b.seal_block(then);
        b.seal_block(els);

        b.switch_to_block(then);
        let ten = b.iconst(Type::I32, 10);
        b.def_var(var, ten);
        b.jump(merge, &[]);

        b.switch_to_block(els);
        let twenty = b.iconst(Type::I32, 20);
        b.def_var(var, twenty);
        b.jump(merge, &[]);

        b.seal_block(merge);
        b.switch_to_block(merge);
        let merged = b.use_var(var);
        b.return_(&[merged]);

        assert_eq!(b.func.block_params(merge).len(), 1);
        assert_eq!(b.func.block_params(merge)[0], merged);
        // Both incoming jumps carry the value.
        let preds = b.func.block_preds(merge).to_vec();
        assert_eq!(preds.len(), 2);
        for pred in preds {
            assert_eq!(b.func.branch_args(pred.inst).len(), 1);
        }
    }

    /// Reading through an unsealed loop header leaves an incomplete φ that
    /// seal resolves; a loop-invariant variable ends up with a trivial φ
    /// aliased back to its definition.
    #[test]
    fn loop_invariant_phi_is_trivial() {
        let mut func = Function::new();
        let mut b = FunctionBuilder::new(&mut func);

        let entry = b.create_block();
        let header = b.create_block();
        let exit = b.create_block();

        b.switch_to_block(entry);
        b.seal_block(entry);
        let var = b.declare_variable(Type::I64);
        let init = b.iconst(Type::I64, 7);
        b.def_var(var, init);
        b.jump(header, &[]);

        b.switch_to_block(header);
        let inside = b.use_var(var); // creates incomplete φ
        b.brnz(inside, header, &[]);
        b.jump(exit, &[]);
        b.seal_block(header);
        b.seal_block(exit);

        b.switch_to_block(exit);
        let after = b.use_var(var);
        b.return_(&[after]);

        // The φ was trivial: every read resolves to the initial constant.
        assert_eq!(b.func.resolve_alias(inside), init);
        assert_eq!(after, init);
    }
}
