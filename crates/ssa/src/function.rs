//! The function container: instructions, values, blocks and their plumbing.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntityList, ListPool, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::{Block, FuncRef, Inst, InstData, JumpTable, Sig, Type, Value};

/// A function signature. For wasm functions the first parameter is always
/// the callee's module-context pointer (an i64); the execution context rides
/// in the pinned register and never appears here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
}

impl Signature {
    pub fn new(params: Vec<Type>, returns: Vec<Type>) -> Self {
        Self { params, returns }
    }
}

/// A callee declared in a function, named by its index in the module's
/// function index space.
#[derive(Clone, Debug)]
pub struct ExtFuncData {
    pub index: u32,
    pub sig: Sig,
}

/// Jump-table contents: case targets plus the default.
#[derive(Clone, Debug)]
pub struct JumpTableData {
    pub targets: Vec<Block>,
    pub default: Block,
}

/// A predecessor edge: the branching block and the branch instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pred {
    pub block: Block,
    pub inst: Inst,
}

#[derive(Clone, Default)]
pub(crate) struct BlockData {
    pub params: EntityList<Value>,
    pub preds: Vec<Pred>,
    pub insts: Vec<Inst>,
    pub sealed: bool,
}

/// Where a value comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueDef {
    /// The `n`th result of an instruction.
    Result(Inst, u16),
    /// The `n`th parameter of a block.
    Param(Block, u16),
}

#[derive(Clone, Debug)]
pub(crate) struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

/// A function under construction or compilation.
pub struct Function {
    pub name: String,
    pub signature: Signature,
    pub(crate) insts: PrimaryMap<Inst, InstData>,
    results: SecondaryMap<Inst, EntityList<Value>>,
    pub(crate) values: PrimaryMap<Value, ValueData>,
    aliases: SecondaryMap<Value, PackedOption<Value>>,
    pub value_pool: ListPool<Value>,
    pub(crate) blocks: PrimaryMap<Block, BlockData>,
    pub sigs: PrimaryMap<Sig, Signature>,
    pub ext_funcs: PrimaryMap<FuncRef, ExtFuncData>,
    pub jump_tables: PrimaryMap<JumpTable, JumpTableData>,
    entry: PackedOption<Block>,
    /// Linear block order produced by the layout pass; empty until then.
    pub(crate) layout: Vec<Block>,
}

impl Function {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            signature: Signature::default(),
            insts: PrimaryMap::new(),
            results: SecondaryMap::new(),
            values: PrimaryMap::new(),
            aliases: SecondaryMap::new(),
            value_pool: ListPool::new(),
            blocks: PrimaryMap::new(),
            sigs: PrimaryMap::new(),
            ext_funcs: PrimaryMap::new(),
            jump_tables: PrimaryMap::new(),
            entry: None.into(),
            layout: Vec::new(),
        }
    }

    /// Reset to a pristine state, keeping allocations.
    pub fn clear(&mut self) {
        self.name.clear();
        self.signature = Signature::default();
        self.insts.clear();
        self.results.clear();
        self.values.clear();
        self.aliases.clear();
        self.value_pool.clear();
        self.blocks.clear();
        self.sigs.clear();
        self.ext_funcs.clear();
        self.jump_tables.clear();
        self.entry = None.into();
        self.layout.clear();
    }

    // ---- blocks ----

    pub fn make_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        if self.entry.is_none() {
            self.entry = Some(block).into();
        }
        block
    }

    pub fn entry_block(&self) -> Block {
        self.entry.expand().expect("function has no blocks")
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> + use<> {
        (0..self.blocks.len() as u32).map(Block::from_u32)
    }

    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        let index = self.blocks[block].params.len(&self.value_pool) as u16;
        let value = self.values.push(ValueData {
            ty,
            def: ValueDef::Param(block, index),
        });
        self.blocks[block].params.push(value, &mut self.value_pool);
        value
    }

    pub fn block_params(&self, block: Block) -> &[Value] {
        self.blocks[block].params.as_slice(&self.value_pool)
    }

    pub fn block_preds(&self, block: Block) -> &[Pred] {
        &self.blocks[block].preds
    }

    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    pub fn is_sealed(&self, block: Block) -> bool {
        self.blocks[block].sealed
    }

    /// Whether the block already ends in a terminator.
    pub fn is_block_terminated(&self, block: Block) -> bool {
        self.blocks[block]
            .insts
            .last()
            .is_some_and(|&i| self.insts[i].is_terminator())
    }

    // ---- instructions ----

    pub fn inst_data(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_data_mut(&mut self, inst: Inst) -> &mut InstData {
        &mut self.insts[inst]
    }

    /// Create an instruction, its result values, and append it to `block`.
    /// Branch instructions also record the predecessor edge on their targets.
    pub fn append_inst(&mut self, block: Block, data: InstData) -> Inst {
        debug_assert!(
            !self.is_block_terminated(block),
            "appending instruction to a terminated {block}",
        );
        let inst = self.insts.push(data);
        self.make_inst_results(inst);
        self.blocks[block].insts.push(inst);
        for target in self.branch_targets(inst) {
            debug_assert!(
                !self.blocks[target].sealed,
                "new branch into sealed {target}"
            );
            self.blocks[target].preds.push(Pred { block, inst });
        }
        inst
    }

    fn make_inst_results(&mut self, inst: Inst) {
        let tys = self.result_types(inst);
        let mut list = EntityList::new();
        for (i, ty) in tys.into_iter().enumerate() {
            let value = self.values.push(ValueData {
                ty,
                def: ValueDef::Result(inst, i as u16),
            });
            list.push(value, &mut self.value_pool);
        }
        self.results[inst] = list;
    }

    fn result_types(&self, inst: Inst) -> SmallVec<[Type; 2]> {
        use InstData::*;
        match self.insts[inst] {
            GetExecCtx => [Type::I64].into_iter().collect(),
            Iconst { ty, .. } => [ty].into_iter().collect(),
            F32const { .. } => [Type::F32].into_iter().collect(),
            F64const { .. } => [Type::F64].into_iter().collect(),
            Vconst { .. } => [Type::V128].into_iter().collect(),
            Unary { ty, .. } | Binary { ty, .. } | Load { ty, .. } => {
                [ty].into_iter().collect()
            }
            IntCompare { .. } | FloatCompare { .. } => [Type::I32].into_iter().collect(),
            Select { args } => [self.value_type(args[1])].into_iter().collect(),
            Splat { .. } | InsertLane { .. } | VecBinary { .. } => {
                [Type::V128].into_iter().collect()
            }
            ExtractLane { lanes, .. } => [lanes.lane_type()].into_iter().collect(),
            AtomicLoad { ty, .. } | AtomicRmw { ty, .. } | AtomicCas { ty, .. } => {
                [ty].into_iter().collect()
            }
            Call { func, .. } => {
                let sig = self.ext_funcs[func].sig;
                self.sigs[sig].returns.iter().copied().collect()
            }
            CallIndirect { sig, .. } => self.sigs[sig].returns.iter().copied().collect(),
            Nop
            | Store { .. }
            | AtomicStore { .. }
            | Fence
            | Jump { .. }
            | Brz { .. }
            | Brnz { .. }
            | BrTable { .. }
            | Return { .. }
            | Trap { .. } => SmallVec::new(),
        }
    }

    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        self.results[inst].as_slice(&self.value_pool)
    }

    /// The single result of an instruction that has exactly one.
    pub fn first_result(&self, inst: Inst) -> Value {
        let results = self.inst_results(inst);
        debug_assert_eq!(results.len(), 1);
        results[0]
    }

    /// All blocks an instruction may branch to.
    pub fn branch_targets(&self, inst: Inst) -> SmallVec<[Block; 4]> {
        match &self.insts[inst] {
            InstData::Jump { dest, .. }
            | InstData::Brz { dest, .. }
            | InstData::Brnz { dest, .. } => [*dest].into_iter().collect(),
            InstData::BrTable { table, .. } => {
                let data = &self.jump_tables[*table];
                let mut out: SmallVec<[Block; 4]> = data.targets.iter().copied().collect();
                out.push(data.default);
                out
            }
            _ => SmallVec::new(),
        }
    }

    /// All value operands of an instruction, branch arguments included.
    pub fn inst_args(&self, inst: Inst) -> SmallVec<[Value; 4]> {
        use InstData::*;
        let mut out = SmallVec::new();
        match &self.insts[inst] {
            Nop | GetExecCtx | Iconst { .. } | F32const { .. } | F64const { .. }
            | Vconst { .. } | Fence | Trap { .. } => {}
            Unary { arg, .. }
            | Load { addr: arg, .. }
            | Splat { arg, .. }
            | ExtractLane { arg, .. }
            | AtomicLoad { addr: arg, .. } => out.push(*arg),
            Binary { args, .. }
            | IntCompare { args, .. }
            | FloatCompare { args, .. }
            | Store { args, .. }
            | InsertLane { args, .. }
            | VecBinary { args, .. }
            | AtomicStore { args, .. }
            | AtomicRmw { args, .. } => out.extend_from_slice(args),
            Select { args } | AtomicCas { args, .. } => out.extend_from_slice(args),
            Jump { args, .. } => out.extend_from_slice(args.as_slice(&self.value_pool)),
            Brz { arg, args, .. } | Brnz { arg, args, .. } => {
                out.push(*arg);
                out.extend_from_slice(args.as_slice(&self.value_pool));
            }
            BrTable { arg, .. } => out.push(*arg),
            Call { args, .. } | CallIndirect { args, .. } | Return { args } => {
                out.extend_from_slice(args.as_slice(&self.value_pool));
            }
        }
        out
    }

    /// Rewrite every value operand of `inst` through `map`.
    pub fn map_inst_args(&mut self, inst: Inst, map: &mut dyn FnMut(Value) -> Value) {
        use InstData::*;
        // Lists are edited through the pool, so take the data apart first.
        let mut lists: SmallVec<[EntityList<Value>; 1]> = SmallVec::new();
        match &mut self.insts[inst] {
            Nop | GetExecCtx | Iconst { .. } | F32const { .. } | F64const { .. }
            | Vconst { .. } | Fence | Trap { .. } => {}
            Unary { arg, .. }
            | Load { addr: arg, .. }
            | Splat { arg, .. }
            | ExtractLane { arg, .. }
            | AtomicLoad { addr: arg, .. }
            | BrTable { arg, .. } => *arg = map(*arg),
            Binary { args, .. }
            | IntCompare { args, .. }
            | FloatCompare { args, .. }
            | Store { args, .. }
            | InsertLane { args, .. }
            | VecBinary { args, .. }
            | AtomicStore { args, .. }
            | AtomicRmw { args, .. } => {
                for a in args.iter_mut() {
                    *a = map(*a);
                }
            }
            Select { args } | AtomicCas { args, .. } => {
                for a in args.iter_mut() {
                    *a = map(*a);
                }
            }
            Jump { args, .. } => lists.push(args.clone()),
            Brz { arg, args, .. } | Brnz { arg, args, .. } => {
                *arg = map(*arg);
                lists.push(args.clone());
            }
            Call { args, .. } | CallIndirect { args, .. } | Return { args } => {
                lists.push(args.clone())
            }
        }
        for mut list in lists {
            for a in list.as_mut_slice(&mut self.value_pool) {
                *a = map(*a);
            }
        }
    }

    /// Append a block argument to the branch `inst` edge into `dest`.
    /// Used by φ placement; jump-table edges cannot carry arguments.
    pub fn append_branch_arg(&mut self, inst: Inst, dest: Block, value: Value) {
        let pool = &mut self.value_pool;
        match &mut self.insts[inst] {
            InstData::Jump { dest: d, args }
            | InstData::Brz { dest: d, args, .. }
            | InstData::Brnz { dest: d, args, .. } => {
                debug_assert_eq!(*d, dest);
                args.push(value, pool);
            }
            InstData::BrTable { .. } => {
                panic!("jump-table edges cannot carry block arguments")
            }
            other => panic!("not a branch: {other:?}"),
        }
    }

    /// The branch arguments `inst` passes into `dest`.
    pub fn branch_args(&self, inst: Inst) -> &[Value] {
        match &self.insts[inst] {
            InstData::Jump { args, .. }
            | InstData::Brz { args, .. }
            | InstData::Brnz { args, .. } => args.as_slice(&self.value_pool),
            InstData::BrTable { .. } => &[],
            other => panic!("not a branch: {other:?}"),
        }
    }

    // ---- values ----

    pub fn value_type(&self, value: Value) -> Type {
        self.values[self.resolve_alias(value)].ty
    }

    pub fn value_def(&self, value: Value) -> ValueDef {
        self.values[self.resolve_alias(value)].def
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Declare `from` to be an alias of `to`. Readers see through aliases via
    /// [`Function::resolve_alias`]; [`passes::run_passes`] rewrites operands
    /// so none survive into the back end.
    ///
    /// [`passes::run_passes`]: crate::passes::run_passes
    pub fn set_alias(&mut self, from: Value, to: Value) {
        debug_assert_ne!(self.resolve_alias(to), from, "alias cycle through {from}");
        self.aliases[from] = Some(to).into();
    }

    pub fn resolve_alias(&self, value: Value) -> Value {
        let mut cur = value;
        let mut steps = 0;
        while let Some(next) = self.aliases[cur].expand() {
            cur = next;
            steps += 1;
            debug_assert!(steps <= self.values.len(), "alias cycle at {value}");
        }
        cur
    }

    // ---- declarations ----

    pub fn import_signature(&mut self, sig: Signature) -> Sig {
        self.sigs.push(sig)
    }

    pub fn import_function(&mut self, index: u32, sig: Sig) -> FuncRef {
        self.ext_funcs.push(ExtFuncData { index, sig })
    }

    pub fn create_jump_table(&mut self, targets: Vec<Block>, default: Block) -> JumpTable {
        self.jump_tables.push(JumpTableData { targets, default })
    }

    /// The linear block order computed by the layout pass.
    pub fn layout_order(&self) -> &[Block] {
        debug_assert!(!self.layout.is_empty(), "layout pass has not run");
        &self.layout
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}
