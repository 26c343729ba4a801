//! An in-memory backend that records the requested types, functions, and
//! instructions instead of lowering them. Tests assert against the recorded
//! module directly and run generated programs through [`Interp`], a small
//! reference evaluator, so none of the structural or behavioral checks need
//! a native toolchain.

use rustc_hash::FxHashMap;

use super::{Backend, BinaryOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// Recorded value handles. Constants and instructions share the `Instr`
/// namespace; parameters and functions are their own handle kinds, the way
/// a native backend hands out distinct value refs for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueId {
    Instr(usize),
    Param { function: usize, index: u32 },
    Function(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecTy {
    Int(u32),
    Void,
    Ptr(TypeId),
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        is_var_arg: bool,
    },
    Struct {
        name: String,
        fields: Vec<TypeId>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    ConstInt {
        ty: TypeId,
        value: u64,
    },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    IntEq {
        lhs: ValueId,
        rhs: ValueId,
    },
    CondBr {
        condition: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Br {
        dest: BlockId,
    },
    Phi {
        ty: TypeId,
        incoming: Vec<(ValueId, BlockId)>,
    },
    Call {
        fn_ty: TypeId,
        callee: ValueId,
        args: Vec<ValueId>,
    },
    StackAlloc {
        ty: TypeId,
    },
    HeapAlloc {
        ty: TypeId,
    },
    Load {
        ty: TypeId,
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    Gep {
        struct_ty: TypeId,
        ptr: ValueId,
        index: u32,
    },
    Ret {
        value: ValueId,
    },
    RetVoid,
}

impl Op {
    fn is_terminator(&self) -> bool {
        matches!(self, Op::CondBr { .. } | Op::Br { .. } | Op::Ret { .. } | Op::RetVoid)
    }
}

#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Op,
    /// `None` for constants, which live outside any block.
    pub block: Option<BlockId>,
}

#[derive(Clone, Debug)]
pub struct RecFunction {
    pub name: String,
    pub ty: TypeId,
    pub blocks: Vec<BlockId>,
    pub param_names: Vec<(u32, String)>,
}

#[derive(Clone, Debug)]
pub struct RecBlock {
    pub name: String,
    pub function: usize,
    pub instructions: Vec<usize>,
}

#[derive(Clone, Copy)]
enum InsertPoint {
    End(BlockId),
    Before { block: BlockId, instruction: usize },
}

/// The recorded module.
#[derive(Default)]
pub struct RecordBackend {
    pub types: Vec<RecTy>,
    pub functions: Vec<RecFunction>,
    pub blocks: Vec<RecBlock>,
    pub instructions: Vec<Inst>,
    cursor: Option<InsertPoint>,
}

impl RecordBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_named(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn op(&self, id: ValueId) -> Option<&Op> {
        match id {
            ValueId::Instr(index) => self.instructions.get(index).map(|inst| &inst.op),
            _ => None,
        }
    }

    /// Instruction indices of a function's entry block.
    pub fn entry_instructions(&self, function: usize) -> &[usize] {
        let entry = self.functions[function].blocks[0];
        &self.blocks[entry.0].instructions
    }

    fn intern(&mut self, ty: RecTy) -> TypeId {
        if let Some(index) = self.types.iter().position(|existing| *existing == ty) {
            return TypeId(index);
        }
        self.types.push(ty);
        TypeId(self.types.len() - 1)
    }

    fn emit(&mut self, op: Op) -> ValueId {
        let index = self.instructions.len();
        match self.cursor {
            Some(InsertPoint::End(block)) => {
                self.instructions.push(Inst {
                    op,
                    block: Some(block),
                });
                self.blocks[block.0].instructions.push(index);
            }
            Some(InsertPoint::Before { block, instruction }) => {
                self.instructions.push(Inst {
                    op,
                    block: Some(block),
                });
                let list = &mut self.blocks[block.0].instructions;
                let position = list
                    .iter()
                    .position(|&i| i == instruction)
                    .unwrap_or(list.len());
                list.insert(position, index);
            }
            None => {
                self.instructions.push(Inst { op, block: None });
            }
        }
        ValueId::Instr(index)
    }
}

impl Backend for RecordBackend {
    type TypeRef = TypeId;
    type ValueRef = ValueId;
    type BlockRef = BlockId;

    fn int_type(&mut self, width: u32) -> TypeId {
        self.intern(RecTy::Int(width))
    }

    fn void_type(&mut self) -> TypeId {
        self.intern(RecTy::Void)
    }

    fn function_type(&mut self, ret: TypeId, params: &[TypeId], is_var_arg: bool) -> TypeId {
        self.intern(RecTy::Function {
            ret,
            params: params.to_vec(),
            is_var_arg,
        })
    }

    fn named_struct_type(&mut self, name: &str, fields: &[TypeId]) -> TypeId {
        let existing = self.types.iter().position(
            |ty| matches!(ty, RecTy::Struct { name: existing, .. } if existing == name),
        );
        if let Some(index) = existing {
            return TypeId(index);
        }
        self.types.push(RecTy::Struct {
            name: name.to_string(),
            fields: fields.to_vec(),
        });
        TypeId(self.types.len() - 1)
    }

    fn pointer_type(&mut self, pointee: TypeId) -> TypeId {
        self.intern(RecTy::Ptr(pointee))
    }

    fn add_function(&mut self, name: &str, ty: TypeId) -> ValueId {
        self.functions.push(RecFunction {
            name: name.to_string(),
            ty,
            blocks: Vec::new(),
            param_names: Vec::new(),
        });
        ValueId::Function(self.functions.len() - 1)
    }

    fn param(&mut self, function: ValueId, index: u32) -> ValueId {
        match function {
            ValueId::Function(f) => ValueId::Param { function: f, index },
            other => unreachable!("param of non-function handle {other:?}"),
        }
    }

    fn name_param(&mut self, function: ValueId, index: u32, name: &str) {
        if let ValueId::Function(f) = function {
            self.functions[f].param_names.push((index, name.to_string()));
        }
    }

    fn append_block(&mut self, function: ValueId, name: &str) -> BlockId {
        let ValueId::Function(f) = function else {
            unreachable!("append_block on non-function handle {function:?}");
        };
        let id = BlockId(self.blocks.len());
        self.blocks.push(RecBlock {
            name: name.to_string(),
            function: f,
            instructions: Vec::new(),
        });
        self.functions[f].blocks.push(id);
        id
    }

    fn entry_block(&mut self, function: ValueId) -> BlockId {
        let ValueId::Function(f) = function else {
            unreachable!("entry_block on non-function handle {function:?}");
        };
        self.functions[f].blocks[0]
    }

    fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Some(InsertPoint::End(block));
    }

    fn position_before(&mut self, instruction: ValueId) {
        if let ValueId::Instr(index) = instruction {
            if let Some(block) = self.instructions[index].block {
                self.cursor = Some(InsertPoint::Before {
                    block,
                    instruction: index,
                });
            }
        }
    }

    fn current_block(&mut self) -> Option<BlockId> {
        match self.cursor {
            Some(InsertPoint::End(block)) | Some(InsertPoint::Before { block, .. }) => Some(block),
            None => None,
        }
    }

    fn first_instruction(&mut self, block: BlockId) -> Option<ValueId> {
        self.blocks[block.0].instructions.first().map(|&i| ValueId::Instr(i))
    }

    fn const_int(&mut self, ty: TypeId, value: u64) -> ValueId {
        let index = self.instructions.len();
        self.instructions.push(Inst {
            op: Op::ConstInt { ty, value },
            block: None,
        });
        ValueId::Instr(index)
    }

    fn binary_op(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId, _name: &str) -> ValueId {
        self.emit(Op::Binary { op, lhs, rhs })
    }

    fn int_eq(&mut self, lhs: ValueId, rhs: ValueId, _name: &str) -> ValueId {
        self.emit(Op::IntEq { lhs, rhs })
    }

    fn cond_br(&mut self, condition: ValueId, then_block: BlockId, else_block: BlockId) {
        self.emit(Op::CondBr {
            condition,
            then_block,
            else_block,
        });
    }

    fn br(&mut self, dest: BlockId) {
        self.emit(Op::Br { dest });
    }

    fn phi(&mut self, ty: TypeId, incoming: &[(ValueId, BlockId)], _name: &str) -> ValueId {
        self.emit(Op::Phi {
            ty,
            incoming: incoming.to_vec(),
        })
    }

    fn call(&mut self, fn_ty: TypeId, callee: ValueId, args: &[ValueId], _name: &str) -> ValueId {
        self.emit(Op::Call {
            fn_ty,
            callee,
            args: args.to_vec(),
        })
    }

    fn stack_alloc(&mut self, ty: TypeId, _name: &str) -> ValueId {
        self.emit(Op::StackAlloc { ty })
    }

    fn heap_alloc(&mut self, ty: TypeId, _name: &str) -> ValueId {
        self.emit(Op::HeapAlloc { ty })
    }

    fn load(&mut self, ty: TypeId, ptr: ValueId, _name: &str) -> ValueId {
        self.emit(Op::Load { ty, ptr })
    }

    fn store(&mut self, value: ValueId, ptr: ValueId) {
        self.emit(Op::Store { value, ptr });
    }

    fn struct_gep(&mut self, struct_ty: TypeId, ptr: ValueId, index: u32, _name: &str) -> ValueId {
        self.emit(Op::Gep {
            struct_ty,
            ptr,
            index,
        })
    }

    fn ret(&mut self, value: ValueId) {
        self.emit(Op::Ret { value });
    }

    fn ret_void(&mut self) {
        self.emit(Op::RetVoid);
    }

    fn verify_function(&mut self, function: ValueId) -> Result<(), String> {
        let ValueId::Function(f) = function else {
            return Err(format!("verify target {function:?} is not a function"));
        };
        let name = self.functions[f].name.clone();
        for &block in &self.functions[f].blocks {
            let rec = &self.blocks[block.0];
            let Some((&last, body)) = rec.instructions.split_last() else {
                return Err(format!("block `{}` of `{name}` is empty", rec.name));
            };
            if !self.instructions[last].op.is_terminator() {
                return Err(format!(
                    "block `{}` of `{name}` does not end in a terminator",
                    rec.name
                ));
            }
            for &index in body {
                if self.instructions[index].op.is_terminator() {
                    return Err(format!(
                        "block `{}` of `{name}` has a terminator before its end",
                        rec.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A runtime cell of the reference evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cell {
    Int(i64),
    Addr(usize),
    Func(usize),
    Undef,
}

impl Cell {
    pub fn as_int(&self) -> i64 {
        match self {
            Cell::Int(v) => *v,
            other => panic!("expected integer cell, found {other:?}"),
        }
    }
}

/// Executes a recorded module. Stack and heap allocations both live in one
/// flat cell array; aggregates take one cell per field, so a struct_gep is
/// plain address arithmetic.
pub struct Interp<'m> {
    module: &'m RecordBackend,
    memory: Vec<Cell>,
}

impl<'m> Interp<'m> {
    pub fn new(module: &'m RecordBackend) -> Self {
        Self {
            module,
            memory: Vec::new(),
        }
    }

    pub fn call_named(&mut self, name: &str, args: &[Cell]) -> Cell {
        let function = self
            .module
            .function_named(name)
            .unwrap_or_else(|| panic!("no function named `{name}`"));
        self.call(function, args.to_vec())
    }

    /// Invokes a closure tuple produced by the builder: loads the code
    /// pointer and environment pointer out of the tuple and appends the
    /// environment as the trailing argument.
    pub fn call_closure(&mut self, closure: Cell, args: &[Cell]) -> Cell {
        let Cell::Addr(base) = closure else {
            panic!("expected closure tuple address, found {closure:?}");
        };
        let code = self.memory[base];
        let environment = self.memory[base + 1];
        let Cell::Func(function) = code else {
            panic!("closure tuple field 0 is not code: {code:?}");
        };
        let mut full = args.to_vec();
        full.push(environment);
        self.call(function, full)
    }

    pub fn call(&mut self, function: usize, args: Vec<Cell>) -> Cell {
        let module = self.module;
        let mut values: FxHashMap<ValueId, Cell> = FxHashMap::default();
        let mut block = module.functions[function].blocks[0];
        let mut predecessor: Option<BlockId> = None;

        'blocks: loop {
            for &index in &module.blocks[block.0].instructions {
                let result = match &module.instructions[index].op {
                    Op::ConstInt { value, .. } => Cell::Int(*value as i64),
                    Op::Binary { op, lhs, rhs } => {
                        let l = self.value(&values, &args, *lhs).as_int();
                        let r = self.value(&values, &args, *rhs).as_int();
                        Cell::Int(match op {
                            BinaryOp::Add => l.wrapping_add(r),
                            BinaryOp::Sub => l.wrapping_sub(r),
                            BinaryOp::Mul => l.wrapping_mul(r),
                            BinaryOp::Div => l.wrapping_div(r),
                        })
                    }
                    Op::IntEq { lhs, rhs } => {
                        let l = self.value(&values, &args, *lhs);
                        let r = self.value(&values, &args, *rhs);
                        Cell::Int((l == r) as i64)
                    }
                    Op::CondBr {
                        condition,
                        then_block,
                        else_block,
                    } => {
                        let taken = self.value(&values, &args, *condition).as_int() != 0;
                        predecessor = Some(block);
                        block = if taken { *then_block } else { *else_block };
                        continue 'blocks;
                    }
                    Op::Br { dest } => {
                        predecessor = Some(block);
                        block = *dest;
                        continue 'blocks;
                    }
                    Op::Phi { incoming, .. } => {
                        // A one-armed conditional leaves its untaken edge
                        // without an incoming value.
                        let from = predecessor.expect("phi executed with no predecessor");
                        match incoming.iter().find(|(_, b)| *b == from) {
                            Some(pair) => self.value(&values, &args, pair.0),
                            None => Cell::Undef,
                        }
                    }
                    Op::Call { callee, args: call_args, .. } => {
                        let target = match self.value(&values, &args, *callee) {
                            Cell::Func(f) => f,
                            other => panic!("call target is not code: {other:?}"),
                        };
                        let evaluated: Vec<Cell> = call_args
                            .iter()
                            .map(|&a| self.value(&values, &args, a))
                            .collect();
                        self.call(target, evaluated)
                    }
                    Op::StackAlloc { ty } | Op::HeapAlloc { ty } => {
                        let size = match &module.types[ty.0] {
                            RecTy::Struct { fields, .. } => fields.len().max(1),
                            _ => 1,
                        };
                        let base = self.memory.len();
                        self.memory.extend(std::iter::repeat(Cell::Undef).take(size));
                        Cell::Addr(base)
                    }
                    Op::Load { ptr, .. } => {
                        let Cell::Addr(addr) = self.value(&values, &args, *ptr) else {
                            panic!("load through non-address");
                        };
                        self.memory[addr]
                    }
                    Op::Store { value, ptr } => {
                        let cell = self.value(&values, &args, *value);
                        let Cell::Addr(addr) = self.value(&values, &args, *ptr) else {
                            panic!("store through non-address");
                        };
                        self.memory[addr] = cell;
                        Cell::Undef
                    }
                    Op::Gep { ptr, index: field, .. } => {
                        let Cell::Addr(base) = self.value(&values, &args, *ptr) else {
                            panic!("gep through non-address");
                        };
                        Cell::Addr(base + *field as usize)
                    }
                    Op::Ret { value } => return self.value(&values, &args, *value),
                    Op::RetVoid => return Cell::Undef,
                };
                values.insert(ValueId::Instr(index), result);
            }
            // A verified function never falls off the end of a block.
            return Cell::Undef;
        }
    }

    fn value(&self, values: &FxHashMap<ValueId, Cell>, args: &[Cell], id: ValueId) -> Cell {
        match id {
            ValueId::Function(f) => Cell::Func(f),
            ValueId::Param { index, .. } => args[index as usize],
            ValueId::Instr(index) => {
                if let Some(cell) = values.get(&id) {
                    return *cell;
                }
                // Constants live outside blocks and evaluate on demand.
                match &self.module.instructions[index].op {
                    Op::ConstInt { value, .. } => Cell::Int(*value as i64),
                    _ => Cell::Undef,
                }
            }
        }
    }
}
