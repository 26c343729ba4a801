//! The emission orchestrator. One `Builder` owns the mutable cursor into a
//! single compilation unit: it defines functions and closures, emits
//! branching control flow, issues calls under the closure calling
//! convention, and allocates storage. The front-end drives it with
//! well-typed requests; anything malformed is a fatal [`CodegenError`].

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::backend::{Backend, BinaryOp};
use crate::env::{Binding, EnvArena, Scope, ScopeId};
use crate::errors::{CodegenError, Result};
use crate::types::{FunctionType, StructType, Type};
use crate::values::{StorageClass, StorageValue, Value};

#[cfg(test)]
mod tests;

/// One in-progress `define`. `resume_block` is where the function's code
/// was growing when a nested definition took over the cursor; capture
/// promotion emits its copy instructions there.
struct Frame<B: Backend> {
    function: B::ValueRef,
    resume_block: Option<B::BlockRef>,
}

enum PromoteSource<B: Backend> {
    Stack(B::ValueRef),
    Parameter(u32),
}

pub struct Builder<B: Backend> {
    backend: B,
    envs: EnvArena<B>,
    frames: Vec<Frame<B>>,
    /// Backend handles for named aggregates, keyed by name so recursive
    /// types resolve to one handle no matter how often they materialize.
    struct_types: FxHashMap<String, B::TypeRef>,
    root: ScopeId,
}

impl<B: Backend> Builder<B> {
    pub fn new(backend: B) -> Self {
        let mut envs = EnvArena::new();
        let root = envs.push_scope(None, None, None);
        Self {
            backend,
            envs,
            frames: Vec::new(),
            struct_types: FxHashMap::default(),
            root,
        }
    }

    /// The unit-level scope function definitions start from.
    pub fn root_scope(&self) -> ScopeId {
        self.root
    }

    pub fn scope(&self, id: ScopeId) -> &Scope<B> {
        self.envs.scope(id)
    }

    /// Nearest enclosing binding without mutation (current scope first,
    /// outermost last).
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Binding<B>> {
        self.envs.lookup(scope, name)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    // ---- type materialization ----------------------------------------

    /// Backend type for a value of type `ty`. Function-typed values are
    /// pointers: to the code for capture-free functions, to the
    /// (code, environment) tuple for closures.
    fn materialize(&mut self, ty: &Type) -> B::TypeRef {
        match ty {
            Type::Int(width) => self.backend.int_type(*width),
            Type::Bool => self.backend.int_type(1),
            Type::Void => self.backend.void_type(),
            Type::Builtin(name) => {
                let name = name.clone();
                self.named_struct(&name, &[])
            }
            Type::Struct(st) => {
                let st = st.clone();
                self.materialize_struct(&st)
            }
            Type::Function(fn_ty) => {
                let fn_ty = fn_ty.clone();
                match &fn_ty.capture_record {
                    Some(record) => {
                        let record = record.clone();
                        let tuple = self.closure_tuple_type(&fn_ty, &record);
                        self.backend.pointer_type(tuple)
                    }
                    None => {
                        let signature = self.materialize_signature(&fn_ty);
                        self.backend.pointer_type(signature)
                    }
                }
            }
        }
    }

    fn named_struct(&mut self, name: &str, fields: &[B::TypeRef]) -> B::TypeRef {
        if let Some(&existing) = self.struct_types.get(name) {
            return existing;
        }
        let handle = self.backend.named_struct_type(name, fields);
        self.struct_types.insert(name.to_string(), handle);
        handle
    }

    fn materialize_struct(&mut self, st: &StructType) -> B::TypeRef {
        if let Some(&existing) = self.struct_types.get(&st.name) {
            return existing;
        }
        let mut fields = Vec::with_capacity(st.fields.len());
        for field in &st.fields {
            fields.push(self.materialize(field));
        }
        self.named_struct(&st.name, &fields)
    }

    /// The capture record aggregate: one pointer per captured value, in
    /// capture order, pointing at the promoted heap cells.
    fn capture_record_type(&mut self, record: &StructType) -> B::TypeRef {
        if let Some(&existing) = self.struct_types.get(&record.name) {
            return existing;
        }
        let mut fields = Vec::with_capacity(record.fields.len());
        for field in &record.fields {
            let value_ty = self.materialize(field);
            fields.push(self.backend.pointer_type(value_ty));
        }
        self.named_struct(&record.name, &fields)
    }

    /// The (code pointer, environment pointer) tuple for a capturing
    /// function, named after it.
    fn closure_tuple_type(&mut self, fn_ty: &FunctionType, record: &StructType) -> B::TypeRef {
        let name = format!("__closure_{}", fn_ty.name);
        if let Some(&existing) = self.struct_types.get(&name) {
            return existing;
        }
        let signature = self.materialize_signature(fn_ty);
        let code = self.backend.pointer_type(signature);
        let record_ty = self.capture_record_type(record);
        let environment = self.backend.pointer_type(record_ty);
        self.named_struct(&name, &[code, environment])
    }

    /// The backend signature, with the implicit trailing environment
    /// pointer appended when the function declares a capture record.
    fn materialize_signature(&mut self, fn_ty: &FunctionType) -> B::TypeRef {
        let ret = self.materialize(&fn_ty.ret);
        let mut params = Vec::with_capacity(fn_ty.params.len() + 1);
        for param in &fn_ty.params {
            params.push(self.materialize(param));
        }
        if let Some(record) = &fn_ty.capture_record {
            let record = record.clone();
            let record_ty = self.capture_record_type(&record);
            params.push(self.backend.pointer_type(record_ty));
        }
        self.backend.function_type(ret, &params, fn_ty.is_var_arg)
    }

    // ---- cursor discipline -------------------------------------------

    fn frame(&self) -> Result<&Frame<B>> {
        self.frames.last().ok_or(CodegenError::NoActiveFunction)
    }

    /// Runs `f` with the cursor at the start of `function`'s entry block
    /// (before its first instruction, or at its end when empty), then
    /// restores the prior position.
    fn in_entry_of<T>(&mut self, function: B::ValueRef, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.backend.current_block();
        let entry = self.backend.entry_block(function);
        match self.backend.first_instruction(entry) {
            Some(instruction) => self.backend.position_before(instruction),
            None => self.backend.position_at_end(entry),
        }
        let result = f(self);
        if let Some(block) = saved {
            self.backend.position_at_end(block);
        }
        result
    }

    // ---- storage -----------------------------------------------------

    /// Stack storage in the entry block of the function being defined.
    /// Entry placement makes each static allocation site execute exactly
    /// once per activation, however often the surrounding block runs.
    pub fn alloc_stack(&mut self, ty: &Type, name: &str) -> Result<StorageValue<B>> {
        let function = self.frame()?.function;
        let backend_ty = self.materialize(ty);
        let addr = self.in_entry_of(function, |b| b.backend.stack_alloc(backend_ty, name));
        Ok(StorageValue {
            ty: ty.clone(),
            addr,
            class: StorageClass::Stack,
        })
    }

    /// Heap storage, same entry-block placement as [`Self::alloc_stack`].
    pub fn alloc_heap(&mut self, ty: &Type, name: &str) -> Result<StorageValue<B>> {
        let function = self.frame()?.function;
        Ok(self.alloc_heap_in(function, ty, name))
    }

    fn alloc_heap_in(&mut self, function: B::ValueRef, ty: &Type, name: &str) -> StorageValue<B> {
        let backend_ty = self.materialize(ty);
        let addr = self.in_entry_of(function, |b| b.backend.heap_alloc(backend_ty, name));
        StorageValue {
            ty: ty.clone(),
            addr,
            class: StorageClass::Heap,
        }
    }

    /// Binds freshly allocated storage to a name in `scope`.
    pub fn define_local(&mut self, scope: ScopeId, name: &str, storage: StorageValue<B>) {
        self.envs.bind(scope, name, Binding::Defined(storage));
    }

    pub fn store(&mut self, value: &Value<B>, storage: &StorageValue<B>) {
        self.backend.store(value.handle(), storage.addr);
    }

    pub fn load(&mut self, storage: &StorageValue<B>, name: &str) -> Value<B> {
        let loaded_ty = self.materialize(&storage.ty);
        let handle = self.backend.load(loaded_ty, storage.addr, name);
        Self::wrap(&storage.ty, handle)
    }

    // ---- constants, arithmetic, returns ------------------------------

    pub fn const_int(&mut self, ty: &Type, value: i64) -> Result<Value<B>> {
        if !matches!(ty, Type::Int(_)) {
            return Err(CodegenError::ShapeMismatch {
                context: "integer constant",
                expected: "integer type".to_string(),
                found: ty.to_string(),
            });
        }
        let backend_ty = self.materialize(ty);
        let handle = self.backend.const_int(backend_ty, value as u64);
        Ok(Value::Register {
            ty: ty.clone(),
            handle,
        })
    }

    pub fn const_bool(&mut self, value: bool) -> Value<B> {
        let ty = self.backend.int_type(1);
        let handle = self.backend.const_int(ty, value as u64);
        Value::Register {
            ty: Type::Bool,
            handle,
        }
    }

    pub fn binary_op(&mut self, op: BinaryOp, lhs: &Value<B>, rhs: &Value<B>) -> Result<Value<B>> {
        let (Value::Register { ty: lhs_ty, .. }, Value::Register { ty: rhs_ty, .. }) = (lhs, rhs)
        else {
            return Err(CodegenError::ShapeMismatch {
                context: "binary operation",
                expected: "register operands".to_string(),
                found: format!("{} and {}", lhs.kind(), rhs.kind()),
            });
        };
        if lhs_ty != rhs_ty {
            return Err(CodegenError::ShapeMismatch {
                context: "binary operation",
                expected: lhs_ty.to_string(),
                found: rhs_ty.to_string(),
            });
        }
        let ty = lhs_ty.clone();
        let handle = self
            .backend
            .binary_op(op, lhs.handle(), rhs.handle(), "tmp");
        Ok(Value::Register { ty, handle })
    }

    pub fn ret(&mut self, value: &Value<B>) {
        self.backend.ret(value.handle());
    }

    pub fn ret_void(&mut self) {
        self.backend.ret_void();
    }

    // ---- name resolution ---------------------------------------------

    /// Reads `name` from `scope`, whatever its binding kind. When the name
    /// lives in an enclosing function's scope this captures it first, so
    /// the read goes through the environment parameter.
    pub fn resolve(&mut self, scope: ScopeId, name: &str) -> Result<Value<B>> {
        if let Some(binding) = self.envs.local(scope, name).cloned() {
            return self.read_binding(scope, &binding, name);
        }
        self.capture(scope, name)?;
        let binding = self
            .envs
            .local(scope, name)
            .cloned()
            .ok_or_else(|| CodegenError::UnresolvedName {
                name: name.to_string(),
            })?;
        self.read_binding(scope, &binding, name)
    }

    /// The addressable storage behind `name` in `scope`, as a value.
    /// Defined bindings yield their storage directly; captured names yield
    /// the heap cell read off the environment parameter. Parameters have
    /// no storage until a capture promotes them.
    pub fn address_of(&mut self, scope: ScopeId, name: &str) -> Result<Value<B>> {
        match self.envs.local(scope, name).cloned() {
            Some(Binding::Defined(storage)) => Ok(Value::Storage(storage)),
            Some(Binding::Captured { index, ty }) => {
                let cell = self.load_capture_cell(scope, index, &ty)?;
                Ok(Value::Storage(StorageValue {
                    ty,
                    addr: cell,
                    class: StorageClass::Heap,
                }))
            }
            Some(Binding::Parameter(_)) => Err(CodegenError::ShapeMismatch {
                context: "address of",
                expected: "addressable storage".to_string(),
                found: format!("parameter `{name}`"),
            }),
            None => Err(CodegenError::UnresolvedName {
                name: name.to_string(),
            }),
        }
    }

    fn read_binding(&mut self, scope: ScopeId, binding: &Binding<B>, name: &str) -> Result<Value<B>> {
        match binding {
            Binding::Defined(storage) => {
                let storage = storage.clone();
                Ok(self.load(&storage, name))
            }
            Binding::Parameter(index) => {
                let (function, ty) = {
                    let sc = self.envs.scope(scope);
                    let ty = sc
                        .fn_ty()
                        .and_then(|fn_ty| fn_ty.params.get(*index as usize))
                        .cloned();
                    (sc.function(), ty)
                };
                let function = function.ok_or(CodegenError::NoActiveFunction)?;
                let ty = ty.ok_or_else(|| CodegenError::UnresolvedName {
                    name: name.to_string(),
                })?;
                let handle = self.backend.param(function, *index);
                Ok(Self::wrap(&ty, handle))
            }
            Binding::Captured { index, ty } => {
                let ty = ty.clone();
                self.read_captured(scope, *index, &ty)
            }
        }
    }

    /// Captured values are read through the implicit trailing environment
    /// parameter: field `index` of the capture record holds a pointer to
    /// the promoted heap cell, so the read is one pointer load then one
    /// value load.
    fn read_captured(&mut self, scope: ScopeId, index: u32, ty: &Type) -> Result<Value<B>> {
        let cell = self.load_capture_cell(scope, index, ty)?;
        let value_ty = self.materialize(ty);
        let handle = self.backend.load(value_ty, cell, &format!("capture_{index}"));
        Ok(Self::wrap(ty, handle))
    }

    /// Emits, at the current cursor, the load of capture `index`'s cell
    /// pointer off `scope`'s trailing environment parameter.
    fn load_capture_cell(&mut self, scope: ScopeId, index: u32, ty: &Type) -> Result<B::ValueRef> {
        let (function, fn_ty) = {
            let sc = self.envs.scope(scope);
            (sc.function(), sc.fn_ty().cloned())
        };
        let function = function.ok_or(CodegenError::NoActiveFunction)?;
        let fn_ty = fn_ty.ok_or(CodegenError::NoActiveFunction)?;
        let record = fn_ty
            .capture_record
            .clone()
            .ok_or_else(|| CodegenError::MissingCaptureRecord {
                function: fn_ty.name.clone(),
                name: format!("capture #{index}"),
            })?;
        let record_ty = self.capture_record_type(&record);
        let environment = self.backend.param(function, fn_ty.params.len() as u32);
        let field = self.backend.struct_gep(
            record_ty,
            environment,
            index,
            &format!("capture_{index}_ptr"),
        );
        let value_ty = self.materialize(ty);
        let cell_ty = self.backend.pointer_type(value_ty);
        Ok(self
            .backend
            .load(cell_ty, field, &format!("capture_{index}_cell")))
    }

    // ---- capture promotion -------------------------------------------

    /// Resolves `name` for use from a nested function body, promoting its
    /// storage to the heap at the defining scope if that has not happened
    /// yet. Promotion runs once per binding: after the first capture the
    /// heap cell's identity is stable, so every closure over the same
    /// binding shares one mutable cell.
    pub fn capture(&mut self, scope: ScopeId, name: &str) -> Result<StorageValue<B>> {
        match self.envs.local(scope, name).cloned() {
            Some(Binding::Defined(storage)) if storage.is_heap() => Ok(storage),
            Some(Binding::Defined(storage)) => {
                let heap =
                    self.promote(scope, &storage.ty, PromoteSource::Stack(storage.addr), name)?;
                self.envs.bind(scope, name, Binding::Defined(heap.clone()));
                Ok(heap)
            }
            Some(Binding::Parameter(index)) => {
                let ty = self
                    .envs
                    .scope(scope)
                    .fn_ty()
                    .and_then(|fn_ty| fn_ty.params.get(index as usize))
                    .cloned()
                    .ok_or_else(|| CodegenError::UnresolvedName {
                        name: name.to_string(),
                    })?;
                let heap = self.promote(scope, &ty, PromoteSource::Parameter(index), name)?;
                self.envs.bind(scope, name, Binding::Defined(heap.clone()));
                Ok(heap)
            }
            Some(Binding::Captured { index, .. }) => {
                // Already captured into this scope; never re-allocate.
                Ok(self.envs.scope(scope).captures()[index as usize].clone())
            }
            None => {
                let parent = self
                    .envs
                    .parent(scope)
                    .ok_or_else(|| CodegenError::UnresolvedName {
                        name: name.to_string(),
                    })?;
                // Promote at the defining scope first; only register the
                // capture here once that succeeded.
                let storage = self.capture(parent, name)?;
                let fn_ty = self.envs.scope(scope).fn_ty().cloned();
                let function_name = fn_ty
                    .as_ref()
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| "<root>".to_string());
                if !fn_ty.map(|f| f.has_captures()).unwrap_or(false) {
                    return Err(CodegenError::MissingCaptureRecord {
                        function: function_name,
                        name: name.to_string(),
                    });
                }
                // When the parent itself holds the name as a capture, the
                // promoted cell lives functions further up; re-load its
                // pointer off the parent's environment so this scope's
                // record field gets a value the parent function owns.
                let storage = match self.envs.local(parent, name).cloned() {
                    Some(Binding::Captured { index, ty }) => {
                        self.capture_cell_in(parent, index, &ty)?
                    }
                    _ => storage,
                };
                let index = self.envs.push_capture(scope, storage.clone());
                self.envs.bind(
                    scope,
                    name,
                    Binding::Captured {
                        index,
                        ty: storage.ty.clone(),
                    },
                );
                trace!(name, index, function = %function_name, "registered capture");
                Ok(storage)
            }
        }
    }

    /// Moves a binding's storage to a fresh heap cell. The allocation goes
    /// to the defining function's entry block; the copy of the current
    /// value lands where that function's code is currently growing, which
    /// is the point just before the nested definition that triggered the
    /// capture.
    fn promote(
        &mut self,
        scope: ScopeId,
        ty: &Type,
        source: PromoteSource<B>,
        name: &str,
    ) -> Result<StorageValue<B>> {
        let function = self
            .envs
            .scope(scope)
            .function()
            .ok_or(CodegenError::NoActiveFunction)?;
        let target_block = self.growing_block_of(function)?;

        let saved = self.backend.current_block();
        self.backend.position_at_end(target_block);

        let heap = self.alloc_heap_in(function, ty, name);
        let value_ty = self.materialize(ty);
        let current = match source {
            PromoteSource::Stack(addr) => self.backend.load(value_ty, addr, name),
            PromoteSource::Parameter(index) => self.backend.param(function, index),
        };
        self.backend.store(current, heap.addr);

        if let Some(block) = saved {
            self.backend.position_at_end(block);
        }
        debug!(name, "promoted binding to heap storage");
        Ok(heap)
    }

    /// The block where `function`'s code is currently growing: its cursor
    /// position when it is the innermost definition, otherwise the block
    /// recorded when a nested definition took the cursor over.
    fn growing_block_of(&mut self, function: B::ValueRef) -> Result<B::BlockRef> {
        if self.frames.last().map(|f| f.function == function) == Some(true) {
            self.backend.current_block()
        } else {
            self.frames
                .iter()
                .find(|f| f.function == function)
                .and_then(|f| f.resume_block)
        }
        .ok_or(CodegenError::NoActiveFunction)
    }

    /// Materializes, in the function owning `scope`, the pointer to the
    /// heap cell behind that scope's capture `index`. A capture that
    /// crossed more than one function boundary is only reachable through
    /// each intermediate environment parameter, so the cell pointer a
    /// nested record stores must be loaded in the function doing the
    /// storing, never referenced across function boundaries.
    fn capture_cell_in(&mut self, scope: ScopeId, index: u32, ty: &Type) -> Result<StorageValue<B>> {
        let function = self
            .envs
            .scope(scope)
            .function()
            .ok_or(CodegenError::NoActiveFunction)?;
        let target = self.growing_block_of(function)?;

        let saved = self.backend.current_block();
        self.backend.position_at_end(target);
        let cell = self.load_capture_cell(scope, index, ty);
        if let Some(block) = saved {
            self.backend.position_at_end(block);
        }
        Ok(StorageValue {
            ty: ty.clone(),
            addr: cell?,
            class: StorageClass::Heap,
        })
    }

    // ---- function definition -----------------------------------------

    /// Defines a named function and emits its body synchronously. The
    /// cursor moves to a fresh entry block for the duration of `body` and
    /// returns to the call site afterwards.
    ///
    /// A function whose scope ends with no captures comes back as a bare
    /// code pointer. One with captures comes back as a closure: a heap
    /// capture record plus the (code, environment) tuple, both allocated
    /// in the enclosing function's entry block so a definition inside a
    /// loop body does not grow storage per iteration.
    pub fn define(
        &mut self,
        fn_ty: FunctionType,
        parameter_names: &[&str],
        parent: ScopeId,
        body: impl FnOnce(&mut Self, ScopeId) -> Result<()>,
    ) -> Result<Value<B>> {
        debug!(function = %fn_ty.name, params = parameter_names.len(), "defining function");
        if parameter_names.len() != fn_ty.params.len() {
            return Err(CodegenError::WrongArity {
                function: fn_ty.name.clone(),
                expected: fn_ty.params.len(),
                found: parameter_names.len(),
            });
        }
        // An empty declared record would still add the trailing environment
        // parameter while the definition comes back as a bare function.
        if fn_ty.capture_record.as_ref().is_some_and(|r| r.fields.is_empty()) {
            return Err(CodegenError::ShapeMismatch {
                context: "capture record",
                expected: "at least one field".to_string(),
                found: format!("empty record on `{}`", fn_ty.name),
            });
        }

        let signature = self.materialize_signature(&fn_ty);
        let function = self.backend.add_function(&fn_ty.name, signature);
        for (index, name) in parameter_names.iter().enumerate() {
            self.backend.name_param(function, index as u32, name);
        }
        if fn_ty.has_captures() {
            self.backend
                .name_param(function, fn_ty.params.len() as u32, "env");
        }

        let scope = self
            .envs
            .push_scope(Some(parent), Some(function), Some(fn_ty.clone()));
        for (index, name) in parameter_names.iter().enumerate() {
            self.envs.bind(scope, name, Binding::Parameter(index as u32));
        }

        // Freeze the enclosing function's position so capture promotion
        // knows where its code is currently growing.
        let saved = self.backend.current_block();
        if let Some(frame) = self.frames.last_mut() {
            frame.resume_block = saved;
        }

        let entry = self.backend.append_block(function, "entry");
        self.backend.position_at_end(entry);
        self.frames.push(Frame {
            function,
            resume_block: None,
        });

        let body_result = body(self, scope);

        self.frames.pop();
        if let Some(block) = saved {
            self.backend.position_at_end(block);
        }
        body_result?;

        let captures = self.envs.scope(scope).captures().to_vec();
        if let Some(record) = &fn_ty.capture_record {
            if record.fields.len() != captures.len() {
                return Err(CodegenError::CaptureRecordMismatch {
                    function: fn_ty.name.clone(),
                    declared: record.fields.len(),
                    found: captures.len(),
                });
            }
            for (declared, captured) in record.fields.iter().zip(&captures) {
                if *declared != captured.ty {
                    return Err(CodegenError::ShapeMismatch {
                        context: "capture record field",
                        expected: declared.to_string(),
                        found: captured.ty.to_string(),
                    });
                }
            }
        }

        self.backend
            .verify_function(function)
            .map_err(|message| CodegenError::Verification {
                function: fn_ty.name.clone(),
                message,
            })?;

        if captures.is_empty() {
            return Ok(Value::Function {
                ty: fn_ty,
                handle: function,
            });
        }

        let record = match fn_ty.capture_record.clone() {
            Some(record) => record,
            None => {
                return Err(CodegenError::MissingCaptureRecord {
                    function: fn_ty.name.clone(),
                    name: "<capture record>".to_string(),
                })
            }
        };
        let enclosing = self.frame()?.function;

        let record_ty = self.capture_record_type(&record);
        let environment = self.in_entry_of(enclosing, |b| {
            b.backend
                .heap_alloc(record_ty, &format!("{}_env", fn_ty.name))
        });
        for (index, capture) in captures.iter().enumerate() {
            let field = self.backend.struct_gep(
                record_ty,
                environment,
                index as u32,
                &format!("{}_env_{index}", fn_ty.name),
            );
            self.backend.store(capture.addr, field);
        }

        let tuple_ty = self.closure_tuple_type(&fn_ty, &record);
        let tuple = self.in_entry_of(enclosing, |b| {
            b.backend
                .heap_alloc(tuple_ty, &format!("{}_closure", fn_ty.name))
        });
        let code_field =
            self.backend
                .struct_gep(tuple_ty, tuple, 0, &format!("{}_code", fn_ty.name));
        self.backend.store(function, code_field);
        let environment_field =
            self.backend
                .struct_gep(tuple_ty, tuple, 1, &format!("{}_envptr", fn_ty.name));
        self.backend.store(environment, environment_field);

        debug!(function = %fn_ty.name, captures = captures.len(), "built closure tuple");
        Ok(Value::Closure {
            ty: fn_ty,
            handle: tuple,
        })
    }

    // ---- calls -------------------------------------------------------

    /// Emits a call under the closure calling convention: bare functions
    /// get exactly the supplied arguments, closures get the environment
    /// pointer appended as one extra trailing argument.
    pub fn call(&mut self, callee: &Value<B>, args: &[Value<B>]) -> Result<Value<B>> {
        match callee {
            Value::Function { ty, handle } => {
                Self::check_arity(ty, args.len())?;
                let ty = ty.clone();
                let handle = *handle;
                let signature = self.materialize_signature(&ty);
                let raw: Vec<B::ValueRef> = args.iter().map(Value::handle).collect();
                let result = self.backend.call(signature, handle, &raw, &ty.name);
                Ok(Self::wrap(&ty.ret, result))
            }
            Value::Closure { ty, handle } => {
                Self::check_arity(ty, args.len())?;
                let ty = ty.clone();
                let handle = *handle;
                let record = ty.capture_record.clone().ok_or_else(|| {
                    CodegenError::ShapeMismatch {
                        context: "closure call",
                        expected: "function type with a capture record".to_string(),
                        found: ty.to_string(),
                    }
                })?;
                let tuple_ty = self.closure_tuple_type(&ty, &record);
                let signature = self.materialize_signature(&ty);

                let code_ptr_ty = self.backend.pointer_type(signature);
                let code_field =
                    self.backend
                        .struct_gep(tuple_ty, handle, 0, &format!("{}_code_ptr", ty.name));
                let code = self
                    .backend
                    .load(code_ptr_ty, code_field, &format!("{}_code", ty.name));

                let record_ty = self.capture_record_type(&record);
                let environment_ptr_ty = self.backend.pointer_type(record_ty);
                let environment_field =
                    self.backend
                        .struct_gep(tuple_ty, handle, 1, &format!("{}_env_ptr", ty.name));
                let environment = self.backend.load(
                    environment_ptr_ty,
                    environment_field,
                    &format!("{}_env", ty.name),
                );

                let mut raw: Vec<B::ValueRef> = args.iter().map(Value::handle).collect();
                raw.push(environment);
                let result = self.backend.call(signature, code, &raw, &ty.name);
                Ok(Self::wrap(&ty.ret, result))
            }
            other => Err(CodegenError::NotCallable {
                found: other.kind().to_string(),
            }),
        }
    }

    fn check_arity(ty: &FunctionType, found: usize) -> Result<()> {
        if ty.params.len() != found {
            return Err(CodegenError::WrongArity {
                function: ty.name.clone(),
                expected: ty.params.len(),
                found,
            });
        }
        Ok(())
    }

    // ---- conditional branch and merge --------------------------------

    /// One-armed conditional: the consequence's value flows through the
    /// merge on its single incoming edge.
    pub fn branch(
        &mut self,
        condition: impl FnOnce(&mut Self) -> Result<Value<B>>,
        consequence: impl FnOnce(&mut Self) -> Result<Value<B>>,
    ) -> Result<Value<B>> {
        self.branch_impl(
            condition,
            consequence,
            None::<fn(&mut Self) -> Result<Value<B>>>,
        )
    }

    /// Two-armed conditional. The two arms must emit the same type;
    /// anything else is a fatal mismatch, never a coercion.
    pub fn branch_else(
        &mut self,
        condition: impl FnOnce(&mut Self) -> Result<Value<B>>,
        consequence: impl FnOnce(&mut Self) -> Result<Value<B>>,
        alternative: impl FnOnce(&mut Self) -> Result<Value<B>>,
    ) -> Result<Value<B>> {
        self.branch_impl(condition, consequence, Some(alternative))
    }

    fn branch_impl<A>(
        &mut self,
        condition: impl FnOnce(&mut Self) -> Result<Value<B>>,
        consequence: impl FnOnce(&mut Self) -> Result<Value<B>>,
        alternative: Option<A>,
    ) -> Result<Value<B>>
    where
        A: FnOnce(&mut Self) -> Result<Value<B>>,
    {
        let function = self.frame()?.function;

        let cond = condition(self)?;
        if cond.ty() != Type::Bool {
            return Err(CodegenError::ShapeMismatch {
                context: "branch condition",
                expected: "bool".to_string(),
                found: cond.ty().to_string(),
            });
        }
        let bool_ty = self.backend.int_type(1);
        let literal_true = self.backend.const_int(bool_ty, 1);
        let taken = self.backend.int_eq(cond.handle(), literal_true, "cond");

        let then_block = self.backend.append_block(function, "then");
        let else_block = self.backend.append_block(function, "else");
        let merge_block = self.backend.append_block(function, "merge");
        self.backend.cond_br(taken, then_block, else_block);

        self.backend.position_at_end(then_block);
        let consequence_value = consequence(self)?;
        self.backend.br(merge_block);
        let mut incoming = vec![(consequence_value.handle(), then_block)];

        self.backend.position_at_end(else_block);
        let mut alternative_ty = None;
        if let Some(alternative) = alternative {
            let alternative_value = alternative(self)?;
            alternative_ty = Some(alternative_value.ty());
            incoming.push((alternative_value.handle(), else_block));
        }
        self.backend.br(merge_block);

        let result_ty = consequence_value.ty();
        if let Some(alternative_ty) = alternative_ty {
            if alternative_ty != result_ty {
                return Err(CodegenError::BranchTypeMismatch {
                    consequence: result_ty.to_string(),
                    alternative: alternative_ty.to_string(),
                });
            }
        }

        self.backend.position_at_end(merge_block);
        let phi_ty = self.materialize(&result_ty);
        let merged = self.backend.phi(phi_ty, &incoming, "merge");
        trace!(edges = incoming.len(), ty = %result_ty, "merged branch");
        Ok(Self::wrap(&result_ty, merged))
    }

    // ---- helpers -----------------------------------------------------

    fn wrap(ty: &Type, handle: B::ValueRef) -> Value<B> {
        match ty {
            Type::Function(fn_ty) if fn_ty.has_captures() => Value::Closure {
                ty: fn_ty.clone(),
                handle,
            },
            Type::Function(fn_ty) => Value::Function {
                ty: fn_ty.clone(),
                handle,
            },
            other => Value::Register {
                ty: other.clone(),
                handle,
            },
        }
    }
}
