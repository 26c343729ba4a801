use std::fmt::Debug;

pub mod record;

#[cfg(feature = "llvm")]
pub mod llvm;

/// Integer binary operators the core emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The native code-generation boundary.
///
/// The core drives a backend exclusively through this trait: type
/// constructors, a mutable emission cursor, instruction constructors,
/// block/function creation, and a post-definition verification check. All
/// three handle types are opaque to the core; it stores, compares, and
/// passes them back but never looks inside.
///
/// The cursor is single-writer state for one compilation unit. The core
/// assumes exclusive access for the unit's whole lifetime; driving one
/// backend from several threads is the caller's bug to prevent.
pub trait Backend {
    type TypeRef: Copy + PartialEq + Debug;
    type ValueRef: Copy + PartialEq + Debug;
    type BlockRef: Copy + PartialEq + Debug;

    // Type constructors.
    fn int_type(&mut self, width: u32) -> Self::TypeRef;
    fn void_type(&mut self) -> Self::TypeRef;
    fn function_type(
        &mut self,
        ret: Self::TypeRef,
        params: &[Self::TypeRef],
        is_var_arg: bool,
    ) -> Self::TypeRef;
    /// Named aggregates are identity-keyed: asking for the same name twice
    /// must return the same handle.
    fn named_struct_type(&mut self, name: &str, fields: &[Self::TypeRef]) -> Self::TypeRef;
    fn pointer_type(&mut self, pointee: Self::TypeRef) -> Self::TypeRef;

    // Functions, parameters, blocks.
    fn add_function(&mut self, name: &str, ty: Self::TypeRef) -> Self::ValueRef;
    fn param(&mut self, function: Self::ValueRef, index: u32) -> Self::ValueRef;
    fn name_param(&mut self, function: Self::ValueRef, index: u32, name: &str);
    fn append_block(&mut self, function: Self::ValueRef, name: &str) -> Self::BlockRef;
    fn entry_block(&mut self, function: Self::ValueRef) -> Self::BlockRef;

    // Cursor.
    fn position_at_end(&mut self, block: Self::BlockRef);
    fn position_before(&mut self, instruction: Self::ValueRef);
    fn current_block(&mut self) -> Option<Self::BlockRef>;
    fn first_instruction(&mut self, block: Self::BlockRef) -> Option<Self::ValueRef>;

    // Instruction constructors.
    fn const_int(&mut self, ty: Self::TypeRef, value: u64) -> Self::ValueRef;
    fn binary_op(
        &mut self,
        op: BinaryOp,
        lhs: Self::ValueRef,
        rhs: Self::ValueRef,
        name: &str,
    ) -> Self::ValueRef;
    fn int_eq(&mut self, lhs: Self::ValueRef, rhs: Self::ValueRef, name: &str) -> Self::ValueRef;
    fn cond_br(
        &mut self,
        condition: Self::ValueRef,
        then_block: Self::BlockRef,
        else_block: Self::BlockRef,
    );
    fn br(&mut self, dest: Self::BlockRef);
    fn phi(
        &mut self,
        ty: Self::TypeRef,
        incoming: &[(Self::ValueRef, Self::BlockRef)],
        name: &str,
    ) -> Self::ValueRef;
    fn call(
        &mut self,
        fn_ty: Self::TypeRef,
        callee: Self::ValueRef,
        args: &[Self::ValueRef],
        name: &str,
    ) -> Self::ValueRef;
    fn stack_alloc(&mut self, ty: Self::TypeRef, name: &str) -> Self::ValueRef;
    fn heap_alloc(&mut self, ty: Self::TypeRef, name: &str) -> Self::ValueRef;
    fn load(&mut self, ty: Self::TypeRef, ptr: Self::ValueRef, name: &str) -> Self::ValueRef;
    fn store(&mut self, value: Self::ValueRef, ptr: Self::ValueRef);
    fn struct_gep(
        &mut self,
        struct_ty: Self::TypeRef,
        ptr: Self::ValueRef,
        index: u32,
        name: &str,
    ) -> Self::ValueRef;
    fn ret(&mut self, value: Self::ValueRef);
    fn ret_void(&mut self);

    /// Post-definition check. `Err` carries the backend's diagnostic and is
    /// fatal for the whole unit.
    fn verify_function(&mut self, function: Self::ValueRef) -> Result<(), String>;
}
