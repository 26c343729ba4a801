//! Native backend over LLVM 15. One context, one module, one builder per
//! compilation unit; the builder's insert position is the emission cursor
//! the core threads through `define` and `branch`.

use std::ffi::{CStr, CString};

use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction, LLVMVerifyModule};
use llvm_sys::core::{
    LLVMAddFunction, LLVMAddIncoming, LLVMAppendBasicBlockInContext, LLVMBuildAdd,
    LLVMBuildAlloca, LLVMBuildBr, LLVMBuildCall2, LLVMBuildCondBr, LLVMBuildICmp, LLVMBuildLoad2,
    LLVMBuildMalloc, LLVMBuildMul, LLVMBuildPhi, LLVMBuildRet, LLVMBuildRetVoid, LLVMBuildSDiv,
    LLVMBuildStore, LLVMBuildStructGEP2, LLVMBuildSub, LLVMConstInt, LLVMContextCreate,
    LLVMContextDispose, LLVMCreateBuilderInContext, LLVMDisposeBuilder, LLVMDisposeMessage,
    LLVMDisposeModule, LLVMFunctionType, LLVMGetEntryBasicBlock, LLVMGetFirstInstruction,
    LLVMGetInsertBlock, LLVMGetParam, LLVMGetTypeByName2, LLVMGetValueName2,
    LLVMIntTypeInContext, LLVMModuleCreateWithNameInContext, LLVMPointerType,
    LLVMPositionBuilderAtEnd, LLVMPositionBuilderBefore, LLVMPrintModuleToString,
    LLVMSetValueName2, LLVMStructCreateNamed, LLVMStructSetBody, LLVMVoidTypeInContext,
};
use llvm_sys::prelude::{
    LLVMBasicBlockRef, LLVMBuilderRef, LLVMContextRef, LLVMModuleRef, LLVMTypeRef, LLVMValueRef,
};
use llvm_sys::LLVMIntPredicate;

use super::{Backend, BinaryOp};

fn cname(name: &str) -> CString {
    CString::new(name).unwrap_or_default()
}

pub struct LlvmBackend {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
}

impl LlvmBackend {
    pub fn new(module_name: &str) -> Self {
        unsafe {
            let context = LLVMContextCreate();
            let name = cname(module_name);
            let module = LLVMModuleCreateWithNameInContext(name.as_ptr(), context);
            let builder = LLVMCreateBuilderInContext(context);
            Self {
                context,
                module,
                builder,
            }
        }
    }

    /// Textual IR of the whole unit, for debugging and golden tests.
    pub fn print_ir(&self) -> String {
        unsafe {
            let raw = LLVMPrintModuleToString(self.module);
            let ir = CStr::from_ptr(raw).to_string_lossy().into_owned();
            LLVMDisposeMessage(raw);
            ir
        }
    }
}

impl Drop for LlvmBackend {
    fn drop(&mut self) {
        unsafe {
            LLVMDisposeBuilder(self.builder);
            LLVMDisposeModule(self.module);
            LLVMContextDispose(self.context);
        }
    }
}

impl Backend for LlvmBackend {
    type TypeRef = LLVMTypeRef;
    type ValueRef = LLVMValueRef;
    type BlockRef = LLVMBasicBlockRef;

    fn int_type(&mut self, width: u32) -> LLVMTypeRef {
        unsafe { LLVMIntTypeInContext(self.context, width) }
    }

    fn void_type(&mut self) -> LLVMTypeRef {
        unsafe { LLVMVoidTypeInContext(self.context) }
    }

    fn function_type(
        &mut self,
        ret: LLVMTypeRef,
        params: &[LLVMTypeRef],
        is_var_arg: bool,
    ) -> LLVMTypeRef {
        let mut params = params.to_vec();
        unsafe {
            LLVMFunctionType(
                ret,
                params.as_mut_ptr(),
                params.len() as u32,
                is_var_arg as i32,
            )
        }
    }

    fn named_struct_type(&mut self, name: &str, fields: &[LLVMTypeRef]) -> LLVMTypeRef {
        let name = cname(name);
        unsafe {
            let existing = LLVMGetTypeByName2(self.context, name.as_ptr());
            if !existing.is_null() {
                return existing;
            }
            let ty = LLVMStructCreateNamed(self.context, name.as_ptr());
            let mut fields = fields.to_vec();
            LLVMStructSetBody(ty, fields.as_mut_ptr(), fields.len() as u32, 0);
            ty
        }
    }

    fn pointer_type(&mut self, pointee: LLVMTypeRef) -> LLVMTypeRef {
        unsafe { LLVMPointerType(pointee, 0) }
    }

    fn add_function(&mut self, name: &str, ty: LLVMTypeRef) -> LLVMValueRef {
        let name = cname(name);
        unsafe { LLVMAddFunction(self.module, name.as_ptr(), ty) }
    }

    fn param(&mut self, function: LLVMValueRef, index: u32) -> LLVMValueRef {
        unsafe { LLVMGetParam(function, index) }
    }

    fn name_param(&mut self, function: LLVMValueRef, index: u32, name: &str) {
        unsafe {
            let param = LLVMGetParam(function, index);
            LLVMSetValueName2(param, name.as_ptr() as *const i8, name.len());
        }
    }

    fn append_block(&mut self, function: LLVMValueRef, name: &str) -> LLVMBasicBlockRef {
        let name = cname(name);
        unsafe { LLVMAppendBasicBlockInContext(self.context, function, name.as_ptr()) }
    }

    fn entry_block(&mut self, function: LLVMValueRef) -> LLVMBasicBlockRef {
        unsafe { LLVMGetEntryBasicBlock(function) }
    }

    fn position_at_end(&mut self, block: LLVMBasicBlockRef) {
        unsafe { LLVMPositionBuilderAtEnd(self.builder, block) }
    }

    fn position_before(&mut self, instruction: LLVMValueRef) {
        unsafe { LLVMPositionBuilderBefore(self.builder, instruction) }
    }

    fn current_block(&mut self) -> Option<LLVMBasicBlockRef> {
        let block = unsafe { LLVMGetInsertBlock(self.builder) };
        if block.is_null() {
            None
        } else {
            Some(block)
        }
    }

    fn first_instruction(&mut self, block: LLVMBasicBlockRef) -> Option<LLVMValueRef> {
        let instruction = unsafe { LLVMGetFirstInstruction(block) };
        if instruction.is_null() {
            None
        } else {
            Some(instruction)
        }
    }

    fn const_int(&mut self, ty: LLVMTypeRef, value: u64) -> LLVMValueRef {
        unsafe { LLVMConstInt(ty, value, 0) }
    }

    fn binary_op(
        &mut self,
        op: BinaryOp,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
        name: &str,
    ) -> LLVMValueRef {
        let name = cname(name);
        unsafe {
            match op {
                BinaryOp::Add => LLVMBuildAdd(self.builder, lhs, rhs, name.as_ptr()),
                BinaryOp::Sub => LLVMBuildSub(self.builder, lhs, rhs, name.as_ptr()),
                BinaryOp::Mul => LLVMBuildMul(self.builder, lhs, rhs, name.as_ptr()),
                BinaryOp::Div => LLVMBuildSDiv(self.builder, lhs, rhs, name.as_ptr()),
            }
        }
    }

    fn int_eq(&mut self, lhs: LLVMValueRef, rhs: LLVMValueRef, name: &str) -> LLVMValueRef {
        let name = cname(name);
        unsafe {
            LLVMBuildICmp(
                self.builder,
                LLVMIntPredicate::LLVMIntEQ,
                lhs,
                rhs,
                name.as_ptr(),
            )
        }
    }

    fn cond_br(
        &mut self,
        condition: LLVMValueRef,
        then_block: LLVMBasicBlockRef,
        else_block: LLVMBasicBlockRef,
    ) {
        unsafe {
            LLVMBuildCondBr(self.builder, condition, then_block, else_block);
        }
    }

    fn br(&mut self, dest: LLVMBasicBlockRef) {
        unsafe {
            LLVMBuildBr(self.builder, dest);
        }
    }

    fn phi(
        &mut self,
        ty: LLVMTypeRef,
        incoming: &[(LLVMValueRef, LLVMBasicBlockRef)],
        name: &str,
    ) -> LLVMValueRef {
        let name = cname(name);
        unsafe {
            let phi = LLVMBuildPhi(self.builder, ty, name.as_ptr());
            let mut values: Vec<LLVMValueRef> = incoming.iter().map(|(v, _)| *v).collect();
            let mut blocks: Vec<LLVMBasicBlockRef> = incoming.iter().map(|(_, b)| *b).collect();
            LLVMAddIncoming(
                phi,
                values.as_mut_ptr(),
                blocks.as_mut_ptr(),
                incoming.len() as u32,
            );
            phi
        }
    }

    fn call(
        &mut self,
        fn_ty: LLVMTypeRef,
        callee: LLVMValueRef,
        args: &[LLVMValueRef],
        name: &str,
    ) -> LLVMValueRef {
        let name = cname(name);
        let mut args = args.to_vec();
        unsafe {
            LLVMBuildCall2(
                self.builder,
                fn_ty,
                callee,
                args.as_mut_ptr(),
                args.len() as u32,
                name.as_ptr(),
            )
        }
    }

    fn stack_alloc(&mut self, ty: LLVMTypeRef, name: &str) -> LLVMValueRef {
        let name = cname(name);
        unsafe { LLVMBuildAlloca(self.builder, ty, name.as_ptr()) }
    }

    fn heap_alloc(&mut self, ty: LLVMTypeRef, name: &str) -> LLVMValueRef {
        let name = cname(name);
        unsafe { LLVMBuildMalloc(self.builder, ty, name.as_ptr()) }
    }

    fn load(&mut self, ty: LLVMTypeRef, ptr: LLVMValueRef, name: &str) -> LLVMValueRef {
        let name = cname(name);
        unsafe { LLVMBuildLoad2(self.builder, ty, ptr, name.as_ptr()) }
    }

    fn store(&mut self, value: LLVMValueRef, ptr: LLVMValueRef) {
        unsafe {
            LLVMBuildStore(self.builder, value, ptr);
        }
    }

    fn struct_gep(
        &mut self,
        struct_ty: LLVMTypeRef,
        ptr: LLVMValueRef,
        index: u32,
        name: &str,
    ) -> LLVMValueRef {
        let name = cname(name);
        unsafe { LLVMBuildStructGEP2(self.builder, struct_ty, ptr, index, name.as_ptr()) }
    }

    fn ret(&mut self, value: LLVMValueRef) {
        unsafe {
            LLVMBuildRet(self.builder, value);
        }
    }

    fn ret_void(&mut self) {
        unsafe {
            LLVMBuildRetVoid(self.builder);
        }
    }

    fn verify_function(&mut self, function: LLVMValueRef) -> Result<(), String> {
        unsafe {
            let status = LLVMVerifyFunction(
                function,
                LLVMVerifierFailureAction::LLVMReturnStatusAction,
            );
            if status == 0 {
                return Ok(());
            }
            // Re-verify at module scope to harvest the diagnostic text.
            let mut message: *mut i8 = std::ptr::null_mut();
            LLVMVerifyModule(
                self.module,
                LLVMVerifierFailureAction::LLVMReturnStatusAction,
                &mut message,
            );
            let diagnostic = if message.is_null() {
                let mut len = 0usize;
                let name = LLVMGetValueName2(function, &mut len);
                format!(
                    "verifier rejected `{}`",
                    CStr::from_ptr(name).to_string_lossy()
                )
            } else {
                let text = CStr::from_ptr(message).to_string_lossy().into_owned();
                LLVMDisposeMessage(message);
                text
            };
            Err(diagnostic)
        }
    }
}
