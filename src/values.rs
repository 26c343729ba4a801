use std::fmt;

use crate::backend::Backend;
use crate::types::{FunctionType, Type};

/// Whether a storage value lives in the current activation's frame or on
/// the heap. Capture promotion is the only path from `Stack` to `Heap`,
/// and it replaces the binding's storage value rather than duplicating it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    Stack,
    Heap,
}

/// Addressable storage for one declared binding: a typed backend address.
pub struct StorageValue<B: Backend> {
    pub ty: Type,
    pub addr: B::ValueRef,
    pub class: StorageClass,
}

impl<B: Backend> StorageValue<B> {
    pub fn is_heap(&self) -> bool {
        self.class == StorageClass::Heap
    }
}

impl<B: Backend> Clone for StorageValue<B> {
    fn clone(&self) -> Self {
        Self {
            ty: self.ty.clone(),
            addr: self.addr,
            class: self.class,
        }
    }
}

impl<B: Backend> PartialEq for StorageValue<B> {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty && self.addr == other.addr && self.class == other.class
    }
}

impl<B: Backend> fmt::Debug for StorageValue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageValue")
            .field("ty", &self.ty)
            .field("addr", &self.addr)
            .field("class", &self.class)
            .finish()
    }
}

/// A result handle produced by emission.
///
/// `Register` values are transient and not addressable. `Function` is a
/// bare code pointer for a function that captured nothing; `Closure` is a
/// pointer to the two-field (code, environment) tuple of a function with
/// one or more captures. Which of the two shapes a function has is fixed
/// the moment its capture list is known and never changes afterwards.
pub enum Value<B: Backend> {
    Register { ty: Type, handle: B::ValueRef },
    Function { ty: FunctionType, handle: B::ValueRef },
    Closure { ty: FunctionType, handle: B::ValueRef },
    Storage(StorageValue<B>),
}

impl<B: Backend> Value<B> {
    pub fn ty(&self) -> Type {
        match self {
            Value::Register { ty, .. } => ty.clone(),
            Value::Function { ty, .. } | Value::Closure { ty, .. } => Type::Function(ty.clone()),
            Value::Storage(storage) => storage.ty.clone(),
        }
    }

    /// The raw backend handle: the SSA value for registers, the code
    /// pointer for bare functions, the tuple pointer for closures, the
    /// address for storage.
    pub fn handle(&self) -> B::ValueRef {
        match self {
            Value::Register { handle, .. }
            | Value::Function { handle, .. }
            | Value::Closure { handle, .. } => *handle,
            Value::Storage(storage) => storage.addr,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Register { .. } => "register",
            Value::Function { .. } => "function",
            Value::Closure { .. } => "closure",
            Value::Storage(_) => "storage",
        }
    }
}

impl<B: Backend> Clone for Value<B> {
    fn clone(&self) -> Self {
        match self {
            Value::Register { ty, handle } => Value::Register {
                ty: ty.clone(),
                handle: *handle,
            },
            Value::Function { ty, handle } => Value::Function {
                ty: ty.clone(),
                handle: *handle,
            },
            Value::Closure { ty, handle } => Value::Closure {
                ty: ty.clone(),
                handle: *handle,
            },
            Value::Storage(storage) => Value::Storage(storage.clone()),
        }
    }
}

impl<B: Backend> fmt::Debug for Value<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Register { ty, handle } => {
                write!(f, "Register({ty}, {handle:?})")
            }
            Value::Function { ty, handle } => {
                write!(f, "Function({}, {handle:?})", ty.name)
            }
            Value::Closure { ty, handle } => {
                write!(f, "Closure({}, {handle:?})", ty.name)
            }
            Value::Storage(storage) => write!(f, "{storage:?}"),
        }
    }
}
