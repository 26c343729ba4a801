//! Code generation core for the Ember compiler front-end.
//!
//! The crate turns scoped, well-typed definition requests into backend IR,
//! and its central job is closure conversion: a nested function that reads
//! names from enclosing scopes is lowered to plain code taking one extra
//! environment parameter, with the referenced storage promoted to the heap
//! at its defining scope so every closure over a binding shares one mutable
//! cell.
//!
//! [`Builder`] is the entry point. It is generic over [`Backend`], the
//! small instruction-emission surface a target has to provide; the
//! `record` backend captures emitted IR in memory for tests, and the
//! `llvm` feature enables a native LLVM backend.

pub mod backend;
pub mod builder;
pub mod env;
pub mod errors;
pub mod types;
pub mod values;

pub use backend::{Backend, BinaryOp};
pub use builder::Builder;
pub use env::{Binding, EnvArena, Scope, ScopeId};
pub use errors::{CodegenError, Result};
pub use types::{FunctionType, StructType, Type};
pub use values::{StorageClass, StorageValue, Value};
