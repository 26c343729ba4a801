use std::fmt;

use rustc_hash::FxHashMap;

use crate::backend::Backend;
use crate::types::{FunctionType, Type};
use crate::values::StorageValue;

/// Index of a scope in the arena. Scopes never hold references to each
/// other; all parent traversal goes through the arena by id, so capture
/// promotion can rewrite a binding at its defining scope without aliasing
/// a live parent pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) usize);

/// How a name is bound within one scope.
pub enum Binding<B: Backend> {
    /// The i-th formal parameter of the scope's function.
    Parameter(u32),
    /// Storage declared in this scope. Stack until a nested scope captures
    /// it, heap permanently afterwards.
    Defined(StorageValue<B>),
    /// Captured from an enclosing scope: `index` is the position in this
    /// scope's capture list, which is also the capture record field the
    /// value is read through at run time.
    Captured { index: u32, ty: Type },
}

impl<B: Backend> Clone for Binding<B> {
    fn clone(&self) -> Self {
        match self {
            Binding::Parameter(index) => Binding::Parameter(*index),
            Binding::Defined(storage) => Binding::Defined(storage.clone()),
            Binding::Captured { index, ty } => Binding::Captured {
                index: *index,
                ty: ty.clone(),
            },
        }
    }
}

impl<B: Backend> fmt::Debug for Binding<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Parameter(index) => write!(f, "Parameter({index})"),
            Binding::Defined(storage) => write!(f, "Defined({storage:?})"),
            Binding::Captured { index, ty } => write!(f, "Captured({index}, {ty})"),
        }
    }
}

/// One lexical scope: the bindings made in it plus the storage it ended up
/// capturing from enclosing scopes. Entered when a function body starts
/// and conceptually dead once that body's emission finishes; the arena
/// keeps the slot so ids stay stable.
pub struct Scope<B: Backend> {
    parent: Option<ScopeId>,
    function: Option<B::ValueRef>,
    fn_ty: Option<FunctionType>,
    bindings: FxHashMap<String, Binding<B>>,
    captures: Vec<StorageValue<B>>,
}

impl<B: Backend> Scope<B> {
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn function(&self) -> Option<B::ValueRef> {
        self.function
    }

    pub fn fn_ty(&self) -> Option<&FunctionType> {
        self.fn_ty.as_ref()
    }

    pub fn bindings(&self) -> &FxHashMap<String, Binding<B>> {
        &self.bindings
    }

    /// Heap storage promoted because a nested scope captured it, in dense
    /// capture order. This order is the order capture record fields are
    /// populated at definition time.
    pub fn captures(&self) -> &[StorageValue<B>] {
        &self.captures
    }
}

/// The arena of scopes for one compilation unit.
pub struct EnvArena<B: Backend> {
    scopes: Vec<Scope<B>>,
}

impl<B: Backend> EnvArena<B> {
    pub fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    pub fn push_scope(
        &mut self,
        parent: Option<ScopeId>,
        function: Option<B::ValueRef>,
        fn_ty: Option<FunctionType>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            parent,
            function,
            fn_ty,
            bindings: FxHashMap::default(),
            captures: Vec::new(),
        });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope<B> {
        &self.scopes[id.0]
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.scopes[id.0].parent
    }

    pub fn bind(&mut self, id: ScopeId, name: &str, binding: Binding<B>) {
        self.scopes[id.0].bindings.insert(name.to_string(), binding);
    }

    pub(crate) fn push_capture(&mut self, id: ScopeId, storage: StorageValue<B>) -> u32 {
        let scope = &mut self.scopes[id.0];
        scope.captures.push(storage);
        (scope.captures.len() - 1) as u32
    }

    /// The binding for `name` in `id` itself, ignoring parents.
    pub fn local(&self, id: ScopeId, name: &str) -> Option<&Binding<B>> {
        self.scopes[id.0].bindings.get(name)
    }

    /// Nearest enclosing binding for `name`, current scope first, then
    /// parents outward. Never mutates; crossing a closure boundary is the
    /// builder's `capture`, not this.
    pub fn lookup(&self, id: ScopeId, name: &str) -> Option<&Binding<B>> {
        let mut current = Some(id);
        while let Some(scope) = current {
            if let Some(binding) = self.scopes[scope.0].bindings.get(name) {
                return Some(binding);
            }
            current = self.scopes[scope.0].parent;
        }
        None
    }
}

impl<B: Backend> Default for EnvArena<B> {
    fn default() -> Self {
        Self::new()
    }
}
