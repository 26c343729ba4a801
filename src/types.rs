use std::fmt;

/// The closed set of type descriptors the front-end can ask for. Types are
/// plain descriptions; backend handles are produced on demand by the
/// builder, which keys named aggregates by name so self-referencing types
/// (capture records, closure tuples) materialize to one backend handle no
/// matter how often they are requested.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Int(u32),
    Bool,
    Void,
    /// Opaque backend-defined aggregate, identified by name only.
    Builtin(String),
    Function(FunctionType),
    Struct(StructType),
}

impl Type {
    pub fn i32() -> Type {
        Type::Int(32)
    }

    pub fn i64() -> Type {
        Type::Int(64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int(width) => write!(f, "i{width}"),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Builtin(name) => write!(f, "{name}"),
            Type::Function(fn_ty) => write!(f, "{fn_ty}"),
            Type::Struct(st) => write!(f, "{}", st.name),
        }
    }
}

/// A function signature. `capture_record` is declared by the front-end for
/// functions it knows will capture enclosing bindings; its presence adds an
/// implicit trailing environment-pointer parameter to the materialized
/// signature and fixes the function's value shape to a (code, environment)
/// closure tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionType {
    pub name: String,
    pub ret: Box<Type>,
    pub params: Vec<Type>,
    pub is_var_arg: bool,
    pub capture_record: Option<StructType>,
}

impl FunctionType {
    pub fn new(name: impl Into<String>, ret: Type, params: Vec<Type>) -> Self {
        Self {
            name: name.into(),
            ret: Box::new(ret),
            params,
            is_var_arg: false,
            capture_record: None,
        }
    }

    pub fn with_captures(mut self, record: StructType) -> Self {
        self.capture_record = Some(record);
        self
    }

    pub fn has_captures(&self) -> bool {
        self.capture_record.is_some()
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// A named aggregate with ordered field types.
#[derive(Clone, Debug, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Type>,
}

impl StructType {
    pub fn new(name: impl Into<String>, fields: Vec<Type>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// The capture record for a function, named after it. Fields are the
    /// captured value types in capture order; each field materializes as a
    /// pointer to the promoted heap cell so every closure over the same
    /// binding observes the same mutable storage.
    pub fn capture_record(function: &str, fields: Vec<Type>) -> Self {
        Self {
            name: format!("__env_{function}"),
            fields,
        }
    }
}
