use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = CodegenError> = std::result::Result<T, E>;

/// Fatal emission failures. Every variant indicates either a malformed
/// request from the front-end or a function the backend refused to verify;
/// in both cases code generation for the unit is abandoned.
#[derive(Clone, Debug, Error, Diagnostic)]
pub enum CodegenError {
    #[error("cannot resolve `{name}` in any enclosing scope")]
    #[diagnostic(
        code(ember::codegen::unresolved),
        help("the front-end emitted a reference to a name it never bound")
    )]
    UnresolvedName { name: String },

    #[error("cannot call a {found} value")]
    #[diagnostic(code(ember::codegen::not_callable))]
    NotCallable { found: String },

    #[error("`{function}` expects {expected} arguments, got {found}")]
    #[diagnostic(code(ember::codegen::arity))]
    WrongArity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("branch arms disagree: consequence is {consequence}, alternative is {alternative}")]
    #[diagnostic(
        code(ember::codegen::branch_type),
        help("both arms of a conditional must emit the same type; the merge is never coerced")
    )]
    BranchTypeMismatch {
        consequence: String,
        alternative: String,
    },

    #[error("{context}: expected {expected}, found {found}")]
    #[diagnostic(code(ember::codegen::shape))]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },

    #[error("`{function}` declares {declared} capture record fields but its body captured {found}")]
    #[diagnostic(code(ember::codegen::capture_record))]
    CaptureRecordMismatch {
        function: String,
        declared: usize,
        found: usize,
    },

    #[error("`{function}` captured `{name}` but its type declares no capture record")]
    #[diagnostic(
        code(ember::codegen::capture_record),
        help("declare the capture record on the function type before defining the body")
    )]
    MissingCaptureRecord { function: String, name: String },

    #[error("no function is currently being defined")]
    #[diagnostic(code(ember::codegen::no_function))]
    NoActiveFunction,

    #[error("`{function}` failed backend verification: {message}")]
    #[diagnostic(code(ember::codegen::verify))]
    Verification { function: String, message: String },
}
