//! Structured diagnostics shared by the compiler and the VM.
//!
//! Two error taxonomies, matching the two phases of `Vm::interpret`:
//! [`CompileError`] (lexical, syntactic, semantic) and [`RuntimeError`]
//! (type mismatches, undefined names, stack exhaustion). Both carry a
//! source line and nothing more — source debugging beyond line
//! numbers is out of scope.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorKind {
    #[error("Unexpected character.")]
    UnexpectedCharacter,
    #[error("Unterminated string.")]
    UnterminatedString,
    #[error("Expect {0}.")]
    Expected(&'static str),
    #[error("Already a variable with this name in this scope.")]
    AlreadyDeclared,
    #[error("Can't read local variable in its own initializer.")]
    ReadInOwnInitializer,
    #[error("Can't return from top-level code.")]
    ReturnFromTopLevel,
    #[error("Can't return a value from an initializer.")]
    ReturnValueFromInitializer,
    #[error("Too many constants in one chunk.")]
    TooManyConstants,
    #[error("Too many local variables in function.")]
    TooManyLocals,
    #[error("Too many closure variables in function.")]
    TooManyUpvalues,
    #[error("Cannot assign to a constant.")]
    AssignToConstant,
    #[error("Can't use 'self' outside of a class.")]
    SelfOutsideClass,
    #[error("Can't use 'super' outside of a class.")]
    SuperOutsideClass,
    #[error("Can't use 'super' in a class with no superclass.")]
    SuperWithoutSuperclass,
    #[error("A class can't inherit from itself.")]
    ClassInheritsFromItself,
    #[error("Can't have more than 255 arguments.")]
    TooManyArguments,
    #[error("Can't have more than 255 parameters.")]
    TooManyParameters,
    #[error("Invalid assignment target.")]
    InvalidAssignmentTarget,
    #[error("'break' outside a loop.")]
    BreakOutsideLoop,
    #[error("'next' outside a loop.")]
    NextOutsideLoop,
    #[error("Loop body too large.")]
    LoopBodyTooLarge,
    #[error("Too much code to jump over.")]
    JumpTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[line {line}] Error: {kind}")]
pub struct CompileError {
    pub line: u32,
    pub kind: CompileErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be two numbers or two strings.")]
    AddOperandMismatch,
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Undefined variable '{0}'.")]
    UndefinedGlobal(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: u8, got: u8 },
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Only instances have properties.")]
    NotAnInstance,
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("{0}")]
    Native(String),
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: u32,
    /// Innermost frame first, each formatted `[line N] in <name>()`
    /// (or `…in script` for the top-level frame).
    pub trace: Vec<String>,
}

impl RuntimeError {
    /// Render the message followed by the call-stack trace, matching
    /// the source VM's `runtime_error` output.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.kind);
        for line in &self.trace {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single rendered diagnostic, the common currency between the
/// compiler/VM and a host (CLI, editor) that wants to show it.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
}

impl From<&CompileError> for Diagnostic {
    fn from(err: &CompileError) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: err.kind.to_string(),
            line: err.line,
        }
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(err: &RuntimeError) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: err.render(),
            line: err.line,
        }
    }
}

/// The public, aggregate error type for `Vm::interpret`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compilation failed with {} error(s)", .0.len())]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Error::Compile(errs) => errs.iter().map(Diagnostic::from).collect(),
            Error::Runtime(err) => vec![Diagnostic::from(err)],
        }
    }
}
