//! The crate's error taxonomy.
//!
//! Compilation and execution fail in distinct ways and are reported
//! distinctly: a source file can produce many compile diagnostics before
//! giving up, but the VM stops at the first runtime error it hits.

use thiserror::Error;

use crate::diagnostic::Diagnostic;

/// Top-level failure of [`crate::Vm::interpret`].
#[derive(Debug, Error)]
pub enum Error {
    /// The scanner or compiler rejected the source. Carries every
    /// diagnostic collected during panic-mode recovery, not just the first.
    #[error("compilation failed with {} error(s)", .0.len())]
    Compile(Vec<Diagnostic>),

    /// The program compiled but raised an error while running. Carries the
    /// call-frame backtrace captured while unwinding, innermost frame first.
    #[error("{error}")]
    Runtime { error: RuntimeError, backtrace: Vec<BacktraceFrame> },
}

/// One call frame active when a [`RuntimeError`] was raised.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    /// The enclosing function's name, or `"script"` for the top-level frame.
    pub name: String,
    pub line: u32,
}

impl std::fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.name)
    }
}

/// An error raised while executing already-compiled bytecode.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("operand must be a {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: &'static str },

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("undefined property '{0}'")]
    UndefinedProperty(String),

    #[error("expected {expected} argument(s) but got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("stack overflow")]
    StackOverflow,

    #[error("can only call functions and classes")]
    NotCallable,

    #[error("superclass must be a class")]
    SuperclassNotClass,

    #[error("only instances have properties")]
    NotAnInstance,

    #[error("unknown boolean constant")]
    UnknownBoolConstant,

    #[error("{0}")]
    Host(String),
}

pub type InterpretResult<T> = Result<T, Error>;
