//! nplang-runtime — the compiler and virtual machine at the core of nplang,
//! a small dynamically-typed scripting language.
//!
//! This crate implements the three tightly-coupled subsystems that turn
//! source text into a running program: a hand-written [`scanner`], a
//! single-pass [`compiler`] that emits bytecode directly with no
//! intermediate AST, and a stack-based [`vm`] with first-class closures,
//! single-inheritance classes with bound methods, and a mark-sweep garbage
//! collector over a generational-index [`object`] heap.
//!
//! What this crate deliberately does *not* provide: a command-line entry
//! point, a standard library of native functions (I/O, math, time, `print`
//! itself), or a disassembler. Those are host concerns layered on top of
//! [`Vm::define_native`].
//!
//! # Quick start
//!
//! ```
//! use nplang_runtime::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("var greeting = \"hi\" + \" there\";").unwrap();
//! ```

mod chunk;
mod compiler;
mod diagnostic;
mod error;
mod native;
mod object;
mod operators;
mod scanner;
mod table;
mod value;
mod vm;

pub use diagnostic::{Diagnostic, Label, Span};
pub use error::{BacktraceFrame, Error, InterpretResult, RuntimeError};
pub use native::NativeFn;
pub use object::ObjRef;
pub use value::Value;
pub use vm::Vm;
