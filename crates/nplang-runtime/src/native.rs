//! The native-function bridge: how host code plugs functions into the VM.
//!
//! A native is a plain Rust `fn`, not a closure, so it can be stored as a
//! `Copy` value inside an [`Obj::Native`](crate::object::Obj::Native) without
//! any trait-object indirection. Arity is the callee's responsibility to
//! check: the bridge passes whatever slice of arguments the call site
//! supplied.

pub use crate::object::NativeFn;
