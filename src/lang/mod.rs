//! Front end for agent scripts: tokenizer, parser, name resolution and code generation.
//!
//! The accepted language is a small Python subset. Compilation is restricted: names starting
//! with `_` are refused, so agent code can neither reach host internals through dunder
//! attributes nor shadow the hooks injected by [`instrument`](crate::instrument).

pub mod ast;
mod compiler;
pub mod lexer;
pub mod parser;
pub mod scope;

pub use compiler::compile_module;
