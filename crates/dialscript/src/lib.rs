//! dialScript: a small dynamically-evaluated, statically-parsed scripting
//! system for applets on a resource-constrained dial device (240x240 display,
//! rotary encoder, ~32 KB kernel heap).
//!
//! The crate covers the language end-to-end:
//!
//! - **Frontend**: a hand-written [`lexer`] and recursive-descent [`parse`]r
//!   producing a typed [`ast`] with source positions.
//! - **Bytecode**: a two-pass [`bytecode`] compiler lowering the tree to a
//!   self-describing, integrity-checked [`BytecodeModule`] (`.dsb` images),
//!   plus a disassembler.
//! - **Virtual machine**: a stack [`vm`] with a mark-and-sweep [`heap`],
//!   call frames, exception unwinding, callback re-entrancy and a cooperative
//!   instruction-budget `execute` loop, talking to the host through the
//!   [`Platform`] capability trait.
//!
//! # Example
//!
//! ```
//! use dialscript::{CollectPlatform, ExecOutcome, VmState, compile_source};
//!
//! let module = compile_source("var x: 40; assign x x + 2; print(x);").unwrap();
//! let mut vm = VmState::new(module);
//! let mut platform = CollectPlatform::new();
//! assert_eq!(vm.execute(1000, &mut platform), ExecOutcome::Finished);
//! assert_eq!(platform.console, vec!["42"]);
//! ```

pub mod ast;
pub mod bytecode;
pub mod heap;
pub mod host;
pub mod lexer;
pub mod parse;
pub mod platform;
pub mod tracer;
pub mod value;
pub mod vm;

pub use crate::{
    bytecode::{BytecodeModule, CompileOptions, Compiler, Metadata, ModuleError, Opcode, disassemble},
    heap::ValuePool,
    host::{AppletRunner, TickStatus},
    lexer::{Lexer, Token, TokenKind},
    parse::{Parser, parse_program},
    platform::{CollectPlatform, NullPlatform, Platform},
    tracer::{NoopTracer, RecordingTracer, TraceEvent, VmTracer},
    value::{HeapId, Value},
    vm::{ExecOutcome, VmState},
};

/// Parses and compiles a source string with default options.
///
/// Parse and compile errors are merged into one list; an error list is
/// returned whenever either stage reports anything.
pub fn compile_source(source: &str) -> Result<BytecodeModule, Vec<String>> {
    compile_source_with_options(source, CompileOptions::default())
}

/// Parses and compiles a source string with explicit [`CompileOptions`].
pub fn compile_source_with_options(source: &str, options: CompileOptions) -> Result<BytecodeModule, Vec<String>> {
    let (program, errors) = parse_program(source);
    if !errors.is_empty() {
        return Err(errors);
    }
    Compiler::new(options).compile(&program)
}
