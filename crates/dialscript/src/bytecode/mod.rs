//! Bytecode subsystem: opcode set, module image, compiler and disassembler.
//!
//! Data flows source -> AST -> [`BytecodeModule`] -> serialized `.dsb` bytes,
//! or straight into the VM for direct execution.

pub use compiler::{CompileOptions, Compiler, compile};
pub use disasm::disassemble;
pub use module::{BytecodeModule, FORMAT_VERSION, FunctionInfo, MAGIC, Metadata, ModuleError};
pub use op::Opcode;

mod compiler;
mod disasm;
mod module;
mod op;
