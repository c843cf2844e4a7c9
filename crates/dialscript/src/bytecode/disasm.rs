//! Human-readable disassembly of a bytecode module.
//!
//! The listing covers the metadata block, all name tables, the main entry
//! point and a per-instruction decode of the code section. When debug info is
//! present each instruction is prefixed with its source line as `[Lnnn]`.

use std::fmt::Write;

use super::{module::BytecodeModule, op::Opcode};

/// Renders the full disassembly listing.
#[must_use]
pub fn disassemble(module: &BytecodeModule) -> String {
    let mut out = String::new();

    out.push_str("=== Bytecode Disassembly ===\n\n");

    let meta = &module.metadata;
    out.push_str("Metadata:\n");
    let _ = writeln!(out, "  App Name:    {}", meta.app_name);
    let _ = writeln!(out, "  Version:     {}", meta.app_version);
    let _ = writeln!(
        out,
        "  Author:      {}",
        if meta.author.is_empty() { "(none)" } else { &meta.author }
    );
    let _ = writeln!(out, "  Heap Size:   {} bytes", meta.heap_size);
    let _ = writeln!(out, "  Format Ver:  {}", meta.version);
    let _ = writeln!(out, "  Hash Code:   {:#010x} (metadata)", meta.hash_code);
    let _ = writeln!(out, "  Checksum:    {:#06x} (bytecode)", meta.checksum);
    let _ = writeln!(
        out,
        "  Integrity:   {}",
        if module.verify_integrity() { "VALID" } else { "CORRUPTED" }
    );
    out.push('\n');

    let _ = writeln!(out, "Constants ({}):", module.constants_len());
    for (i, value) in module.constants_iter().enumerate() {
        let _ = writeln!(out, "  [{i}] {value:?}");
    }
    out.push('\n');

    let _ = writeln!(out, "Globals ({}):", module.globals_len());
    for (i, name) in module.globals_iter().enumerate() {
        let _ = writeln!(out, "  [{i}] {name}");
    }
    out.push('\n');

    let _ = writeln!(out, "Functions ({}):", module.functions_len());
    for (i, (name, info)) in module.functions_iter().enumerate() {
        let _ = writeln!(out, "  [{i}] {name} @ PC:{} ({} params)", info.entry_pc, info.param_count);
    }
    out.push('\n');

    let _ = writeln!(out, "Main Entry Point: PC:{}", module.main_entry_point);
    out.push('\n');

    if module.has_debug_info() {
        let _ = writeln!(out, "Debug Info: Enabled ({} entries)", module.code().len());
    } else {
        out.push_str("Debug Info: Disabled\n");
    }
    out.push('\n');

    let code = module.code();
    let _ = writeln!(out, "Code ({} bytes):", code.len());

    let mut pos = 0usize;
    while pos < code.len() {
        let _ = write!(out, "{pos:06}  ");

        let line = module.source_line(pos);
        if module.has_debug_info() && line > 0 {
            let _ = write!(out, "[L{line:3}] ");
        } else {
            out.push_str("      ");
        }

        let Some(op) = Opcode::from_byte(code[pos]) else {
            let _ = writeln!(out, "DB {:#04x}", code[pos]);
            pos += 1;
            continue;
        };
        pos += 1;

        match decode_operands(module, op, &mut pos) {
            Some(operands) if operands.is_empty() => {
                let _ = writeln!(out, "{}", op.mnemonic());
            }
            Some(operands) => {
                let _ = writeln!(out, "{} {operands}", op.mnemonic());
            }
            None => {
                let _ = writeln!(out, "{} <truncated>", op.mnemonic());
                break;
            }
        }
    }

    out
}

/// Decodes the operand bytes for `op` at `pos`, advancing past them.
/// Returns `None` when the code section ends mid-instruction.
fn decode_operands(module: &BytecodeModule, op: Opcode, pos: &mut usize) -> Option<String> {
    let code = module.code();

    let read_u8 = |pos: &mut usize| -> Option<u8> {
        let byte = *code.get(*pos)?;
        *pos += 1;
        Some(byte)
    };
    let read_u16 = |pos: &mut usize| -> Option<u16> {
        let bytes = code.get(*pos..*pos + 2)?;
        *pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    };
    let read_u32 = |pos: &mut usize| -> Option<u32> {
        let bytes = code.get(*pos..*pos + 4)?;
        *pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };

    let text = match op {
        Opcode::PushI8 => {
            let value = read_u8(pos)? as i8;
            format!("{value}")
        }
        Opcode::PushI16 => {
            let value = read_u16(pos)? as i16;
            format!("{value}")
        }
        Opcode::PushI32 => {
            let value = read_u32(pos)? as i32;
            format!("{value}")
        }
        Opcode::PushF32 => {
            let value = f32::from_le_bytes(read_u32(pos)?.to_le_bytes());
            let mut buffer = ryu::Buffer::new();
            buffer.format(value).to_owned()
        }
        Opcode::PushStr | Opcode::GetField | Opcode::SetField | Opcode::NewObject => {
            let index = read_u16(pos)?;
            match module.constant(index) {
                Some(value) => format!("[{index}] {value:?}"),
                None => format!("[{index}]"),
            }
        }
        Opcode::LoadLocal | Opcode::StoreLocal => {
            let slot = read_u8(pos)?;
            format!("{slot}")
        }
        Opcode::LoadGlobal | Opcode::StoreGlobal => {
            let index = read_u16(pos)?;
            match module.global_name(index) {
                Some(name) => format!("[{index}] {name}"),
                None => format!("[{index}]"),
            }
        }
        Opcode::Jump | Opcode::JumpIf | Opcode::JumpIfNot | Opcode::Try => {
            let offset = read_u32(pos)? as i32;
            // Offsets are relative to the byte after the operand.
            let target = i64::try_from(*pos).ok()? + i64::from(offset);
            format!("{offset} -> {target:06}")
        }
        Opcode::Call | Opcode::CallNative => {
            let index = read_u16(pos)?;
            let argc = read_u8(pos)?;
            match module.function_name(index) {
                Some(name) => format!("[{index}] {name}, {argc} args"),
                None => format!("[{index}], {argc} args"),
            }
        }
        Opcode::LoadFunction => {
            let index = read_u16(pos)?;
            match module.function_name(index) {
                Some(name) => format!("[{index}] {name}"),
                None => format!("[{index}]"),
            }
        }
        Opcode::CallIndirect => {
            let argc = read_u8(pos)?;
            format!("{argc} args")
        }
        Opcode::CallMethod => {
            let argc = read_u8(pos)?;
            let index = read_u16(pos)?;
            match module.constant(index) {
                Some(name) => format!("{argc} args, [{index}] {name:?}"),
                None => format!("{argc} args, [{index}]"),
            }
        }
        _ => String::new(),
    };

    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_decodes_operands() {
        let mut module = BytecodeModule::new();
        let greeting = module.add_constant("hi");
        module.emit_u16(Opcode::PushStr, greeting, 1);
        module.emit(Opcode::Print, 1);
        module.emit_i8(Opcode::PushI8, -5, 2);
        module.emit(Opcode::Halt, 2);
        module.update_integrity();

        let listing = disassemble(&module);
        assert!(listing.contains("PUSH_STR [0] \"hi\""));
        assert!(listing.contains("PUSH_I8 -5"));
        assert!(listing.contains("HALT"));
        assert!(listing.contains("Integrity:   VALID"));
    }

    #[test]
    fn test_jump_targets_are_absolute() {
        let mut module = BytecodeModule::new();
        let patch_pos = module.current_position() + 1;
        module.emit_i32(Opcode::Jump, 0, 1);
        module.emit(Opcode::Nop, 1);
        let target = module.current_position();
        let offset = i32::try_from(target).unwrap() - i32::try_from(patch_pos + 4).unwrap();
        module.patch_jump(patch_pos, offset);
        module.emit(Opcode::Halt, 1);
        module.update_integrity();

        let listing = disassemble(&module);
        assert!(listing.contains("JUMP 1 -> 000006"), "listing was:\n{listing}");
    }

    #[test]
    fn test_debug_lines_shown() {
        let mut module = BytecodeModule::new();
        module.enable_debug_info();
        module.emit(Opcode::Halt, 7);
        module.update_integrity();

        let listing = disassemble(&module);
        assert!(listing.contains("[L  7] HALT"));
        assert!(listing.contains("Debug Info: Enabled"));
    }
}
