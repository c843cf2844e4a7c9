//! Self-describing bytecode module image and the `.dsb` wire format.
//!
//! A module bundles metadata, the interned constant pool, global and function
//! name tables, the code bytes, optional per-byte debug line numbers and two
//! integrity fields: a 16-bit checksum over the code (and debug) bytes and an
//! FNV-1a hash over the metadata that includes the checksum, so corrupting
//! either the code or the header is detected on load.

use std::fmt;

use indexmap::{IndexMap, IndexSet};

use super::op::Opcode;

/// Current `.dsb` format version.
pub const FORMAT_VERSION: u16 = 1;

/// `DSBC` file magic.
pub const MAGIC: [u8; 4] = *b"DSBC";

const FLAG_DEBUG_INFO: u16 = 0x0001;

/// FNV-1a 32-bit offset basis.
const FNV_OFFSET: u32 = 0x811C_9DC5;
/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 0x0100_0193;

/// Module metadata carried in the `.dsb` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Bytecode format version.
    pub version: u16,
    /// Required VM heap size in bytes.
    pub heap_size: u32,
    pub app_name: String,
    pub app_version: String,
    pub author: String,
    /// Compilation timestamp (seconds; 0 when unknown).
    pub timestamp: u32,
    /// FNV-1a digest over the metadata, including `checksum`.
    pub hash_code: u32,
    /// 16-bit modular sum of the code (and debug) bytes.
    pub checksum: u16,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            heap_size: 8192,
            app_name: "untitled".to_owned(),
            app_version: "1.0.0".to_owned(),
            author: String::new(),
            timestamp: 0,
            hash_code: 0,
            checksum: 0,
        }
    }
}

impl Metadata {
    /// FNV-1a over version, heap size, timestamp, checksum, then the three
    /// metadata strings, in that order. Linking the code checksum into the
    /// hash ties the header to the code section.
    #[must_use]
    pub fn calculate_hash(&self) -> u32 {
        let mut hash = FNV_OFFSET;
        let mut mix = |word: u32| {
            hash ^= word;
            hash = hash.wrapping_mul(FNV_PRIME);
        };

        mix(u32::from(self.version));
        mix(self.heap_size);
        mix(self.timestamp);
        mix(u32::from(self.checksum));

        for s in [&self.app_name, &self.app_version, &self.author] {
            for byte in s.bytes() {
                hash ^= u32::from(byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }

        hash
    }
}

/// Entry-point and arity record for one function-table slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    /// PC of the first instruction; 0 means "not defined" for every slot
    /// except index 0.
    pub entry_pc: u32,
    /// Declared parameter count (including `this` for methods).
    pub param_count: u8,
}

/// Errors produced while loading a `.dsb` image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    BadMagic,
    UnsupportedVersion(u16),
    /// The image ended before a section was complete.
    Truncated,
    InvalidUtf8,
    /// Checksum or metadata hash mismatch.
    IntegrityMismatch,
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => f.write_str("invalid bytecode file format"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported bytecode format version {v}"),
            Self::Truncated => f.write_str("bytecode file is truncated"),
            Self::InvalidUtf8 => f.write_str("bytecode file contains invalid UTF-8 string data"),
            Self::IntegrityMismatch => f.write_str("bytecode integrity check failed - file may be corrupted"),
        }
    }
}

impl std::error::Error for ModuleError {}

/// A compiled dialScript module.
///
/// All name tables deduplicate on insert. `functions` keeps index 0 as a
/// reserved "no function" slot so that a zero entry point on any other index
/// unambiguously means "declared but never defined".
#[derive(Debug, Clone, Default)]
pub struct BytecodeModule {
    pub metadata: Metadata,
    constants: IndexSet<String>,
    globals: IndexSet<String>,
    functions: IndexMap<String, FunctionInfo>,
    code: Vec<u8>,
    debug_lines: Vec<u32>,
    debug_enabled: bool,
    /// PC where top-level code begins, after all function bodies.
    pub main_entry_point: u32,
}

impl BytecodeModule {
    #[must_use]
    pub fn new() -> Self {
        let mut module = Self::default();
        // Reserved slot: index 0 is "no function".
        module.functions.insert(String::new(), FunctionInfo::default());
        module
    }

    // ===== Name tables =====

    /// Adds a string to the constant pool, returning its index. Equal strings
    /// share one slot.
    pub fn add_constant(&mut self, value: &str) -> u16 {
        let (index, _) = self.constants.insert_full(value.to_owned());
        u16::try_from(index).expect("constant pool exceeds u16 range")
    }

    /// Adds a global variable name, returning its (deduplicated) index.
    pub fn add_global(&mut self, name: &str) -> u16 {
        let (index, _) = self.globals.insert_full(name.to_owned());
        u16::try_from(index).expect("global table exceeds u16 range")
    }

    /// Adds a function-table entry, returning its index. A name seen before
    /// keeps its original slot and recorded info.
    pub fn add_function(&mut self, name: &str, param_count: u8) -> u16 {
        if let Some(index) = self.functions.get_index_of(name) {
            return u16::try_from(index).expect("function table exceeds u16 range");
        }
        let (index, _) = self.functions.insert_full(
            name.to_owned(),
            FunctionInfo {
                entry_pc: 0,
                param_count,
            },
        );
        u16::try_from(index).expect("function table exceeds u16 range")
    }

    pub fn set_function_entry_point(&mut self, index: u16, pc: u32) {
        if let Some((_, info)) = self.functions.get_index_mut(usize::from(index)) {
            info.entry_pc = pc;
        }
    }

    pub fn set_function_param_count(&mut self, index: u16, param_count: u8) {
        if let Some((_, info)) = self.functions.get_index_mut(usize::from(index)) {
            info.param_count = param_count;
        }
    }

    #[must_use]
    pub fn constant(&self, index: u16) -> Option<&str> {
        self.constants.get_index(usize::from(index)).map(String::as_str)
    }

    #[must_use]
    pub fn constants_len(&self) -> usize {
        self.constants.len()
    }

    pub fn constants_iter(&self) -> impl Iterator<Item = &str> {
        self.constants.iter().map(String::as_str)
    }

    #[must_use]
    pub fn global_name(&self, index: u16) -> Option<&str> {
        self.globals.get_index(usize::from(index)).map(String::as_str)
    }

    #[must_use]
    pub fn global_index(&self, name: &str) -> Option<u16> {
        self.globals.get_index_of(name).and_then(|i| u16::try_from(i).ok())
    }

    #[must_use]
    pub fn globals_len(&self) -> usize {
        self.globals.len()
    }

    pub fn globals_iter(&self) -> impl Iterator<Item = &str> {
        self.globals.iter().map(String::as_str)
    }

    #[must_use]
    pub fn function_name(&self, index: u16) -> Option<&str> {
        self.functions.get_index(usize::from(index)).map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn function_info(&self, index: u16) -> Option<FunctionInfo> {
        self.functions.get_index(usize::from(index)).map(|(_, info)| *info)
    }

    #[must_use]
    pub fn function_index(&self, name: &str) -> Option<u16> {
        self.functions.get_index_of(name).and_then(|i| u16::try_from(i).ok())
    }

    #[must_use]
    pub fn functions_len(&self) -> usize {
        self.functions.len()
    }

    pub fn functions_iter(&self) -> impl Iterator<Item = (&str, FunctionInfo)> {
        self.functions.iter().map(|(name, info)| (name.as_str(), *info))
    }

    // ===== Code emission =====

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Current code offset; used for labels, entry points and jump targets.
    #[must_use]
    pub fn current_position(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, op: Opcode, line: u32) {
        self.push_byte(op as u8, line);
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8, line: u32) {
        self.push_byte(op as u8, line);
        self.push_byte(operand, line);
    }

    pub fn emit_i8(&mut self, op: Opcode, operand: i8, line: u32) {
        self.push_byte(op as u8, line);
        self.push_byte(operand.to_le_bytes()[0], line);
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16, line: u32) {
        self.push_byte(op as u8, line);
        self.push_bytes(&operand.to_le_bytes(), line);
    }

    pub fn emit_i16(&mut self, op: Opcode, operand: i16, line: u32) {
        self.push_byte(op as u8, line);
        self.push_bytes(&operand.to_le_bytes(), line);
    }

    pub fn emit_i32(&mut self, op: Opcode, operand: i32, line: u32) {
        self.push_byte(op as u8, line);
        self.push_bytes(&operand.to_le_bytes(), line);
    }

    pub fn emit_f32(&mut self, op: Opcode, operand: f32, line: u32) {
        self.push_byte(op as u8, line);
        self.push_bytes(&operand.to_le_bytes(), line);
    }

    /// Emits `CALL`/`CALL_NATIVE`: u16 index then u8 argument count.
    pub fn emit_call(&mut self, op: Opcode, index: u16, arg_count: u8, line: u32) {
        self.push_byte(op as u8, line);
        self.push_bytes(&index.to_le_bytes(), line);
        self.push_byte(arg_count, line);
    }

    /// Emits `CALL_METHOD`: u8 argument count then u16 name constant index.
    pub fn emit_call_method(&mut self, arg_count: u8, name_index: u16, line: u32) {
        self.push_byte(Opcode::CallMethod as u8, line);
        self.push_byte(arg_count, line);
        self.push_bytes(&name_index.to_le_bytes(), line);
    }

    /// Overwrites a previously emitted 4-byte jump placeholder. The operand's
    /// debug lines were recorded at emission and stay in place.
    pub fn patch_jump(&mut self, position: usize, offset: i32) {
        self.code[position..position + 4].copy_from_slice(&offset.to_le_bytes());
    }

    fn push_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        if self.debug_enabled {
            self.debug_lines.push(line);
        }
    }

    fn push_bytes(&mut self, bytes: &[u8], line: u32) {
        for &byte in bytes {
            self.push_byte(byte, line);
        }
    }

    // ===== Debug info =====

    /// Enables per-byte source-line tracking. Call before emitting any code.
    pub fn enable_debug_info(&mut self) {
        self.debug_enabled = true;
        self.debug_lines.resize(self.code.len(), 0);
    }

    /// Drops debug lines to reclaim memory.
    pub fn disable_debug_info(&mut self) {
        self.debug_enabled = false;
        self.debug_lines = Vec::new();
    }

    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.debug_enabled
    }

    /// Source line for a code offset; 0 when unknown or untracked.
    #[must_use]
    pub fn source_line(&self, pc: usize) -> u32 {
        self.debug_lines.get(pc).copied().unwrap_or(0)
    }

    // ===== Integrity =====

    /// 16-bit modular sum of all code bytes, plus the little-endian bytes of
    /// every debug-line word when debug info is present.
    #[must_use]
    pub fn bytecode_checksum(&self) -> u16 {
        let mut sum: u16 = 0;
        for &byte in &self.code {
            sum = sum.wrapping_add(u16::from(byte));
        }
        if self.debug_enabled {
            for &line in &self.debug_lines {
                for byte in line.to_le_bytes() {
                    sum = sum.wrapping_add(u16::from(byte));
                }
            }
        }
        sum
    }

    /// Recomputes `checksum` then `hash_code` (which covers the checksum).
    pub fn update_integrity(&mut self) {
        self.metadata.checksum = self.bytecode_checksum();
        self.metadata.hash_code = self.metadata.calculate_hash();
    }

    /// A module is valid iff both the code checksum and the metadata hash
    /// match their recorded values.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        if self.metadata.checksum != self.bytecode_checksum() {
            return false;
        }
        self.metadata.hash_code == self.metadata.calculate_hash()
    }

    // ===== Serialization =====

    /// Serializes to the `.dsb` wire format. Integrity fields are computed
    /// from the current contents, so the output always verifies.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let checksum = self.bytecode_checksum();
        let mut meta = self.metadata.clone();
        meta.checksum = checksum;
        let hash_code = meta.calculate_hash();

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);

        // The version is the one big-endian field in the header; everything
        // after it is little-endian. Preserved from the legacy format.
        out.extend_from_slice(&self.metadata.version.to_be_bytes());

        let flags: u16 = if self.debug_enabled { FLAG_DEBUG_INFO } else { 0 };
        out.extend_from_slice(&flags.to_le_bytes());

        out.extend_from_slice(&self.metadata.heap_size.to_le_bytes());
        write_string(&mut out, &self.metadata.app_name);
        write_string(&mut out, &self.metadata.app_version);
        write_string(&mut out, &self.metadata.author);
        out.extend_from_slice(&self.metadata.timestamp.to_le_bytes());
        out.extend_from_slice(&hash_code.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());

        write_u32(&mut out, self.constants.len());
        for value in &self.constants {
            write_string(&mut out, value);
        }

        write_u32(&mut out, self.globals.len());
        for name in &self.globals {
            write_string(&mut out, name);
        }

        write_u32(&mut out, self.functions.len());
        for (name, info) in &self.functions {
            write_string(&mut out, name);
            out.extend_from_slice(&info.entry_pc.to_le_bytes());
            out.push(info.param_count);
        }

        out.extend_from_slice(&self.main_entry_point.to_le_bytes());

        write_u32(&mut out, self.code.len());
        out.extend_from_slice(&self.code);

        if self.debug_enabled {
            write_u32(&mut out, self.debug_lines.len());
            for &line in &self.debug_lines {
                out.extend_from_slice(&line.to_le_bytes());
            }
        }

        out
    }

    /// Deserializes and verifies a `.dsb` image.
    pub fn deserialize(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = Reader::new(data);

        if reader.read_bytes(4)? != MAGIC {
            return Err(ModuleError::BadMagic);
        }

        let version_bytes = reader.read_bytes(2)?;
        let version = u16::from_be_bytes([version_bytes[0], version_bytes[1]]);
        if version != FORMAT_VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let flags = reader.read_u16()?;
        let has_debug = flags & FLAG_DEBUG_INFO != 0;

        let metadata = Metadata {
            version,
            heap_size: reader.read_u32()?,
            app_name: reader.read_string()?,
            app_version: reader.read_string()?,
            author: reader.read_string()?,
            timestamp: reader.read_u32()?,
            hash_code: reader.read_u32()?,
            checksum: reader.read_u16()?,
        };
        let mut module = Self {
            metadata,
            ..Self::default()
        };

        let constant_count = reader.read_u32()?;
        for _ in 0..constant_count {
            module.constants.insert(reader.read_string()?);
        }

        let global_count = reader.read_u32()?;
        for _ in 0..global_count {
            module.globals.insert(reader.read_string()?);
        }

        let function_count = reader.read_u32()?;
        for _ in 0..function_count {
            let name = reader.read_string()?;
            let entry_pc = reader.read_u32()?;
            let param_count = reader.read_u8()?;
            module.functions.insert(name, FunctionInfo { entry_pc, param_count });
        }

        module.main_entry_point = reader.read_u32()?;

        let code_len = reader.read_u32()? as usize;
        module.code = reader.read_bytes(code_len)?.to_vec();

        if has_debug {
            let debug_len = reader.read_u32()? as usize;
            module.debug_lines.reserve(debug_len);
            for _ in 0..debug_len {
                module.debug_lines.push(reader.read_u32()?);
            }
            module.debug_enabled = true;
        }

        if !module.verify_integrity() {
            return Err(ModuleError::IntegrityMismatch);
        }

        Ok(module)
    }
}

fn write_u32(out: &mut Vec<u8>, value: usize) {
    let value = u32::try_from(value).expect("section length exceeds u32 range");
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    let len = u16::try_from(value.len()).expect("string length exceeds u16 range");
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Little-endian byte cursor over a `.dsb` image.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ModuleError> {
        let end = self.pos.checked_add(len).ok_or(ModuleError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(ModuleError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ModuleError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ModuleError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ModuleError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String, ModuleError> {
        let len = usize::from(self.read_u16()?);
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ModuleError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_module() -> BytecodeModule {
        let mut module = BytecodeModule::new();
        module.metadata.app_name = "sample".to_owned();
        module.metadata.author = "tester".to_owned();
        let idx = module.add_constant("hello");
        module.emit_u16(Opcode::PushStr, idx, 1);
        module.emit(Opcode::Print, 1);
        module.add_global("counter");
        module.add_function("tick", 0);
        module.main_entry_point = 0;
        module.emit(Opcode::Halt, 2);
        module
    }

    #[test]
    fn test_constant_dedup() {
        let mut module = BytecodeModule::new();
        let a = module.add_constant("x");
        let b = module.add_constant("y");
        let c = module.add_constant("x");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(module.constants_len(), 2);
    }

    #[test]
    fn test_global_and_function_dedup() {
        let mut module = BytecodeModule::new();
        assert_eq!(module.add_global("g"), module.add_global("g"));
        let f = module.add_function("f", 2);
        assert_eq!(module.add_function("f", 9), f);
        // First registration wins for the arity until explicitly set.
        assert_eq!(module.function_info(f).map(|i| i.param_count), Some(2));
    }

    #[test]
    fn test_function_slot_zero_reserved() {
        let module = BytecodeModule::new();
        assert_eq!(module.functions_len(), 1);
        assert_eq!(module.function_name(0), Some(""));
    }

    #[test]
    fn test_integrity_round_trip() {
        let mut module = sample_module();
        module.update_integrity();
        assert!(module.verify_integrity());

        let bytes = module.serialize();
        let restored = BytecodeModule::deserialize(&bytes).expect("deserialize");
        assert!(restored.verify_integrity());
        assert_eq!(restored.serialize(), bytes);
    }

    #[test]
    fn test_mutated_code_fails_verification() {
        let mut module = sample_module();
        module.update_integrity();
        // Flip one code byte behind the module's back.
        module.code[0] ^= 0x01;
        assert!(!module.verify_integrity());
    }

    #[test]
    fn test_mutated_image_fails_deserialize() {
        let module = sample_module();
        let mut bytes = module.serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = BytecodeModule::deserialize(&bytes).unwrap_err();
        assert_eq!(err, ModuleError::IntegrityMismatch);
    }

    #[test]
    fn test_bad_magic() {
        let err = BytecodeModule::deserialize(b"NOPE").unwrap_err();
        assert_eq!(err, ModuleError::BadMagic);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample_module().serialize();
        // Version is stored big-endian right after the magic.
        bytes[4] = 0x7F;
        let err = BytecodeModule::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, ModuleError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample_module().serialize();
        let err = BytecodeModule::deserialize(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, ModuleError::Truncated | ModuleError::IntegrityMismatch));
    }

    #[test]
    fn test_debug_lines_follow_code() {
        let mut module = BytecodeModule::new();
        module.enable_debug_info();
        module.emit_i8(Opcode::PushI8, 42, 3);
        module.emit(Opcode::Halt, 4);
        assert_eq!(module.code().len(), 3);
        assert_eq!(module.source_line(0), 3);
        assert_eq!(module.source_line(1), 3);
        assert_eq!(module.source_line(2), 4);

        module.update_integrity();
        let bytes = module.serialize();
        let restored = BytecodeModule::deserialize(&bytes).expect("deserialize");
        assert!(restored.has_debug_info());
        assert_eq!(restored.source_line(2), 4);
    }

    #[test]
    fn test_patch_jump_offsets() {
        let mut module = BytecodeModule::new();
        module.emit(Opcode::Nop, 1);
        let patch_pos = module.current_position() + 1;
        module.emit_i32(Opcode::Jump, 0, 1);
        module.emit(Opcode::Nop, 1);
        let target = module.current_position();
        let offset = i32::try_from(target).unwrap() - i32::try_from(patch_pos + 4).unwrap();
        module.patch_jump(patch_pos, offset);
        assert_eq!(module.code()[patch_pos..patch_pos + 4], 1i32.to_le_bytes());
    }
}
