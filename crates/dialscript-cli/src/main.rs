//! dialScript bytecode compiler driver.
//!
//! `dialscriptc <input.ds|input.dsb> [output.dsb] [--c-array] [--debug]`
//!
//! A `.ds` input is compiled to a `.dsb` image (or a C byte-array source file
//! with `--c-array`); a `.dsb` input is deserialized, verified and
//! disassembled to stdout. Exit code 1 on any I/O, parse or compile error.

use std::{env, fmt::Write as _, fs, process::ExitCode};

use dialscript::{BytecodeModule, CompileOptions, Metadata, compile_source_with_options, disassemble};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <input.ds|input.dsb> [output.dsb] [--c-array] [--debug]", args[0]);
        eprintln!("  input.ds:  Compile dialScript source to bytecode");
        eprintln!("  input.dsb: Disassemble bytecode file");
        eprintln!("  --c-array: Output as C/C++ byte array instead of binary file");
        eprintln!("  --debug:   Include debug line information in bytecode");
        return ExitCode::FAILURE;
    }

    let input_file = &args[1];

    if input_file.ends_with(".dsb") {
        return disassemble_file(input_file);
    }

    let output_file = args
        .get(2)
        .filter(|arg| !arg.starts_with("--"))
        .map_or("output.dsb", String::as_str);
    let c_array = args.iter().skip(2).any(|arg| arg == "--c-array");
    let debug_info = args.iter().skip(2).any(|arg| arg == "--debug");

    println!("=== dialScript Bytecode Compiler ===");
    println!("Input:  {input_file}");
    println!("Output: {output_file}");
    println!();

    let source = match fs::read_to_string(input_file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: Could not open file '{input_file}': {err}");
            return ExitCode::FAILURE;
        }
    };
    println!("Source: {} bytes", source.len());
    println!();

    println!("Compiling...");
    if debug_info {
        println!("Debug info: Enabled");
    }

    let options = CompileOptions {
        debug_info,
        metadata: Metadata::default(),
    };
    let module = match compile_source_with_options(&source, options) {
        Ok(module) => module,
        Err(errors) => {
            eprintln!("Compilation errors:");
            for error in &errors {
                eprintln!("  {error}");
            }
            return ExitCode::FAILURE;
        }
    };
    println!("Compilation successful");
    println!();

    println!("=== Bytecode Statistics ===");
    println!("Code size:  {} bytes", module.code().len());
    println!("Constants:  {}", module.constants_len());
    println!("Globals:    {}", module.globals_len());
    println!("Functions:  {}", module.functions_len());
    println!();

    println!("{}", disassemble(&module));

    println!("Writing bytecode to {output_file}...");
    let bytecode = module.serialize();

    if c_array {
        let rendered = render_c_array(input_file, &bytecode);
        if let Err(err) = fs::write(output_file, rendered) {
            eprintln!("Error: Could not create file '{output_file}': {err}");
            return ExitCode::FAILURE;
        }
        println!("C array written to {output_file} ({} bytes)", bytecode.len());
    } else if let Err(err) = fs::write(output_file, &bytecode) {
        eprintln!("Error: Could not create file '{output_file}': {err}");
        return ExitCode::FAILURE;
    } else {
        println!("Bytecode file written ({} bytes)", bytecode.len());
    }

    println!();
    println!("=== Compilation Complete ===");
    ExitCode::SUCCESS
}

fn disassemble_file(input_file: &str) -> ExitCode {
    println!("=== dialScript Bytecode Disassembler ===");
    println!("Input:  {input_file}");
    println!();

    let bytes = match fs::read(input_file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error: Could not open bytecode file '{input_file}': {err}");
            return ExitCode::FAILURE;
        }
    };
    if bytes.is_empty() {
        eprintln!("Error: Bytecode file is empty");
        return ExitCode::FAILURE;
    }
    println!("Bytecode: {} bytes", bytes.len());
    println!();

    match BytecodeModule::deserialize(&bytes) {
        Ok(module) => {
            println!("{}", disassemble(&module));
            println!("=== Disassembly Complete ===");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: Failed to deserialize bytecode: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Renders the image as a C array named after the input file stem
/// (uppercased, non-alphanumerics replaced by `_`), 12 bytes per line.
fn render_c_array(input_file: &str, bytecode: &[u8]) -> String {
    let base = input_file
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input_file);
    let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);
    let array_name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "// Generated bytecode array from {input_file}");
    let _ = writeln!(out, "// Total size: {} bytes", bytecode.len());
    out.push('\n');
    let _ = writeln!(out, "const unsigned char {array_name}[] = {{");

    for (index, byte) in bytecode.iter().enumerate() {
        if index % 12 == 0 {
            out.push_str("    ");
        }
        let _ = write!(out, "{byte:#04x}");
        if index < bytecode.len() - 1 {
            out.push(',');
            if (index + 1) % 12 == 0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
    }
    out.push_str("\n};\n\n");
    let _ = writeln!(out, "const unsigned int {array_name}_SIZE = {};", bytecode.len());

    out
}
