//! Two-pass bytecode compiler.
//!
//! Pass one lowers every function and class body so their entry points land at
//! the front of the image; pass two sets `main_entry_point` and lowers the
//! remaining top-level statements, terminated by `HALT`. Forward jumps are
//! emitted as zeroed 4-byte placeholders recorded against named labels and
//! resolved in a final patching step.
//!
//! Scoping is deliberately flat: the only locals are function parameters
//! (plus `this` in slot 0 for constructors and methods); `var` declarations
//! always target the global table, inside and outside functions alike.

use ahash::{AHashMap, AHashSet};

use super::{
    module::{BytecodeModule, Metadata},
    op::Opcode,
};
use crate::ast::{BinaryOp, Block, ClassDecl, Expr, FunctionDecl, Param, Program, Stmt, TemplatePart, UnaryOp};

/// Compiler configuration: module metadata plus whether to record per-byte
/// source lines.
#[derive(Debug, Default)]
pub struct CompileOptions {
    pub debug_info: bool,
    pub metadata: Metadata,
}

/// Compiles a program with default options.
pub fn compile(program: &Program) -> Result<BytecodeModule, Vec<String>> {
    Compiler::new(CompileOptions::default()).compile(program)
}

/// Forward jump awaiting resolution: the operand position and target label.
#[derive(Debug)]
struct JumpPatch {
    position: usize,
    label: String,
}

#[derive(Debug)]
pub struct Compiler {
    module: BytecodeModule,
    errors: Vec<String>,
    /// Current function's locals; reset per function body.
    locals: AHashMap<String, u8>,
    local_count: u8,
    patches: Vec<JumpPatch>,
    labels: AHashMap<String, usize>,
    label_seq: u32,
    /// Bare names of functions declared at the top level.
    declared_functions: AHashSet<String>,
    /// Declared classes, mapped to whether they define a constructor.
    declared_classes: AHashMap<String, bool>,
}

impl Compiler {
    #[must_use]
    pub fn new(options: CompileOptions) -> Self {
        let mut module = BytecodeModule::new();
        module.metadata = options.metadata;
        if options.debug_info {
            module.enable_debug_info();
        }

        Self {
            module,
            errors: Vec::new(),
            locals: AHashMap::new(),
            local_count: 0,
            patches: Vec::new(),
            labels: AHashMap::new(),
            label_seq: 0,
            declared_functions: AHashSet::new(),
            declared_classes: AHashMap::new(),
        }
    }

    /// Lowers `program` to a finished module, or returns the accumulated
    /// error list. The returned module has its integrity fields updated.
    pub fn compile(mut self, program: &Program) -> Result<BytecodeModule, Vec<String>> {
        let mut functions = Vec::new();
        let mut classes = Vec::new();
        let mut main_code = Vec::new();

        for stmt in &program.statements {
            match stmt {
                Stmt::FunctionDecl(func) => functions.push(func),
                Stmt::ClassDecl(class) => classes.push(class),
                other => main_code.push(other),
            }
        }

        // Register every declared name up front so call sites and function
        // references resolve regardless of declaration order.
        for func in &functions {
            self.declared_functions.insert(func.name.clone());
            let arity = self.arity(func.parameters.len(), func.line);
            self.module.add_function(&func.name, arity);
        }
        for class in &classes {
            self.declared_classes.insert(class.name.clone(), class.constructor.is_some());
            if let Some(ctor) = &class.constructor {
                // `this` occupies slot 0, so the callable arity is params + 1.
                let arity = self.arity(ctor.parameters.len() + 1, ctor.line);
                self.module.add_function(&format!("{}::constructor", class.name), arity);
            }
            for method in &class.methods {
                let arity = self.arity(method.parameters.len() + 1, method.line);
                self.module.add_function(&format!("{}::{}", class.name, method.name), arity);
            }
        }

        // Entry point 0 means "not defined", so no function body may start
        // at offset 0; a single NOP keeps the first body clear of it.
        let has_bodies = !functions.is_empty()
            || classes.iter().any(|c| c.constructor.is_some() || !c.methods.is_empty());
        if has_bodies {
            self.module.emit(Opcode::Nop, 0);
        }

        for func in functions {
            self.compile_function_decl(func);
        }
        for class in classes {
            self.compile_class_decl(class);
        }

        self.module.main_entry_point =
            u32::try_from(self.module.current_position()).expect("code size exceeds u32 range");

        for stmt in main_code {
            self.compile_statement(stmt);
        }

        self.module.emit(Opcode::Halt, 0);

        self.patch_jumps();

        if self.errors.is_empty() {
            self.module.update_integrity();
            Ok(self.module)
        } else {
            Err(self.errors)
        }
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn arity(&mut self, params: usize, line: u32) -> u8 {
        u8::try_from(params).unwrap_or_else(|_| {
            self.error(format!("Line {line}: too many parameters"));
            u8::MAX
        })
    }

    // ===== Declarations =====

    fn compile_function_decl(&mut self, func: &FunctionDecl) {
        let arity = self.arity(func.parameters.len(), func.line);
        let index = self.module.add_function(&func.name, arity);
        let entry = u32::try_from(self.module.current_position()).expect("code size exceeds u32 range");
        self.module.set_function_entry_point(index, entry);
        self.module.set_function_param_count(index, arity);

        self.enter_function();
        for param in &func.parameters {
            self.allocate_local(&param.name, param.line);
        }
        self.compile_block(&func.body);

        // Fall-off return value
        self.module.emit(Opcode::PushNull, func.line);
        self.module.emit(Opcode::Return, func.line);

        self.exit_function();
    }

    fn compile_class_decl(&mut self, class: &ClassDecl) {
        // Class name lives in the constant pool for NEW_OBJECT.
        let _ = self.module.add_constant(&class.name);

        if let Some(ctor) = &class.constructor {
            self.compile_method_body(&format!("{}::constructor", class.name), &ctor.parameters, &ctor.body, ctor.line);
        }

        for method in &class.methods {
            self.compile_method_body(
                &format!("{}::{}", class.name, method.name),
                &method.parameters,
                &method.body,
                method.line,
            );
        }
    }

    fn compile_method_body(&mut self, qualified: &str, parameters: &[Param], body: &Block, line: u32) {
        let arity = self.arity(parameters.len() + 1, line);
        let index = self.module.add_function(qualified, arity);
        let entry = u32::try_from(self.module.current_position()).expect("code size exceeds u32 range");
        self.module.set_function_entry_point(index, entry);
        self.module.set_function_param_count(index, arity);

        self.enter_function();
        self.allocate_local("this", line);
        for param in parameters {
            self.allocate_local(&param.name, param.line);
        }
        self.compile_block(body);

        self.module.emit(Opcode::PushNull, line);
        self.module.emit(Opcode::Return, line);

        self.exit_function();
    }

    fn enter_function(&mut self) {
        self.locals.clear();
        self.local_count = 0;
    }

    fn exit_function(&mut self) {
        self.locals.clear();
        self.local_count = 0;
    }

    fn allocate_local(&mut self, name: &str, line: u32) -> u8 {
        if self.local_count == u8::MAX {
            self.error(format!("Line {line}: too many local variables"));
            return u8::MAX;
        }
        let index = self.local_count;
        self.local_count += 1;
        self.locals.insert(name.to_owned(), index);
        index
    }

    // ===== Statements =====

    fn compile_statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::VarDecl {
                name, initializer, line, ..
            } => {
                self.compile_expression(initializer);
                let index = self.module.add_global(name);
                self.module.emit_u16(Opcode::StoreGlobal, index, *line);
            }
            Stmt::Assign { target, value, line, .. } => self.compile_assignment(target, value, *line),
            // Function and class bodies are lowered in pass one; a nested
            // declaration reaching this point emits nothing.
            Stmt::FunctionDecl(_) | Stmt::ClassDecl(_) => {}
            Stmt::If {
                condition,
                consequence,
                alternative,
                line,
                ..
            } => self.compile_if(condition, consequence, alternative.as_deref(), *line),
            Stmt::While {
                condition, body, line, ..
            } => self.compile_while(condition, body, *line),
            Stmt::For {
                initializer,
                condition,
                increment,
                body,
                line,
                ..
            } => self.compile_for(initializer, condition, increment, body, *line),
            Stmt::Try {
                body,
                error_var,
                catch_block,
                finally_block,
                line,
                ..
            } => self.compile_try(body, error_var.as_deref(), catch_block.as_ref(), finally_block.as_ref(), *line),
            Stmt::Return { value, line, .. } => {
                match value {
                    Some(expr) => self.compile_expression(expr),
                    None => self.module.emit(Opcode::PushNull, *line),
                }
                self.module.emit(Opcode::Return, *line);
            }
            Stmt::Block(block) => self.compile_block(block),
            Stmt::Expression { expression, line, .. } => {
                self.compile_expression(expression);
                self.module.emit(Opcode::Pop, *line);
            }
        }
    }

    fn compile_block(&mut self, block: &Block) {
        for stmt in &block.statements {
            self.compile_statement(stmt);
        }
    }

    fn compile_assignment(&mut self, target: &Expr, value: &Expr, line: u32) {
        match target {
            Expr::Identifier { name, .. } => {
                self.compile_expression(value);
                if let Some(&slot) = self.locals.get(name) {
                    self.module.emit_u8(Opcode::StoreLocal, slot, line);
                } else {
                    let index = self.module.add_global(name);
                    self.module.emit_u16(Opcode::StoreGlobal, index, line);
                }
            }
            Expr::Member { object, property, .. } => {
                // SET_FIELD expects [object, value] with value on top.
                self.compile_expression(object);
                self.compile_expression(value);
                let index = self.module.add_constant(property);
                self.module.emit_u16(Opcode::SetField, index, line);
            }
            Expr::Index { array, index, .. } => {
                // SET_INDEX expects [array, index, value] with value on top.
                self.compile_expression(array);
                self.compile_expression(index);
                self.compile_expression(value);
                self.module.emit(Opcode::SetIndex, line);
            }
            other => {
                self.error(format!("Line {}: invalid assignment target", other.line()));
            }
        }
    }

    fn compile_if(&mut self, condition: &Expr, consequence: &Block, alternative: Option<&Stmt>, line: u32) {
        self.compile_expression(condition);

        let else_label = self.next_label("else");
        let end_label = self.next_label("end");

        self.emit_jump(Opcode::JumpIfNot, &else_label, line);

        self.compile_block(consequence);

        if let Some(alt) = alternative {
            self.emit_jump(Opcode::Jump, &end_label, line);
            self.place_label(&else_label);
            self.compile_statement(alt);
            self.place_label(&end_label);
        } else {
            self.place_label(&else_label);
        }
    }

    fn compile_while(&mut self, condition: &Expr, body: &Block, line: u32) {
        let start_label = self.next_label("while_start");
        let end_label = self.next_label("while_end");

        self.place_label(&start_label);
        self.compile_expression(condition);
        self.emit_jump(Opcode::JumpIfNot, &end_label, line);

        self.compile_block(body);
        self.emit_jump(Opcode::Jump, &start_label, line);

        self.place_label(&end_label);
    }

    fn compile_for(&mut self, initializer: &Stmt, condition: &Expr, increment: &Stmt, body: &Block, line: u32) {
        self.compile_statement(initializer);

        let start_label = self.next_label("for_start");
        let end_label = self.next_label("for_end");

        self.place_label(&start_label);
        self.compile_expression(condition);
        self.emit_jump(Opcode::JumpIfNot, &end_label, line);

        self.compile_block(body);
        self.compile_statement(increment);
        self.emit_jump(Opcode::Jump, &start_label, line);

        self.place_label(&end_label);
    }

    fn compile_try(
        &mut self,
        body: &Block,
        error_var: Option<&str>,
        catch_block: Option<&Block>,
        finally_block: Option<&Block>,
        line: u32,
    ) {
        let catch_label = self.next_label("catch");
        let finally_label = self.next_label("finally");
        let end_label = self.next_label("try_end");
        let after_label = if finally_block.is_some() { &finally_label } else { &end_label };

        if catch_block.is_some() {
            self.emit_jump(Opcode::Try, &catch_label, line);
        }

        self.compile_block(body);

        if catch_block.is_some() {
            self.module.emit(Opcode::EndTry, line);
        }
        self.emit_jump(Opcode::Jump, after_label, line);

        if let Some(catch) = catch_block {
            self.place_label(&catch_label);

            // The unwinder leaves the exception value on the stack.
            match error_var {
                Some(name) => {
                    if let Some(&slot) = self.locals.get(name) {
                        self.module.emit_u8(Opcode::StoreLocal, slot, catch.line);
                    } else {
                        let index = self.module.add_global(name);
                        self.module.emit_u16(Opcode::StoreGlobal, index, catch.line);
                    }
                }
                None => self.module.emit(Opcode::Pop, catch.line),
            }

            self.compile_block(catch);
            self.emit_jump(Opcode::Jump, after_label, line);
        }

        if let Some(finally) = finally_block {
            self.place_label(&finally_label);
            self.compile_block(finally);
        }

        self.place_label(&end_label);
    }

    // ===== Expressions =====

    fn compile_expression(&mut self, expr: &Expr) {
        match expr {
            Expr::Number {
                value,
                is_float,
                is_hex,
                line,
                ..
            } => self.compile_number(value, *is_float, *is_hex, *line),
            Expr::Str { value, line, .. } => {
                let index = self.module.add_constant(value);
                self.module.emit_u16(Opcode::PushStr, index, *line);
            }
            Expr::Boolean { value, line, .. } => {
                self.module
                    .emit(if *value { Opcode::PushTrue } else { Opcode::PushFalse }, *line);
            }
            Expr::Null { line, .. } => self.module.emit(Opcode::PushNull, *line),
            Expr::Identifier { name, line, .. } => self.compile_identifier(name, *line),
            Expr::Binary {
                op, left, right, line, ..
            } => {
                self.compile_expression(left);
                self.compile_expression(right);
                self.module.emit(binary_opcode(*op), *line);
            }
            Expr::Unary { op, operand, line, .. } => {
                self.compile_expression(operand);
                match op {
                    UnaryOp::Neg => self.module.emit(Opcode::Neg, *line),
                    UnaryOp::Not => self.module.emit(Opcode::Not, *line),
                    UnaryOp::Plus => {} // no-op
                }
            }
            Expr::Ternary {
                condition,
                consequence,
                alternative,
                line,
                ..
            } => {
                self.compile_expression(condition);

                let else_label = self.next_label("ternary_else");
                let end_label = self.next_label("ternary_end");

                self.emit_jump(Opcode::JumpIfNot, &else_label, *line);
                self.compile_expression(consequence);
                self.emit_jump(Opcode::Jump, &end_label, *line);

                self.place_label(&else_label);
                self.compile_expression(alternative);
                self.place_label(&end_label);
            }
            Expr::Call {
                callee, arguments, line, ..
            } => self.compile_call(callee, arguments, *line),
            Expr::Member { object, property, line, .. } => {
                self.compile_expression(object);
                let index = self.module.add_constant(property);
                self.module.emit_u16(Opcode::GetField, index, *line);
            }
            Expr::Index { array, index, line, .. } => {
                self.compile_expression(array);
                self.compile_expression(index);
                self.module.emit(Opcode::GetIndex, *line);
            }
            Expr::ArrayLit { elements, line, .. } => {
                for element in elements {
                    self.compile_expression(element);
                }
                let len = i32::try_from(elements.len()).expect("array literal exceeds i32 range");
                self.module.emit_i32(Opcode::PushI32, len, *line);
                self.module.emit(Opcode::NewArray, *line);
            }
            Expr::CtorCall {
                type_name,
                arguments,
                line,
                ..
            } => self.compile_ctor_call(type_name, arguments, *line),
            Expr::Template { parts, line, .. } => self.compile_template(parts, *line),
            Expr::Paren { inner, .. } => self.compile_expression(inner),
        }
    }

    fn compile_identifier(&mut self, name: &str, line: u32) {
        if let Some(&slot) = self.locals.get(name) {
            self.module.emit_u8(Opcode::LoadLocal, slot, line);
        } else if self.declared_functions.contains(name) {
            // A declared function used as a value becomes a function
            // reference on the heap.
            let index = self.module.add_function(name, 0);
            self.module.emit_u16(Opcode::LoadFunction, index, line);
        } else {
            let index = self.module.add_global(name);
            self.module.emit_u16(Opcode::LoadGlobal, index, line);
        }
    }

    fn compile_call(&mut self, callee: &Expr, arguments: &[Expr], line: u32) {
        let argc = self.arity(arguments.len(), line);

        match callee {
            // Method call: arguments first, then the receiver on top.
            Expr::Member { object, property, .. } => {
                for arg in arguments {
                    self.compile_expression(arg);
                }
                self.compile_expression(object);
                let name_index = self.module.add_constant(property);
                self.module.emit_call_method(argc, name_index, line);
            }
            Expr::Identifier { name, .. } => {
                if name == "print" && arguments.len() == 1 && !self.declared_functions.contains(name) {
                    // Built-in print lowers straight to the PRINT opcode; the
                    // pushed null keeps the expression's value shape.
                    self.compile_expression(&arguments[0]);
                    self.module.emit(Opcode::Print, line);
                    self.module.emit(Opcode::PushNull, line);
                    return;
                }

                if self.declared_functions.contains(name.as_str()) {
                    for arg in arguments {
                        self.compile_expression(arg);
                    }
                    let index = self.module.add_function(name, argc);
                    self.module.emit_call(Opcode::Call, index, argc, line);
                    return;
                }

                // A variable holding a function reference: indirect call with
                // the reference under the arguments.
                if self.locals.contains_key(name.as_str()) || self.module.global_index(name).is_some() {
                    self.compile_identifier(name, line);
                    for arg in arguments {
                        self.compile_expression(arg);
                    }
                    self.module.emit_u8(Opcode::CallIndirect, argc, line);
                    return;
                }

                // Unknown name: keep a direct call so the VM reports
                // "Function not defined" at run time.
                for arg in arguments {
                    self.compile_expression(arg);
                }
                let index = self.module.add_function(name, argc);
                self.module.emit_call(Opcode::Call, index, argc, line);
            }
            other => {
                self.compile_expression(other);
                for arg in arguments {
                    self.compile_expression(arg);
                }
                self.module.emit_u8(Opcode::CallIndirect, argc, line);
            }
        }
    }

    fn compile_ctor_call(&mut self, type_name: &str, arguments: &[Expr], line: u32) {
        let class_index = self.module.add_constant(type_name);

        let has_ctor = self.declared_classes.get(type_name).copied().unwrap_or(false);
        if has_ctor {
            // NEW_OBJECT; DUP; <args>; CALL Class::constructor argc+1; POP
            // The duplicate becomes `this` (local 0); the original survives
            // below the callee's stack base as the expression result, and the
            // constructor's null return is discarded.
            let argc = self.arity(arguments.len() + 1, line);
            self.module.emit_u16(Opcode::NewObject, class_index, line);
            self.module.emit(Opcode::Dup, line);
            for arg in arguments {
                self.compile_expression(arg);
            }
            let ctor_index = self.module.add_function(&format!("{type_name}::constructor"), argc);
            self.module.emit_call(Opcode::Call, ctor_index, argc, line);
            self.module.emit(Opcode::Pop, line);
            return;
        }

        // No constructor (primitive type names included): evaluate arguments
        // for their effects, then allocate the bare object.
        for arg in arguments {
            self.compile_expression(arg);
            self.module.emit(Opcode::Pop, line);
        }
        self.module.emit_u16(Opcode::NewObject, class_index, line);
    }

    fn compile_number(&mut self, value: &str, is_float: bool, is_hex: bool, line: u32) {
        if is_float {
            match value.parse::<f32>() {
                Ok(parsed) => self.module.emit_f32(Opcode::PushF32, parsed, line),
                Err(_) => self.error(format!("Line {line}: invalid float literal '{value}'")),
            }
            return;
        }

        if is_hex {
            let digits = &value[2..];
            match u32::from_str_radix(digits, 16) {
                Ok(parsed) => self.module.emit_i32(Opcode::PushI32, parsed as i32, line),
                Err(_) => self.error(format!("Line {line}: invalid hex literal '{value}'")),
            }
            return;
        }

        match value.parse::<i32>() {
            Ok(parsed) => self.emit_int(parsed, line),
            Err(_) => self.error(format!("Line {line}: invalid number literal '{value}'")),
        }
    }

    /// Emits an integer constant with the smallest encoding that fits.
    fn emit_int(&mut self, value: i32, line: u32) {
        if let Ok(small) = i8::try_from(value) {
            self.module.emit_i8(Opcode::PushI8, small, line);
        } else if let Ok(short) = i16::try_from(value) {
            self.module.emit_i16(Opcode::PushI16, short, line);
        } else {
            self.module.emit_i32(Opcode::PushI32, value, line);
        }
    }

    fn compile_template(&mut self, parts: &[TemplatePart], line: u32) {
        if parts.is_empty() {
            let index = self.module.add_constant("");
            self.module.emit_u16(Opcode::PushStr, index, line);
            return;
        }

        self.compile_template_part(&parts[0], line);
        for part in &parts[1..] {
            self.compile_template_part(part, line);
            self.module.emit(Opcode::StrConcat, line);
        }
    }

    fn compile_template_part(&mut self, part: &TemplatePart, line: u32) {
        match part {
            TemplatePart::Text(text) => {
                let index = self.module.add_constant(text);
                self.module.emit_u16(Opcode::PushStr, index, line);
            }
            TemplatePart::Expr(expr) => self.compile_expression(expr),
        }
    }

    // ===== Labels and jumps =====

    fn next_label(&mut self, prefix: &str) -> String {
        self.label_seq += 1;
        format!("{prefix}_{}", self.label_seq)
    }

    fn emit_jump(&mut self, op: Opcode, label: &str, line: u32) {
        let position = self.module.current_position() + 1;
        self.module.emit_i32(op, 0, line);
        self.patches.push(JumpPatch {
            position,
            label: label.to_owned(),
        });
    }

    fn place_label(&mut self, label: &str) {
        self.labels.insert(label.to_owned(), self.module.current_position());
    }

    fn patch_jumps(&mut self) {
        let patches = std::mem::take(&mut self.patches);
        for patch in patches {
            if let Some(&target) = self.labels.get(&patch.label) {
                let target = i64::try_from(target).expect("label target exceeds i64");
                let after_operand = i64::try_from(patch.position + 4).expect("patch position exceeds i64");
                let offset = i32::try_from(target - after_operand).expect("jump offset exceeds i32 range");
                self.module.patch_jump(patch.position, offset);
            } else {
                self.error(format!("Undefined label: {}", patch.label));
            }
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parse::parse_program;

    fn compile_source(source: &str) -> BytecodeModule {
        let (program, errors) = parse_program(source);
        assert_eq!(errors, Vec::<String>::new(), "parse errors");
        compile(&program).expect("compile errors")
    }

    /// Top-level code of a module with no functions starts at PC 0.
    fn main_code(module: &BytecodeModule) -> &[u8] {
        &module.code()[module.main_entry_point as usize..]
    }

    #[test]
    fn test_empty_program_is_single_halt() {
        let module = compile_source("");
        assert_eq!(module.code(), &[Opcode::Halt as u8]);
    }

    #[test]
    fn test_smallest_int_encoding() {
        let mut compiler = Compiler::new(CompileOptions::default());
        for (value, expected) in [
            (0, Opcode::PushI8),
            (127, Opcode::PushI8),
            (-128, Opcode::PushI8),
            (128, Opcode::PushI16),
            (-129, Opcode::PushI16),
            (32767, Opcode::PushI16),
            (-32768, Opcode::PushI16),
            (32768, Opcode::PushI32),
            (-32769, Opcode::PushI32),
            (i32::MAX, Opcode::PushI32),
        ] {
            let before = compiler.module.current_position();
            compiler.emit_int(value, 1);
            assert_eq!(compiler.module.code()[before], expected as u8, "value {value}");
        }
    }

    #[test]
    fn test_hex_literal_compiles_as_i32() {
        let module = compile_source("var x: 0x10;");
        assert_eq!(main_code(&module)[0], Opcode::PushI32 as u8);
        assert_eq!(&main_code(&module)[1..5], &16i32.to_le_bytes());
    }

    #[test]
    fn test_var_stores_global() {
        let module = compile_source("var x: 5;");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::PushI8 as u8);
        assert_eq!(code[2], Opcode::StoreGlobal as u8);
        assert_eq!(module.global_name(0), Some("x"));
    }

    #[test]
    fn test_jump_relativity() {
        // if (true) {} compiles to PUSH_TRUE, JUMP_IF_NOT +0 -> end
        let module = compile_source("if (true) { }");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::PushTrue as u8);
        assert_eq!(code[1], Opcode::JumpIfNot as u8);
        let offset = i32::from_le_bytes([code[2], code[3], code[4], code[5]]);
        // Target is relative to the byte after the 4-byte operand.
        let target = 6 + offset as usize;
        assert_eq!(target, code.len() - 1); // lands on HALT
    }

    #[test]
    fn test_while_loops_back() {
        let module = compile_source("while (false) { }");
        let code = main_code(&module);
        // PUSH_FALSE, JUMP_IF_NOT end, JUMP start
        assert_eq!(code[0], Opcode::PushFalse as u8);
        assert_eq!(code[1], Opcode::JumpIfNot as u8);
        assert_eq!(code[6], Opcode::Jump as u8);
        let back = i32::from_le_bytes([code[7], code[8], code[9], code[10]]);
        assert_eq!(11 + back, 0); // jumps back to the condition
    }

    #[test]
    fn test_function_entry_points() {
        let module = compile_source("function f(a: int): int { return a; } var x: f(1);");
        let index = module.function_index("f").expect("f registered");
        let info = module.function_info(index).expect("info");
        // A NOP prologue keeps every real entry point nonzero.
        assert_eq!(module.code()[0], Opcode::Nop as u8);
        assert_eq!(info.entry_pc, 1);
        assert_eq!(info.param_count, 1);
        assert!(module.main_entry_point > 1);
    }

    #[test]
    fn test_method_names_are_qualified() {
        let module = compile_source("class C { v: int; constructor(x: int) { } get(): int { return 1; } }");
        assert!(module.function_index("C::constructor").is_some());
        assert!(module.function_index("C::get").is_some());
        // Receiver occupies a slot, so arity includes `this`.
        let get = module.function_index("C::get").unwrap();
        assert_eq!(module.function_info(get).map(|i| i.param_count), Some(1));
    }

    #[test]
    fn test_ctor_call_shape() {
        let module = compile_source("class C { constructor(x: int) { } } var c: C(9);");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::NewObject as u8);
        assert_eq!(code[3], Opcode::Dup as u8);
        assert_eq!(code[4], Opcode::PushI8 as u8);
        assert_eq!(code[6], Opcode::Call as u8);
        assert_eq!(code[9], 2); // argc: this + x
        assert_eq!(code[10], Opcode::Pop as u8);
    }

    #[test]
    fn test_member_call_uses_call_method() {
        let module = compile_source("var r: obj.frob(1, 2);");
        let code = main_code(&module);
        // LOAD args, LOAD_GLOBAL obj, CALL_METHOD 2 nameIdx
        let pos = code.iter().position(|&b| b == Opcode::CallMethod as u8).expect("CALL_METHOD emitted");
        assert_eq!(code[pos + 1], 2);
        let name_idx = u16::from_le_bytes([code[pos + 2], code[pos + 3]]);
        assert_eq!(module.constant(name_idx), Some("frob"));
    }

    #[test]
    fn test_print_lowers_to_print_opcode() {
        let module = compile_source("print(42);");
        let code = main_code(&module);
        assert_eq!(
            code,
            &[
                Opcode::PushI8 as u8,
                42,
                Opcode::Print as u8,
                Opcode::PushNull as u8,
                Opcode::Pop as u8,
                Opcode::Halt as u8,
            ]
        );
    }

    #[test]
    fn test_template_lowering() {
        let module = compile_source("var s: `n=${1}`;");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::PushStr as u8);
        assert_eq!(code[3], Opcode::PushI8 as u8);
        assert_eq!(code[5], Opcode::StrConcat as u8);
    }

    #[test]
    fn test_empty_template_is_empty_string() {
        let module = compile_source("var s: ``;");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::PushStr as u8);
        let idx = u16::from_le_bytes([code[1], code[2]]);
        assert_eq!(module.constant(idx), Some(""));
    }

    #[test]
    fn test_function_reference_argument() {
        let module = compile_source("function tick() { } os.timer.setInterval(tick, 10);");
        let code = &module.code()[module.main_entry_point as usize..];
        let pos = code
            .iter()
            .position(|&b| b == Opcode::LoadFunction as u8)
            .expect("LOAD_FUNCTION emitted for function argument");
        let idx = u16::from_le_bytes([code[pos + 1], code[pos + 2]]);
        assert_eq!(module.function_name(idx), Some("tick"));
    }

    #[test]
    fn test_try_catch_shape() {
        let module = compile_source("try { } catch (e) { }");
        let code = main_code(&module);
        assert_eq!(code[0], Opcode::Try as u8);
        let offset = i32::from_le_bytes([code[1], code[2], code[3], code[4]]);
        let catch_pc = 5 + usize::try_from(offset).unwrap();
        // Handler begins by storing the exception into the error variable.
        assert_eq!(code[catch_pc], Opcode::StoreGlobal as u8);
    }

    #[test]
    fn test_debug_lines_track_source() {
        let (program, errors) = parse_program("var x: 1;\nvar y: 2;");
        assert!(errors.is_empty());
        let module = Compiler::new(CompileOptions {
            debug_info: true,
            metadata: Metadata::default(),
        })
        .compile(&program)
        .expect("compile");
        assert!(module.has_debug_info());
        assert_eq!(module.source_line(0), 1);
        let last_code = module.code().len() - 2; // byte before HALT
        assert_eq!(module.source_line(last_code), 2);
    }
}
