//! Recursive-descent parser with one-token lookahead and error recovery.
//!
//! Errors never abort the parse: each is recorded as a `"Line L:C - msg"`
//! string and [`Parser::synchronize`] skips to the next `;` or
//! statement-starting keyword, so a single mistake does not cascade. Callers
//! must treat a program with a non-empty error list as uncompilable.

use crate::{
    ast::{
        BinaryOp, Block, ClassDecl, CtorDecl, Expr, FieldDecl, FunctionDecl, MethodDecl, Param, PrimitiveKind,
        Program, Stmt, TemplatePart, TypeNode, UnaryOp,
    },
    lexer::{Lexer, Token, TokenKind},
};

/// Marker for aborting the current statement; recovery happens at the
/// statement loop via `synchronize`.
struct Halt;

type PResult<T> = Result<T, Halt>;

/// Parses a full source file into a [`Program`] plus accumulated errors.
#[must_use]
pub fn parse_program(source: &str) -> (Program, Vec<String>) {
    Parser::new(Lexer::new(source)).parse()
}

pub struct Parser {
    lexer: Lexer,
    current: Token,
    errors: Vec<String>,
}

impl Parser {
    #[must_use]
    pub fn new(mut lexer: Lexer) -> Self {
        let current = lexer.next_token();
        Self {
            lexer,
            current,
            errors: Vec::new(),
        }
    }

    /// Runs the parser to end of input.
    pub fn parse(mut self) -> (Program, Vec<String>) {
        let mut program = Program::default();

        while !self.check(TokenKind::Eof) {
            match self.parse_statement() {
                Ok(stmt) => program.statements.push(stmt),
                Err(Halt) => self.synchronize(),
            }
        }

        (program, self.errors)
    }

    fn advance(&mut self) {
        self.current = self.lexer.next_token();
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> PResult<Token> {
        if self.check(kind) {
            let token = self.current.clone();
            self.advance();
            return Ok(token);
        }
        self.error(message);
        Err(Halt)
    }

    fn error(&mut self, message: &str) {
        self.errors
            .push(format!("Line {}:{} - {}", self.current.line, self.current.column, message));
    }

    /// Skips past the next `;`, or stops at the next statement-starting
    /// keyword or end of input.
    fn synchronize(&mut self) {
        self.advance();

        while !self.check(TokenKind::Eof) {
            if self.check(TokenKind::Semicolon) {
                self.advance();
                return;
            }
            if is_statement_start(self.current.kind) {
                return;
            }
            self.advance();
        }
    }

    // ===== Statements =====

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let tok = self.current.clone();
        match tok.kind {
            TokenKind::Var => {
                self.advance();
                self.parse_variable_declaration()
            }
            TokenKind::Assign => {
                self.advance();
                let stmt = self.parse_assignment(tok.line, tok.column)?;
                self.consume(TokenKind::Semicolon, "Expected ';' after assignment")?;
                Ok(stmt)
            }
            TokenKind::Function => {
                self.advance();
                self.parse_function_declaration()
            }
            TokenKind::Class => {
                self.advance();
                self.parse_class_declaration()
            }
            TokenKind::If => {
                self.advance();
                self.parse_if_statement(tok.line, tok.column)
            }
            TokenKind::While => {
                self.advance();
                self.parse_while_statement(tok.line, tok.column)
            }
            TokenKind::For => {
                self.advance();
                self.parse_for_statement(tok.line, tok.column)
            }
            TokenKind::Try => {
                self.advance();
                self.parse_try_statement(tok.line, tok.column)
            }
            TokenKind::Return => {
                self.advance();
                self.parse_return_statement(tok.line, tok.column)
            }
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            _ => {
                let expression = self.parse_expression()?;
                self.consume(TokenKind::Semicolon, "Expected ';' after expression")?;
                Ok(Stmt::Expression {
                    expression,
                    line: tok.line,
                    column: tok.column,
                })
            }
        }
    }

    /// `var name: expr ;` (the `var` keyword is already consumed.
    fn parse_variable_declaration(&mut self) -> PResult<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expected variable name")?;
        self.consume(TokenKind::Colon, "Expected ':' after variable name")?;
        let initializer = self.parse_expression()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration")?;

        Ok(Stmt::VarDecl {
            name: name.lexeme.clone(),
            initializer,
            line: name.line,
            column: name.column,
        })
    }

    /// `assign target value` without the trailing `;` (shared with `for`).
    fn parse_assignment(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        let target = self.parse_expression()?;
        let value = self.parse_expression()?;
        Ok(Stmt::Assign {
            target,
            value,
            line,
            column,
        })
    }

    fn parse_function_declaration(&mut self) -> PResult<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expected function name")?;

        self.consume(TokenKind::LParen, "Expected '(' after function name")?;
        let parameters = self.parse_parameter_list()?;
        self.consume(TokenKind::RParen, "Expected ')' after parameters")?;

        let return_type = if self.matches(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block()?;

        Ok(Stmt::FunctionDecl(FunctionDecl {
            name: name.lexeme.clone(),
            parameters,
            return_type,
            body,
            line: name.line,
            column: name.column,
        }))
    }

    fn parse_class_declaration(&mut self) -> PResult<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expected class name")?;
        self.consume(TokenKind::LBrace, "Expected '{' after class name")?;

        let mut class = ClassDecl {
            name: name.lexeme.clone(),
            fields: Vec::new(),
            constructor: None,
            methods: Vec::new(),
            line: name.line,
            column: name.column,
        };

        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let tok = self.current.clone();
            if self.matches(TokenKind::Constructor) {
                match self.parse_constructor_declaration(tok.line, tok.column) {
                    Ok(ctor) => class.constructor = Some(ctor),
                    Err(Halt) => self.synchronize(),
                }
            } else if self.check(TokenKind::Identifier) {
                // One token of lookahead decides member kind: `name(` is a
                // method, `name:` is a field.
                let member_name = self.current.clone();
                self.advance();

                if self.check(TokenKind::LParen) {
                    match self.parse_method_declaration(&member_name) {
                        Ok(method) => class.methods.push(method),
                        Err(Halt) => self.synchronize(),
                    }
                } else if self.check(TokenKind::Colon) {
                    match self.parse_field_declaration(&member_name) {
                        Ok(field) => class.fields.push(field),
                        Err(Halt) => self.synchronize(),
                    }
                } else {
                    self.error("Expected '(' or ':' after identifier in class body");
                    self.synchronize();
                }
            } else {
                self.error("Expected field, method, or constructor declaration");
                self.synchronize();
            }
        }

        self.consume(TokenKind::RBrace, "Expected '}' after class body")?;

        Ok(Stmt::ClassDecl(class))
    }

    fn parse_field_declaration(&mut self, name: &Token) -> PResult<FieldDecl> {
        self.consume(TokenKind::Colon, "Expected ':' after field name")?;
        let ty = self.parse_type()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after field declaration")?;

        Ok(FieldDecl {
            name: name.lexeme.clone(),
            ty,
            line: name.line,
            column: name.column,
        })
    }

    fn parse_constructor_declaration(&mut self, line: u32, column: u32) -> PResult<CtorDecl> {
        self.consume(TokenKind::LParen, "Expected '(' after 'constructor'")?;
        let parameters = self.parse_parameter_list()?;
        self.consume(TokenKind::RParen, "Expected ')' after parameters")?;
        let body = self.parse_block()?;

        Ok(CtorDecl {
            parameters,
            body,
            line,
            column,
        })
    }

    fn parse_method_declaration(&mut self, name: &Token) -> PResult<MethodDecl> {
        self.consume(TokenKind::LParen, "Expected '(' after method name")?;
        let parameters = self.parse_parameter_list()?;
        self.consume(TokenKind::RParen, "Expected ')' after parameters")?;

        let return_type = if self.matches(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block()?;

        Ok(MethodDecl {
            name: name.lexeme.clone(),
            parameters,
            return_type,
            body,
            line: name.line,
            column: name.column,
        })
    }

    fn parse_if_statement(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        self.consume(TokenKind::LParen, "Expected '(' after 'if'")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "Expected ')' after if condition")?;

        let consequence = self.parse_block()?;

        let alternative = if self.matches(TokenKind::Else) {
            if self.check(TokenKind::If) {
                let tok = self.current.clone();
                self.advance();
                Some(Box::new(self.parse_if_statement(tok.line, tok.column)?))
            } else {
                Some(Box::new(Stmt::Block(self.parse_block()?)))
            }
        } else {
            None
        };

        Ok(Stmt::If {
            condition,
            consequence,
            alternative,
            line,
            column,
        })
    }

    fn parse_while_statement(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        self.consume(TokenKind::LParen, "Expected '(' after 'while'")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "Expected ')' after while condition")?;
        let body = self.parse_block()?;

        Ok(Stmt::While {
            condition,
            body,
            line,
            column,
        })
    }

    fn parse_for_statement(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        self.consume(TokenKind::LParen, "Expected '(' after 'for'")?;

        self.consume(TokenKind::Var, "Expected 'var' in for initializer")?;
        let initializer = self.parse_variable_declaration()?;

        let condition = self.parse_expression()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after for condition")?;

        let step_tok = self.current.clone();
        self.consume(TokenKind::Assign, "Expected 'assign' in for increment")?;
        let increment = self.parse_assignment(step_tok.line, step_tok.column)?;

        self.consume(TokenKind::RParen, "Expected ')' after for clauses")?;
        let body = self.parse_block()?;

        Ok(Stmt::For {
            initializer: Box::new(initializer),
            condition,
            increment: Box::new(increment),
            body,
            line,
            column,
        })
    }

    fn parse_try_statement(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        let body = self.parse_block()?;

        let mut error_var = None;
        let mut catch_block = None;
        if self.matches(TokenKind::Catch) {
            self.consume(TokenKind::LParen, "Expected '(' after 'catch'")?;
            let var = self.consume(TokenKind::Identifier, "Expected error variable name")?;
            error_var = Some(var.lexeme.clone());
            self.consume(TokenKind::RParen, "Expected ')' after error variable")?;
            catch_block = Some(self.parse_block()?);
        }

        let finally_block = if self.matches(TokenKind::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };

        Ok(Stmt::Try {
            body,
            error_var,
            catch_block,
            finally_block,
            line,
            column,
        })
    }

    fn parse_return_statement(&mut self, line: u32, column: u32) -> PResult<Stmt> {
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after return statement")?;

        Ok(Stmt::Return { value, line, column })
    }

    fn parse_block(&mut self) -> PResult<Block> {
        let (line, column) = (self.current.line, self.current.column);
        self.consume(TokenKind::LBrace, "Expected '{'")?;

        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(Halt) => self.synchronize(),
            }
        }

        self.consume(TokenKind::RBrace, "Expected '}'")?;

        Ok(Block {
            statements,
            line,
            column,
        })
    }

    // ===== Expressions (precedence climbing) =====

    fn parse_expression(&mut self) -> PResult<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let expr = self.parse_logical_or()?;

        let tok = self.current.clone();
        if self.matches(TokenKind::Question) {
            let consequence = self.parse_expression()?;
            self.consume(TokenKind::Colon, "Expected ':' in ternary expression")?;
            let alternative = self.parse_expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(expr),
                consequence: Box::new(consequence),
                alternative: Box::new(alternative),
                line: tok.line,
                column: tok.column,
            });
        }

        Ok(expr)
    }

    fn parse_logical_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_logical_and()?;

        loop {
            let tok = self.current.clone();
            if !self.matches(TokenKind::Or) {
                break;
            }
            let right = self.parse_logical_and()?;
            left = binary(BinaryOp::Or, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_logical_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_equality()?;

        loop {
            let tok = self.current.clone();
            if !self.matches(TokenKind::And) {
                break;
            }
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut left = self.parse_comparison()?;

        loop {
            let tok = self.current.clone();
            let op = if self.matches(TokenKind::Equal) {
                BinaryOp::Eq
            } else if self.matches(TokenKind::NotEqual) {
                BinaryOp::Ne
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            left = binary(op, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut left = self.parse_additive()?;

        loop {
            let tok = self.current.clone();
            let op = if self.matches(TokenKind::Less) {
                BinaryOp::Lt
            } else if self.matches(TokenKind::Greater) {
                BinaryOp::Gt
            } else if self.matches(TokenKind::LessEqual) {
                BinaryOp::Le
            } else if self.matches(TokenKind::GreaterEqual) {
                BinaryOp::Ge
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = binary(op, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let tok = self.current.clone();
            let op = if self.matches(TokenKind::Plus) {
                BinaryOp::Add
            } else if self.matches(TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let tok = self.current.clone();
            let op = if self.matches(TokenKind::Star) {
                BinaryOp::Mul
            } else if self.matches(TokenKind::Slash) {
                BinaryOp::Div
            } else if self.matches(TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(op, left, right, &tok);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let tok = self.current.clone();
        let op = if self.matches(TokenKind::Not) {
            Some(UnaryOp::Not)
        } else if self.matches(TokenKind::Minus) {
            Some(UnaryOp::Neg)
        } else if self.matches(TokenKind::Plus) {
            Some(UnaryOp::Plus)
        } else {
            None
        };

        if let Some(op) = op {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                line: tok.line,
                column: tok.column,
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            let tok = self.current.clone();
            if self.matches(TokenKind::LParen) {
                let arguments = self.parse_argument_list()?;
                self.consume(TokenKind::RParen, "Expected ')' after arguments")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    arguments,
                    line: tok.line,
                    column: tok.column,
                };
            } else if self.matches(TokenKind::Dot) {
                let member = self.consume(TokenKind::Identifier, "Expected property name after '.'")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: member.lexeme.clone(),
                    line: member.line,
                    column: member.column,
                };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                self.consume(TokenKind::RBracket, "Expected ']' after array index")?;
                expr = Expr::Index {
                    array: Box::new(expr),
                    index: Box::new(index),
                    line: tok.line,
                    column: tok.column,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.current.clone();

        match tok.kind {
            TokenKind::Number => {
                self.advance();
                Ok(Expr::Number {
                    is_float: tok.lexeme.contains('.'),
                    is_hex: tok.lexeme.starts_with("0x") || tok.lexeme.starts_with("0X"),
                    value: tok.lexeme,
                    line: tok.line,
                    column: tok.column,
                })
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::Str {
                    value: tok.lexeme,
                    line: tok.line,
                    column: tok.column,
                })
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                Ok(Expr::Boolean {
                    value: tok.kind == TokenKind::True,
                    line: tok.line,
                    column: tok.column,
                })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null {
                    line: tok.line,
                    column: tok.column,
                })
            }
            TokenKind::Backtick => self.parse_template_literal(),
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.consume(TokenKind::RParen, "Expected ')' after expression")?;
                Ok(Expr::Paren {
                    inner: Box::new(inner),
                    line: tok.line,
                    column: tok.column,
                })
            }
            kind if is_type_keyword(kind) => {
                self.advance();
                // `int(x)` and friends are constructor calls; a bare type
                // keyword in expression position degrades to an identifier.
                if self.matches(TokenKind::LParen) {
                    let arguments = self.parse_argument_list()?;
                    self.consume(TokenKind::RParen, "Expected ')' after constructor arguments")?;
                    Ok(Expr::CtorCall {
                        type_name: tok.lexeme,
                        arguments,
                        line: tok.line,
                        column: tok.column,
                    })
                } else {
                    Ok(Expr::Identifier {
                        name: tok.lexeme,
                        line: tok.line,
                        column: tok.column,
                    })
                }
            }
            TokenKind::Identifier => {
                self.advance();

                // Uppercase identifier followed by `(` is a constructor call.
                if self.check(TokenKind::LParen) && tok.lexeme.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
                    self.advance();
                    let arguments = self.parse_argument_list()?;
                    self.consume(TokenKind::RParen, "Expected ')' after constructor arguments")?;
                    return Ok(Expr::CtorCall {
                        type_name: tok.lexeme,
                        arguments,
                        line: tok.line,
                        column: tok.column,
                    });
                }

                Ok(Expr::Identifier {
                    name: tok.lexeme,
                    line: tok.line,
                    column: tok.column,
                })
            }
            _ => {
                self.error("Expected expression");
                Err(Halt)
            }
        }
    }

    fn parse_argument_list(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(args)
    }

    fn parse_array_literal(&mut self) -> PResult<Expr> {
        let tok = self.current.clone();
        self.consume(TokenKind::LBracket, "Expected '['")?;

        let mut elements = Vec::new();
        if !self.check(TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::RBracket, "Expected ']'")?;

        Ok(Expr::ArrayLit {
            elements,
            line: tok.line,
            column: tok.column,
        })
    }

    fn parse_template_literal(&mut self) -> PResult<Expr> {
        let tok = self.current.clone();
        self.consume(TokenKind::Backtick, "Expected '`'")?;

        let mut parts = Vec::new();
        while !self.check(TokenKind::Backtick) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::TemplateStart) {
                let expr = self.parse_expression()?;
                self.consume(TokenKind::RBrace, "Expected '}' after template expression")?;
                parts.push(TemplatePart::Expr(expr));
            } else {
                let mut text = String::new();
                while !self.check(TokenKind::TemplateStart)
                    && !self.check(TokenKind::Backtick)
                    && !self.check(TokenKind::Eof)
                {
                    text.push_str(&self.current.lexeme);
                    self.advance();
                }
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(text));
                }
            }
        }

        self.consume(TokenKind::Backtick, "Expected '`' to close template literal")?;

        Ok(Expr::Template {
            parts,
            line: tok.line,
            column: tok.column,
        })
    }

    // ===== Types =====

    fn parse_type(&mut self) -> PResult<TypeNode> {
        let tok = self.current.clone();

        let mut ty = if let Some(kind) = primitive_kind(tok.kind) {
            self.advance();
            TypeNode::Primitive {
                kind,
                line: tok.line,
                column: tok.column,
            }
        } else if tok.kind == TokenKind::Identifier {
            self.advance();
            TypeNode::Named {
                name: tok.lexeme,
                line: tok.line,
                column: tok.column,
            }
        } else {
            self.error("Expected type");
            return Err(Halt);
        };

        // `T[]`
        if self.matches(TokenKind::LBracket) {
            self.consume(TokenKind::RBracket, "Expected ']' for array type")?;
            ty = TypeNode::Array {
                element: Box::new(ty),
                line: tok.line,
                column: tok.column,
            };
        }

        // `T?`
        if self.matches(TokenKind::Question) {
            ty = TypeNode::Nullable {
                base: Box::new(ty),
                line: tok.line,
                column: tok.column,
            };
        }

        Ok(ty)
    }

    fn parse_parameter_list(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                params.push(self.parse_parameter()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(params)
    }

    fn parse_parameter(&mut self) -> PResult<Param> {
        let name = self.consume(TokenKind::Identifier, "Expected parameter name")?;
        self.consume(TokenKind::Colon, "Expected ':' after parameter name")?;
        let ty = self.parse_type()?;

        Ok(Param {
            name: name.lexeme.clone(),
            ty,
            line: name.line,
            column: name.column,
        })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, tok: &Token) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
        line: tok.line,
        column: tok.column,
    }
}

fn is_statement_start(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Var
            | TokenKind::Assign
            | TokenKind::Function
            | TokenKind::Class
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Try
            | TokenKind::Return
            | TokenKind::LBrace
    )
}

fn is_type_keyword(kind: TokenKind) -> bool {
    primitive_kind(kind).is_some()
}

fn primitive_kind(kind: TokenKind) -> Option<PrimitiveKind> {
    let prim = match kind {
        TokenKind::Int => PrimitiveKind::Int,
        TokenKind::Uint => PrimitiveKind::Uint,
        TokenKind::Byte => PrimitiveKind::Byte,
        TokenKind::Short => PrimitiveKind::Short,
        TokenKind::Float => PrimitiveKind::Float,
        TokenKind::Bool => PrimitiveKind::Bool,
        TokenKind::StringType => PrimitiveKind::Str,
        TokenKind::Void => PrimitiveKind::Void,
        TokenKind::Any => PrimitiveKind::Any,
        _ => return None,
    };
    Some(prim)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_ok(source: &str) -> Program {
        let (program, errors) = parse_program(source);
        assert_eq!(errors, Vec::<String>::new(), "unexpected parse errors");
        program
    }

    #[test]
    fn test_var_and_assign() {
        let program = parse_ok("var x: 1 + 2; assign x x * 3;");
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(&program.statements[0], Stmt::VarDecl { name, .. } if name == "x"));
        assert!(matches!(&program.statements[1], Stmt::Assign { .. }));
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let program = parse_ok("var x: 1 + 2 * 3;");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var declaration");
        };
        let Expr::Binary { op: BinaryOp::Add, right, .. } = initializer else {
            panic!("expected top-level add");
        };
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_left_associativity() {
        // 10 - 4 - 3 parses as (10 - 4) - 3
        let program = parse_ok("var x: 10 - 4 - 3;");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var declaration");
        };
        let Expr::Binary { op: BinaryOp::Sub, left, .. } = initializer else {
            panic!("expected top-level sub");
        };
        assert!(matches!(**left, Expr::Binary { op: BinaryOp::Sub, .. }));
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse_ok("if (a) { } else if (b) { } else { }");
        let Stmt::If { alternative, .. } = &program.statements[0] else {
            panic!("expected if");
        };
        let alt = alternative.as_ref().expect("alternative present");
        assert!(matches!(**alt, Stmt::If { .. }));
    }

    #[test]
    fn test_for_requires_var_and_assign() {
        let program = parse_ok("for (var i: 0; i < 10; assign i i + 1) { }");
        let Stmt::For { initializer, increment, .. } = &program.statements[0] else {
            panic!("expected for");
        };
        assert!(matches!(**initializer, Stmt::VarDecl { .. }));
        assert!(matches!(**increment, Stmt::Assign { .. }));
    }

    #[test]
    fn test_class_body_members() {
        let program = parse_ok(
            "class Point { x: int; y: int; constructor(a: int, b: int) { } dist(): float { return 0.0; } }",
        );
        let Stmt::ClassDecl(class) = &program.statements[0] else {
            panic!("expected class");
        };
        assert_eq!(class.fields.len(), 2);
        assert!(class.constructor.is_some());
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].name, "dist");
    }

    #[test]
    fn test_constructor_call_is_uppercase() {
        let program = parse_ok("var p: Point(1, 2); var q: point(1, 2);");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var");
        };
        assert!(matches!(initializer, Expr::CtorCall { .. }));
        let Stmt::VarDecl { initializer, .. } = &program.statements[1] else {
            panic!("expected var");
        };
        assert!(matches!(initializer, Expr::Call { .. }));
    }

    #[test]
    fn test_primitive_ctor_call() {
        let program = parse_ok("var x: int(3);");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var");
        };
        assert!(matches!(initializer, Expr::CtorCall { type_name, .. } if type_name == "int"));
    }

    #[test]
    fn test_template_literal_parts() {
        let program = parse_ok("var s: `n=${n}!`;");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var");
        };
        let Expr::Template { parts, .. } = initializer else {
            panic!("expected template");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], TemplatePart::Text(t) if t == "n="));
        assert!(matches!(&parts[1], TemplatePart::Expr(_)));
        assert!(matches!(&parts[2], TemplatePart::Text(t) if t == "!"));
    }

    #[test]
    fn test_nullable_array_types() {
        let program = parse_ok("function f(xs: int[], name: string?): void { }");
        let Stmt::FunctionDecl(func) = &program.statements[0] else {
            panic!("expected function");
        };
        assert!(matches!(func.parameters[0].ty, TypeNode::Array { .. }));
        assert!(matches!(func.parameters[1].ty, TypeNode::Nullable { .. }));
    }

    #[test]
    fn test_error_recovery_continues() {
        let (program, errors) = parse_program("var : 1; var y: 2;");
        assert!(!errors.is_empty());
        assert!(errors[0].starts_with("Line 1:"));
        // The second declaration still parses after synchronize.
        assert!(
            program
                .statements
                .iter()
                .any(|s| matches!(s, Stmt::VarDecl { name, .. } if name == "y"))
        );
    }

    #[test]
    fn test_error_message_format() {
        let (_, errors) = parse_program("var x 1;");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(" - Expected ':' after variable name"));
    }

    #[test]
    fn test_ternary() {
        let program = parse_ok("var x: a < b ? 1 : 2;");
        let Stmt::VarDecl { initializer, .. } = &program.statements[0] else {
            panic!("expected var");
        };
        assert!(matches!(initializer, Expr::Ternary { .. }));
    }

    #[test]
    fn test_try_catch_finally() {
        let program = parse_ok("try { } catch (e) { } finally { }");
        let Stmt::Try {
            error_var,
            catch_block,
            finally_block,
            ..
        } = &program.statements[0]
        else {
            panic!("expected try");
        };
        assert_eq!(error_var.as_deref(), Some("e"));
        assert!(catch_block.is_some());
        assert!(finally_block.is_some());
    }
}
