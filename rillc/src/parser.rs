use std::fmt;

use crate::ast::*;
use crate::diagnostic::{Diagnostic, Span};
use crate::lexer::{tokenize, Token, TokenKind};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    fn new(message: &str, line: usize) -> Self {
        Self {
            message: message.to_string(),
            line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}", self.message, self.line)
    }
}

impl std::error::Error for ParseError {}

/// Parses a whole program. Parse errors synchronize to the next statement
/// boundary and parsing continues, so all diagnostics are reported in one
/// pass; any diagnostic makes the result an `Err`.
pub fn parse(source: &str) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(err) => {
            return Err(vec![Diagnostic::new(&err.message)
                .with_span(Span::line(err.line))
                .with_source(source)]);
        }
    };

    let mut parser = Parser::new(tokens);
    let mut statements = Vec::new();
    let mut diagnostics = Vec::new();

    while !parser.at_end() {
        match parser.declaration() {
            Ok(stmt) => statements.push(stmt),
            Err(err) => {
                diagnostics.push(
                    Diagnostic::new(&err.message)
                        .with_span(Span::line(err.line))
                        .with_source(source),
                );
                parser.synchronize();
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(statements)
    } else {
        Err(diagnostics)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    // declaration → let_declaration | fn_declaration | struct_declaration | statement
    fn declaration(&mut self) -> Result<Stmt, ParseError> {
        if self.match_kind(&TokenKind::Let) {
            return self.let_declaration();
        }
        if self.match_kind(&TokenKind::Fn) {
            return Ok(Stmt::Function(self.fn_declaration()?));
        }
        if self.match_kind(&TokenKind::Struct) {
            return self.struct_declaration();
        }
        self.statement()
    }

    // let_declaration → "let" IDENT ( "=" expression )? ";"
    fn let_declaration(&mut self) -> Result<Stmt, ParseError> {
        let (name, line) = self.consume_ident("Expect variable name.")?;
        let init = if self.match_kind(&TokenKind::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        self.consume(&TokenKind::Semicolon, "Expect ';' after variable declaration.")?;
        Ok(Stmt::Let { name, line, init })
    }

    // fn_declaration → IDENT "(" parameters? ")" "{" declaration* "}"
    fn fn_declaration(&mut self) -> Result<FunctionDecl, ParseError> {
        let (name, line) = self.consume_ident("Expect function name.")?;
        self.consume(&TokenKind::LParen, "Expect '(' after function name.")?;
        let params = self.parameters()?;
        self.consume(&TokenKind::RParen, "Expect ')' after parameters.")?;
        self.consume(&TokenKind::LBrace, "Expect '{' before function body.")?;
        let body = self.block_statements()?;
        Ok(FunctionDecl {
            name,
            line,
            params,
            body,
        })
    }

    fn parameters(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                if params.len() >= 255 {
                    return Err(self.error_here("Can't have more than 255 parameters."));
                }
                let (name, line) = self.consume_ident("Expect parameter name.")?;
                params.push(Param { name, line });
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(params)
    }

    // struct_declaration → "struct" IDENT "{" ( "fn" fn_declaration )* "}"
    fn struct_declaration(&mut self) -> Result<Stmt, ParseError> {
        let (name, line) = self.consume_ident("Expect struct name.")?;
        self.consume(&TokenKind::LBrace, "Expect '{' before struct body.")?;
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            self.consume(&TokenKind::Fn, "Expect 'fn' keyword before method declaration.")?;
            methods.push(self.fn_declaration()?);
        }
        self.consume(&TokenKind::RBrace, "Expect '}' after struct body.")?;
        Ok(Stmt::Struct {
            name,
            line,
            methods,
        })
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        if self.match_kind(&TokenKind::Disp) {
            return self.disp_statement();
        }
        if self.match_kind(&TokenKind::LBrace) {
            return Ok(Stmt::Block(self.block_statements()?));
        }
        if self.match_kind(&TokenKind::If) {
            return self.if_statement();
        }
        if self.match_kind(&TokenKind::While) {
            return self.while_statement();
        }
        if self.match_kind(&TokenKind::For) {
            return self.for_statement();
        }
        if self.match_kind(&TokenKind::Return) {
            return self.return_statement();
        }
        if self.match_kind(&TokenKind::Close) {
            return self.close_statement();
        }
        if self.match_kind(&TokenKind::Select) {
            return self.select_statement();
        }
        self.expr_statement()
    }

    fn disp_statement(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expect ';' after expression.")?;
        Ok(Stmt::Disp(expr))
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        let cond = self.expression()?;
        self.consume(&TokenKind::LBrace, "Expect '{' after condition.")?;
        let then_branch = Box::new(Stmt::Block(self.block_statements()?));
        let else_branch = if self.match_kind(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, ParseError> {
        let cond = self.expression()?;
        self.consume(&TokenKind::LBrace, "Expect '{' after condition.")?;
        let body = Box::new(Stmt::Block(self.block_statements()?));
        Ok(Stmt::While { cond, body })
    }

    // for_statement → "for" "(" ( let_declaration | expr_statement | ";" )
    //                 expression? ";" expression? ")" statement
    //
    // Desugars to `{ init; while (cond) { { body; step; } } }`.
    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        self.consume(&TokenKind::LParen, "Expect '(' after 'for'.")?;

        let initializer = if self.match_kind(&TokenKind::Semicolon) {
            None
        } else if self.match_kind(&TokenKind::Let) {
            Some(self.let_declaration()?)
        } else {
            Some(self.expr_statement()?)
        };

        let condition = if self.match_kind(&TokenKind::Semicolon) {
            None
        } else {
            let cond = self.expression()?;
            self.consume(&TokenKind::Semicolon, "Expect ';' after loop condition.")?;
            Some(cond)
        };

        let step = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::RParen, "Expect ')' after for clauses.")?;

        let mut body = self.statement()?;

        if let Some(step) = step {
            body = Stmt::Block(vec![body, Stmt::Expr(step)]);
        }

        let condition = condition.unwrap_or(Expr::Literal(Literal::Bool(true)));
        body = Stmt::While {
            cond: condition,
            body: Box::new(body),
        };

        if let Some(initializer) = initializer {
            body = Stmt::Block(vec![initializer, body]);
        }

        Ok(body)
    }

    fn return_statement(&mut self) -> Result<Stmt, ParseError> {
        let expr = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::Semicolon, "Expect ';' after return value.")?;
        Ok(Stmt::Return(expr))
    }

    // close_statement → "close" "(" expression ")" ";"
    fn close_statement(&mut self) -> Result<Stmt, ParseError> {
        self.consume(&TokenKind::LParen, "Expect '(' after 'close'.")?;
        let expr = self.expression()?;
        self.consume(&TokenKind::RParen, "Expect ')' after pipe expression.")?;
        self.consume(&TokenKind::Semicolon, "Expect ';' after close.")?;
        Ok(Stmt::Close(expr))
    }

    // select_statement → "select" "{" select_clause* "}"
    // select_clause    → "default" "=>" statement ";"?
    //                  | "<-" ternary "=>" statement ";"?
    //                  | ternary "<-" ternary "=>" statement ";"?
    fn select_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.previous_line();
        self.consume(&TokenKind::LBrace, "Expect '{' after 'select'.")?;
        let mut clauses = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            let clause = if self.match_kind(&TokenKind::Default) {
                self.consume(&TokenKind::FatArrow, "Expect '=>' after 'default'.")?;
                let body = self.statement()?;
                SelectClause::Default { body }
            } else if self.match_kind(&TokenKind::LeftArrow) {
                let pipe = self.ternary()?;
                self.consume(&TokenKind::FatArrow, "Expect '=>' after select case.")?;
                let body = self.statement()?;
                SelectClause::Discard { pipe, body }
            } else {
                let clause_line = self.peek_line();
                let lhs = self.ternary()?;
                self.consume(&TokenKind::LeftArrow, "Expect '<-' in select case.")?;
                let rhs = self.ternary()?;
                self.consume(&TokenKind::FatArrow, "Expect '=>' after select case.")?;
                let body = self.statement()?;
                SelectClause::Arrow {
                    lhs,
                    rhs,
                    body,
                    line: clause_line,
                }
            };
            clauses.push(clause);
            self.match_kind(&TokenKind::Semicolon);
        }
        self.consume(&TokenKind::RBrace, "Expect '}' after select cases.")?;
        Ok(Stmt::Select { clauses, line })
    }

    fn expr_statement(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expect ';' after expression.")?;
        Ok(Stmt::Expr(expr))
    }

    fn block_statements(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            statements.push(self.declaration()?);
        }
        self.consume(&TokenKind::RBrace, "Expect '}' after block.")?;
        Ok(statements)
    }

    // expression → assignment
    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.assignment()
    }

    // assignment → pipe ( ( "=" | "+=" | "-=" | "*=" | "/=" | "%=" ) assignment )?
    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let expr = self.pipe()?;

        let op = if self.match_kind(&TokenKind::Assign) {
            AssignOp::Set
        } else if self.match_kind(&TokenKind::PlusEqual) {
            AssignOp::Add
        } else if self.match_kind(&TokenKind::MinusEqual) {
            AssignOp::Sub
        } else if self.match_kind(&TokenKind::StarEqual) {
            AssignOp::Mul
        } else if self.match_kind(&TokenKind::SlashEqual) {
            AssignOp::Div
        } else if self.match_kind(&TokenKind::PercentEqual) {
            AssignOp::Mod
        } else {
            return Ok(expr);
        };

        let line = self.previous_line();
        let value = Box::new(self.assignment()?);

        match expr {
            Expr::Variable { name, line } => Ok(Expr::Assign {
                name,
                op,
                value,
                line,
            }),
            Expr::Index { target, index } => Ok(Expr::SetIndex {
                target,
                index,
                op,
                value,
            }),
            Expr::Field { target, field } => Ok(Expr::SetField {
                target,
                field,
                op,
                value,
            }),
            _ => Err(ParseError::new("Invalid assignment target.", line)),
        }
    }

    // pipe → ternary ( "<-" ternary )?
    fn pipe(&mut self) -> Result<Expr, ParseError> {
        let expr = self.ternary()?;
        if self.match_kind(&TokenKind::LeftArrow) {
            let value = self.ternary()?;
            return Ok(Expr::Send {
                pipe: Box::new(expr),
                value: Box::new(value),
            });
        }
        Ok(expr)
    }

    // ternary → logic_or ( "?" expression ":" ternary )*
    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.logic_or()?;
        while self.match_kind(&TokenKind::Question) {
            let then_branch = self.expression()?;
            self.consume(&TokenKind::Colon, "Expect ':' in ternary expression.")?;
            let else_branch = self.ternary()?;
            expr = Expr::Ternary {
                cond: Box::new(expr),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            };
        }
        Ok(expr)
    }

    fn logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.logic_and()?;
        while self.match_kind(&TokenKind::OrOr) {
            let right = self.logic_and()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicalOp::Or,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.bit_or()?;
        while self.match_kind(&TokenKind::AndAnd) {
            let right = self.bit_or()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicalOp::And,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.bit_xor()?;
        while self.match_kind(&TokenKind::Pipe) {
            let line = self.previous_line();
            let right = self.bit_xor()?;
            expr = binary(expr, BinaryOp::BitOr, right, line);
        }
        Ok(expr)
    }

    fn bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.bit_and()?;
        while self.match_kind(&TokenKind::Caret) {
            let line = self.previous_line();
            let right = self.bit_and()?;
            expr = binary(expr, BinaryOp::BitXor, right, line);
        }
        Ok(expr)
    }

    fn bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.equality()?;
        while self.match_kind(&TokenKind::Amp) {
            let line = self.previous_line();
            let right = self.equality()?;
            expr = binary(expr, BinaryOp::BitAnd, right, line);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.match_kind(&TokenKind::EqualEqual) {
                BinaryOp::Eq
            } else if self.match_kind(&TokenKind::BangEqual) {
                BinaryOp::Neq
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.comparison()?;
            expr = binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.bit_shift()?;
        loop {
            let op = if self.match_kind(&TokenKind::Greater) {
                BinaryOp::Gt
            } else if self.match_kind(&TokenKind::GreaterEqual) {
                BinaryOp::Ge
            } else if self.match_kind(&TokenKind::Less) {
                BinaryOp::Lt
            } else if self.match_kind(&TokenKind::LessEqual) {
                BinaryOp::Le
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.bit_shift()?;
            expr = binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn bit_shift(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.term()?;
        loop {
            let op = if self.match_kind(&TokenKind::Shl) {
                BinaryOp::Shl
            } else if self.match_kind(&TokenKind::Shr) {
                BinaryOp::Shr
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.term()?;
            expr = binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.match_kind(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.match_kind(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.factor()?;
            expr = binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.match_kind(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.match_kind(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.match_kind(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.unary()?;
            expr = binary(expr, op, right, line);
        }
        Ok(expr)
    }

    // unary → ( "!" | "-" | "~" | "++" | "--" | "<-" ) unary | postfix
    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = if self.match_kind(&TokenKind::Bang) {
            Some(UnaryOp::Not)
        } else if self.match_kind(&TokenKind::Minus) {
            Some(UnaryOp::Neg)
        } else if self.match_kind(&TokenKind::Tilde) {
            Some(UnaryOp::BitNot)
        } else if self.match_kind(&TokenKind::PlusPlus) {
            Some(UnaryOp::Incr)
        } else if self.match_kind(&TokenKind::MinusMinus) {
            Some(UnaryOp::Decr)
        } else {
            None
        };
        if let Some(op) = op {
            let line = self.previous_line();
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
                line,
            });
        }
        if self.match_kind(&TokenKind::LeftArrow) {
            let expr = self.unary()?;
            return Ok(Expr::Recv(Box::new(expr)));
        }
        self.call()
    }

    // call → primary ( "(" args ")" | "." IDENT | "[" expr "]" | "++" | "--" )*
    fn call(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.match_kind(&TokenKind::PlusPlus) {
                expr = Expr::Postfix {
                    op: IncDec::Incr,
                    target: Box::new(expr),
                    line: self.previous_line(),
                };
            } else if self.match_kind(&TokenKind::MinusMinus) {
                expr = Expr::Postfix {
                    op: IncDec::Decr,
                    target: Box::new(expr),
                    line: self.previous_line(),
                };
            } else if self.match_kind(&TokenKind::LParen) {
                let line = self.previous_line();
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        if args.len() >= 255 {
                            return Err(
                                self.error_here("Can't have more than 255 arguments.")
                            );
                        }
                        args.push(self.expression()?);
                        if !self.match_kind(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RParen, "Expect ')' after arguments.")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    line,
                };
            } else if self.match_kind(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.consume(&TokenKind::RBracket, "Expect ']' after index.")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.match_kind(&TokenKind::Dot) {
                let (field, _) = self.consume_ident("Expect property name after '.'.")?;
                expr = Expr::Field {
                    target: Box::new(expr),
                    field,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        if self.match_kind(&TokenKind::LBracket) {
            return self.array_literal();
        }
        if self.match_kind(&TokenKind::LBrace) {
            return self.object_literal();
        }
        if self.match_kind(&TokenKind::Fn) {
            return self.lambda_expression();
        }
        if self.match_kind(&TokenKind::Null) {
            return Ok(Expr::Literal(Literal::Null));
        }
        if self.match_kind(&TokenKind::True) {
            return Ok(Expr::Literal(Literal::Bool(true)));
        }
        if self.match_kind(&TokenKind::False) {
            return Ok(Expr::Literal(Literal::Bool(false)));
        }
        if self.match_kind(&TokenKind::SelfKw) {
            return Ok(Expr::SelfExpr {
                line: self.previous_line(),
            });
        }
        if self.match_kind(&TokenKind::Spawn) {
            return self.spawn_expression();
        }
        if self.match_kind(&TokenKind::LParen) {
            let expr = self.expression()?;
            self.consume(&TokenKind::RParen, "Expect ')' after expression.")?;
            return Ok(expr);
        }

        let token = self.advance();
        match token.kind {
            TokenKind::Int(v) => Ok(Expr::Literal(Literal::Int(v))),
            TokenKind::Float(v) => Ok(Expr::Literal(Literal::Float(v))),
            TokenKind::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            TokenKind::Ident(name) => Ok(Expr::Variable {
                name,
                line: token.line,
            }),
            _ => Err(ParseError::new("Expect expression.", token.line)),
        }
    }

    // spawn_expression → "spawn" expression? "{" declaration* "}"
    fn spawn_expression(&mut self) -> Result<Expr, ParseError> {
        let count = if self.check(&TokenKind::LBrace) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.consume(&TokenKind::LBrace, "Expect '{' after 'spawn'.")?;
        let body = self.block_statements()?;
        Ok(Expr::Spawn { count, body })
    }

    fn array_literal(&mut self) -> Result<Expr, ParseError> {
        let mut elements = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            loop {
                elements.push(self.expression()?);
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBracket, "Expect ']' after array elements.")?;
        Ok(Expr::Array(elements))
    }

    fn object_literal(&mut self) -> Result<Expr, ParseError> {
        let mut items = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let token = self.advance();
                let key = match token.kind {
                    TokenKind::Str(s) => s,
                    TokenKind::Ident(s) => s,
                    _ => {
                        return Err(ParseError::new(
                            "Expect string or identifier as object key.",
                            token.line,
                        ));
                    }
                };
                self.consume(&TokenKind::Colon, "Expect ':' after key in object literal.")?;
                let value = self.expression()?;
                items.push((key, value));
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBrace, "Expect '}' after object items.")?;
        Ok(Expr::ObjectLit(items))
    }

    // lambda_expression → "fn" "(" parameters? ")" ( "->" expression | "{" declaration* "}" )
    fn lambda_expression(&mut self) -> Result<Expr, ParseError> {
        self.consume(&TokenKind::LParen, "Expect '(' after 'fn' keyword.")?;
        let params = self.parameters()?;
        self.consume(&TokenKind::RParen, "Expect ')' after parameters.")?;

        if self.match_kind(&TokenKind::Arrow) {
            // `-> { ... }` is a statement body; `-> expr` returns the expr
            if self.match_kind(&TokenKind::LBrace) {
                let body = self.block_statements()?;
                return Ok(Expr::Lambda { params, body });
            }
            let value = self.expression()?;
            let body = vec![Stmt::Return(Some(value))];
            return Ok(Expr::Lambda { params, body });
        }

        self.consume(&TokenKind::LBrace, "Expect '{' before function body.")?;
        let body = self.block_statements()?;
        Ok(Expr::Lambda { params, body })
    }

    fn synchronize(&mut self) {
        self.advance();
        while !self.at_end() {
            if matches!(self.previous_kind(), Some(TokenKind::Semicolon)) {
                return;
            }
            match self.peek().kind {
                TokenKind::Let
                | TokenKind::Fn
                | TokenKind::Struct
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Disp
                | TokenKind::Select
                | TokenKind::Close => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn check(&self, kind: &TokenKind) -> bool {
        !self.at_end() && &self.peek().kind == kind
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Result<(), ParseError> {
        if self.check(kind) {
            self.pos += 1;
            return Ok(());
        }
        Err(self.error_here(message))
    }

    fn consume_ident(&mut self, message: &str) -> Result<(String, usize), ParseError> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            let line = self.peek().line;
            self.pos += 1;
            return Ok((name, line));
        }
        Err(self.error_here(message))
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.at_end() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_line(&self) -> usize {
        self.peek().line
    }

    fn previous_kind(&self) -> Option<TokenKind> {
        if self.pos == 0 {
            None
        } else {
            self.tokens.get(self.pos - 1).map(|t| t.kind.clone())
        }
    }

    fn previous_line(&self) -> usize {
        if self.pos == 0 {
            1
        } else {
            self.tokens[self.pos - 1].line
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn error_here(&self, message: &str) -> ParseError {
        ParseError::new(message, self.peek_line())
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr, line: usize) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
        line,
    }
}
