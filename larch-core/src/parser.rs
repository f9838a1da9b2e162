//! Recursive-descent parser with precedence climbing.
//!
//! Statements are dispatched on their leading token; expressions use
//! precedence climbing over the total order in [`BinOp::precedence`]
//! with postfix forms (invocation, indexing, member access) bound
//! tightest. One syntax error never aborts the file: the parser
//! records a diagnostic at the exact position and resynchronizes at
//! the next statement boundary, keeping already-parsed partial nodes
//! in the output tree.

use crate::ast::{
    BinOp, ClassDecl, Expr, ExprKind, FnDecl, InterfaceDecl, Member, Param, Stmt, StmtKind,
    TypeRef, TypeRefKind, UnOp,
};
use crate::diagnostic::ErrorManager;
use crate::error::CoreError;
use crate::lexer::{Token, TokenKind};
use crate::span::Pos;

/// Parse a token sequence into top-level statements.
///
/// Returns a best-effort partial tree when errors were recorded; the
/// caller decides from the [`ErrorManager`] whether to continue.
pub fn parse(tokens: &[Token], errs: &mut ErrorManager) -> Result<Vec<Stmt>, CoreError> {
    let mut parser = Parser { tokens, index: 0 };
    parser.parse_program(errs)
}

struct Parser<'a> {
    tokens: &'a [Token],
    index: usize,
}

impl<'a> Parser<'a> {
    fn parse_program(&mut self, errs: &mut ErrorManager) -> Result<Vec<Stmt>, CoreError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.at().kind {
                TokenKind::Eof => break,
                TokenKind::BlockEnd => {
                    // Scanner guarantees balance, so this is unreachable
                    // at top level, but recover anyway.
                    self.advance();
                }
                _ => {
                    if let Some(stmt) = self.parse_stmt(errs)? {
                        stmts.push(stmt);
                    }
                }
            }
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self, errs: &mut ErrorManager) -> Result<Option<Stmt>, CoreError> {
        let pos = self.at().pos;
        match self.at().kind {
            TokenKind::Class => self.parse_class(errs).map(Some),
            TokenKind::Interface => self.parse_interface(errs).map(Some),
            TokenKind::Fn if self.peek_kind(1) == TokenKind::Ident => {
                let decl = self.parse_fn_decl(false, errs)?;
                Ok(Some(Stmt {
                    kind: StmtKind::Fn(decl),
                    pos,
                }))
            }
            TokenKind::Static => {
                self.advance();
                if self.at().kind == TokenKind::Fn {
                    let decl = self.parse_fn_decl(true, errs)?;
                    Ok(Some(Stmt {
                        kind: StmtKind::Fn(decl),
                        pos,
                    }))
                } else {
                    errs.syntax_error("expected 'fn' after 'static'", self.at().pos)?;
                    self.resync();
                    Ok(None)
                }
            }
            TokenKind::Let => self.parse_let(errs).map(Some),
            TokenKind::If => self.parse_if(errs).map(Some),
            TokenKind::While => self.parse_while(errs).map(Some),
            TokenKind::Return => {
                self.advance();
                let value = if self.at_stmt_end() {
                    None
                } else {
                    Some(self.parse_expr(errs)?)
                };
                self.expect_stmt_end(errs)?;
                Ok(Some(Stmt {
                    kind: StmtKind::Return(value),
                    pos,
                }))
            }
            TokenKind::Break => {
                self.advance();
                self.expect_stmt_end(errs)?;
                Ok(Some(Stmt {
                    kind: StmtKind::Break,
                    pos,
                }))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect_stmt_end(errs)?;
                Ok(Some(Stmt {
                    kind: StmtKind::Continue,
                    pos,
                }))
            }
            TokenKind::BlockBegin => {
                errs.syntax_error("unexpected new layer", pos)?;
                self.skip_block();
                Ok(None)
            }
            TokenKind::Newline => {
                self.advance();
                Ok(None)
            }
            _ => {
                let expr = self.parse_expr(errs)?;
                self.expect_stmt_end(errs)?;
                Ok(Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    pos,
                }))
            }
        }
    }

    fn parse_class(&mut self, errs: &mut ErrorManager) -> Result<Stmt, CoreError> {
        let pos = self.at().pos;
        self.advance(); // class
        let name = self.expect_ident("class name", errs)?;
        let params = if self.at().kind == TokenKind::LParen {
            self.parse_params(errs)?
        } else {
            Vec::new()
        };
        let supers = self.parse_supers(errs)?;
        let mut members = Vec::new();
        if self.block_follows() {
            self.enter_block(errs)?;
            loop {
                self.skip_newlines();
                match self.at().kind {
                    TokenKind::BlockEnd => {
                        self.advance();
                        break;
                    }
                    TokenKind::Eof => break,
                    TokenKind::Let => {
                        if let Some(member) = self.parse_field(errs)? {
                            members.push(member);
                        }
                    }
                    TokenKind::Fn => {
                        let decl = self.parse_fn_decl(false, errs)?;
                        members.push(Member::Method(decl));
                    }
                    TokenKind::Static => {
                        self.advance();
                        if self.at().kind == TokenKind::Fn {
                            let decl = self.parse_fn_decl(true, errs)?;
                            members.push(Member::Method(decl));
                        } else {
                            errs.syntax_error("expected 'fn' after 'static'", self.at().pos)?;
                            self.resync();
                        }
                    }
                    _ => {
                        errs.syntax_error(
                            format!("unexpected token {} in class body", self.describe()),
                            self.at().pos,
                        )?;
                        self.resync();
                    }
                }
            }
        } else {
            self.expect_stmt_end(errs)?;
        }
        Ok(Stmt {
            kind: StmtKind::Class(ClassDecl {
                name,
                params,
                supers,
                members,
                pos,
            }),
            pos,
        })
    }

    fn parse_interface(&mut self, errs: &mut ErrorManager) -> Result<Stmt, CoreError> {
        let pos = self.at().pos;
        self.advance(); // interface
        let name = self.expect_ident("interface name", errs)?;
        let supers = self.parse_supers(errs)?;
        let mut methods = Vec::new();
        if self.block_follows() {
            self.enter_block(errs)?;
            loop {
                self.skip_newlines();
                match self.at().kind {
                    TokenKind::BlockEnd => {
                        self.advance();
                        break;
                    }
                    TokenKind::Eof => break,
                    TokenKind::Fn => {
                        let decl = self.parse_fn_decl(false, errs)?;
                        methods.push(decl);
                    }
                    _ => {
                        errs.syntax_error(
                            format!("unexpected token {} in interface body", self.describe()),
                            self.at().pos,
                        )?;
                        self.resync();
                    }
                }
            }
        } else {
            self.expect_stmt_end(errs)?;
        }
        Ok(Stmt {
            kind: StmtKind::Interface(InterfaceDecl {
                name,
                supers,
                methods,
                pos,
            }),
            pos,
        })
    }

    fn parse_supers(&mut self, errs: &mut ErrorManager) -> Result<Vec<TypeRef>, CoreError> {
        let mut supers = Vec::new();
        if self.at().kind == TokenKind::Colon {
            self.advance();
            loop {
                supers.push(self.parse_type_ref(errs)?);
                if self.at().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        Ok(supers)
    }

    fn parse_field(&mut self, errs: &mut ErrorManager) -> Result<Option<Member>, CoreError> {
        let pos = self.at().pos;
        self.advance(); // let
        let name = self.expect_ident("field name", errs)?;
        if self.at().kind != TokenKind::Colon {
            errs.syntax_error("field declarations need an explicit type", self.at().pos)?;
            self.resync();
            return Ok(None);
        }
        self.advance();
        let ty = self.parse_type_ref(errs)?;
        let init = if self.is_op("=") {
            self.advance();
            Some(self.parse_expr(errs)?)
        } else {
            None
        };
        self.expect_stmt_end(errs)?;
        Ok(Some(Member::Field {
            name,
            ty,
            init,
            pos,
        }))
    }

    fn parse_fn_decl(&mut self, is_static: bool, errs: &mut ErrorManager) -> Result<FnDecl, CoreError> {
        let pos = self.at().pos;
        self.advance(); // fn
        let name = self.expect_ident("method name", errs)?;
        let params = if self.at().kind == TokenKind::LParen {
            self.parse_params(errs)?
        } else {
            errs.syntax_error("expected parameter list", self.at().pos)?;
            Vec::new()
        };
        let ret = if self.at().kind == TokenKind::Colon {
            self.advance();
            Some(self.parse_type_ref(errs)?)
        } else {
            None
        };
        let body = if self.block_follows() {
            self.enter_block(errs)?;
            Some(self.parse_stmt_list(errs)?)
        } else {
            self.expect_stmt_end(errs)?;
            None
        };
        Ok(FnDecl {
            name,
            params,
            ret,
            body,
            is_static,
            pos,
        })
    }

    fn parse_params(&mut self, errs: &mut ErrorManager) -> Result<Vec<Param>, CoreError> {
        self.advance(); // (
        let mut params = Vec::new();
        if self.at().kind == TokenKind::RParen {
            self.advance();
            return Ok(params);
        }
        loop {
            let pos = self.at().pos;
            let name = self.expect_ident("parameter name", errs)?;
            let mut ty = None;
            let mut variadic = false;
            if self.at().kind == TokenKind::Colon {
                self.advance();
                ty = Some(self.parse_type_ref(errs)?);
                if self.at().kind == TokenKind::Ellipsis {
                    self.advance();
                    variadic = true;
                }
            }
            params.push(Param {
                name,
                ty,
                variadic,
                pos,
            });
            match self.at().kind {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {
                    self.advance();
                    break;
                }
                _ => {
                    errs.syntax_error(
                        format!("expected ',' or ')', got {}", self.describe()),
                        self.at().pos,
                    )?;
                    break;
                }
            }
        }
        Ok(params)
    }

    fn parse_type_ref(&mut self, errs: &mut ErrorManager) -> Result<TypeRef, CoreError> {
        let pos = self.at().pos;
        if self.at().kind == TokenKind::Fn {
            self.advance();
            let mut params = Vec::new();
            if self.at().kind == TokenKind::LParen {
                self.advance();
                if self.at().kind != TokenKind::RParen {
                    loop {
                        params.push(self.parse_type_ref(errs)?);
                        if self.at().kind == TokenKind::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                if self.at().kind == TokenKind::RParen {
                    self.advance();
                } else {
                    errs.syntax_error("expected ')' in function type", self.at().pos)?;
                }
            } else {
                errs.syntax_error("expected '(' in function type", self.at().pos)?;
            }
            let ret = if self.at().kind == TokenKind::Colon {
                self.advance();
                Some(Box::new(self.parse_type_ref(errs)?))
            } else {
                None
            };
            return Ok(TypeRef {
                kind: TypeRefKind::Fn { params, ret },
                pos,
            });
        }
        if self.at().kind == TokenKind::Ident {
            let name = self.at().text.clone();
            self.advance();
            Ok(TypeRef {
                kind: TypeRefKind::Name(name),
                pos,
            })
        } else {
            errs.syntax_error(
                format!("expected a type name, got {}", self.describe()),
                pos,
            )?;
            Ok(TypeRef {
                kind: TypeRefKind::Name(String::from("<error>")),
                pos,
            })
        }
    }

    fn parse_let(&mut self, errs: &mut ErrorManager) -> Result<Stmt, CoreError> {
        let pos = self.at().pos;
        self.advance(); // let
        let name = self.expect_ident("variable name", errs)?;
        let ty = if self.at().kind == TokenKind::Colon {
            self.advance();
            Some(self.parse_type_ref(errs)?)
        } else {
            None
        };
        let init = if self.is_op("=") {
            self.advance();
            Some(self.parse_expr(errs)?)
        } else {
            None
        };
        self.expect_stmt_end(errs)?;
        Ok(Stmt {
            kind: StmtKind::Let { name, ty, init },
            pos,
        })
    }

    fn parse_if(&mut self, errs: &mut ErrorManager) -> Result<Stmt, CoreError> {
        let pos = self.at().pos;
        self.advance(); // if
        let cond = self.parse_expr(errs)?;
        let then_body = self.parse_body(errs)?;
        let mut elifs = Vec::new();
        while self.at().kind == TokenKind::Elif {
            self.advance();
            let elif_cond = self.parse_expr(errs)?;
            let elif_body = self.parse_body(errs)?;
            elifs.push((elif_cond, elif_body));
        }
        let else_body = if self.at().kind == TokenKind::Else {
            self.advance();
            Some(self.parse_body(errs)?)
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_body,
                elifs,
                else_body,
            },
            pos,
        })
    }

    fn parse_while(&mut self, errs: &mut ErrorManager) -> Result<Stmt, CoreError> {
        let pos = self.at().pos;
        self.advance(); // while
        let cond = self.parse_expr(errs)?;
        let body = self.parse_body(errs)?;
        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            pos,
        })
    }

    /// An indented statement block; reports and yields an empty body
    /// when the block is missing.
    fn parse_body(&mut self, errs: &mut ErrorManager) -> Result<Vec<Stmt>, CoreError> {
        if self.block_follows() {
            self.enter_block(errs)?;
            self.parse_stmt_list(errs)
        } else {
            errs.syntax_error("expected an indented block", self.at().pos)?;
            self.expect_stmt_end(errs)?;
            Ok(Vec::new())
        }
    }

    fn parse_stmt_list(&mut self, errs: &mut ErrorManager) -> Result<Vec<Stmt>, CoreError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.at().kind {
                TokenKind::BlockEnd => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                _ => {
                    if let Some(stmt) = self.parse_stmt(errs)? {
                        stmts.push(stmt);
                    }
                }
            }
        }
        Ok(stmts)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        self.parse_binary(0, errs)
    }

    fn parse_binary(&mut self, min_prec: u8, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        let mut lhs = self.parse_unary(errs)?;
        loop {
            let op = match self.at().kind {
                TokenKind::Op => BinOp::from_str(&self.at().text),
                _ => None,
            };
            let Some(op) = op else { break };
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if op.right_assoc() { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min, errs)?;
            let pos = lhs.pos;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        let pos = self.at().pos;
        let op = if self.at().kind == TokenKind::Op {
            match self.at().text.as_str() {
                "-" => Some(UnOp::Neg),
                "!" => Some(UnOp::Not),
                "~" => Some(UnOp::BitNot),
                _ => None,
            }
        } else {
            None
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary(errs)?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                pos,
            });
        }
        self.parse_postfix(errs)
    }

    fn parse_postfix(&mut self, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        let mut expr = self.parse_primary(errs)?;
        loop {
            match self.at().kind {
                TokenKind::LParen => {
                    let pos = expr.pos;
                    let args = self.parse_args(errs)?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        pos,
                    };
                }
                TokenKind::LBracket => {
                    let pos = expr.pos;
                    self.advance();
                    let index = self.parse_expr(errs)?;
                    if self.at().kind == TokenKind::RBracket {
                        self.advance();
                    } else {
                        errs.syntax_error("expected ']'", self.at().pos)?;
                    }
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    };
                }
                TokenKind::Dot => {
                    let pos = expr.pos;
                    self.advance();
                    let name = self.expect_ident("member name", errs)?;
                    expr = Expr {
                        kind: ExprKind::Member {
                            target: Box::new(expr),
                            name,
                        },
                        pos,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self, errs: &mut ErrorManager) -> Result<Vec<Expr>, CoreError> {
        self.advance(); // (
        let mut args = Vec::new();
        if self.at().kind == TokenKind::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(errs)?);
            match self.at().kind {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {
                    self.advance();
                    break;
                }
                _ => {
                    errs.syntax_error(
                        format!("expected ',' or ')', got {}", self.describe()),
                        self.at().pos,
                    )?;
                    break;
                }
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        loop {
            let pos = self.at().pos;
            let text = self.at().text.clone();
            match self.at().kind {
                TokenKind::IntLiteral => {
                    self.advance();
                    return Ok(decode_int(&text, pos, errs)?);
                }
                TokenKind::FloatLiteral => {
                    self.advance();
                    return Ok(decode_float(&text, pos, errs)?);
                }
                TokenKind::StringLiteral => {
                    self.advance();
                    let inner = &text[1..text.len() - 1];
                    return Ok(Expr {
                        kind: ExprKind::Str(unescape(inner)),
                        pos,
                    });
                }
                TokenKind::RawStringLiteral => {
                    self.advance();
                    let inner = text[3..text.len() - 3].to_string();
                    return Ok(Expr {
                        kind: ExprKind::Str(inner),
                        pos,
                    });
                }
                TokenKind::CharLiteral => {
                    self.advance();
                    let inner = unescape(&text[1..text.len() - 1]);
                    let ch = inner.chars().next().unwrap_or('\0');
                    return Ok(Expr {
                        kind: ExprKind::Char(ch),
                        pos,
                    });
                }
                TokenKind::RegexLiteral => {
                    self.advance();
                    let inner = text[2..text.len() - 2].to_string();
                    return Ok(Expr {
                        kind: ExprKind::Regex(inner),
                        pos,
                    });
                }
                TokenKind::BoolLiteral => {
                    self.advance();
                    return Ok(Expr {
                        kind: ExprKind::Bool(text == "true"),
                        pos,
                    });
                }
                TokenKind::Ident => {
                    self.advance();
                    return Ok(Expr {
                        kind: ExprKind::Ident(text),
                        pos,
                    });
                }
                TokenKind::LParen => {
                    self.advance();
                    let expr = self.parse_expr(errs)?;
                    if self.at().kind == TokenKind::RParen {
                        self.advance();
                    } else {
                        errs.syntax_error("expected ')'", self.at().pos)?;
                    }
                    return Ok(expr);
                }
                TokenKind::Fn => return self.parse_lambda(errs),
                TokenKind::Newline | TokenKind::BlockBegin | TokenKind::BlockEnd | TokenKind::Eof => {
                    // Hard boundary: leave the hole in place so the
                    // partial structure above survives.
                    errs.syntax_error("unexpected end of expression", pos)?;
                    return Ok(Expr {
                        kind: ExprKind::Error,
                        pos,
                    });
                }
                _ => {
                    // Skip the offending token once and resume; this
                    // is what lets `1+,2` still parse as `1+2`.
                    errs.syntax_error(format!("unexpected token {}", self.describe()), pos)?;
                    self.advance();
                }
            }
        }
    }

    fn parse_lambda(&mut self, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
        let pos = self.at().pos;
        self.advance(); // fn
        let params = if self.at().kind == TokenKind::LParen {
            self.parse_params(errs)?
        } else {
            errs.syntax_error("expected lambda parameter list", self.at().pos)?;
            Vec::new()
        };
        if self.at().kind == TokenKind::FatArrow {
            self.advance();
        } else {
            errs.syntax_error("expected '=>' in lambda", self.at().pos)?;
        }
        let body = if self.block_follows() {
            self.enter_block(errs)?;
            self.parse_stmt_list(errs)?
        } else {
            let value = self.parse_expr(errs)?;
            let value_pos = value.pos;
            vec![Stmt {
                kind: StmtKind::Return(Some(value)),
                pos: value_pos,
            }]
        };
        Ok(Expr {
            kind: ExprKind::Lambda { params, body },
            pos,
        })
    }

    // ------------------------------------------------------------------
    // Token helpers and recovery
    // ------------------------------------------------------------------

    fn at(&self) -> &Token {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .expect("token stream always ends with Eof")
    }

    fn peek_kind(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.index + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() {
            self.index += 1;
        }
    }

    fn skip_newlines(&mut self) {
        while self.at().kind == TokenKind::Newline {
            self.advance();
        }
    }

    fn is_op(&self, text: &str) -> bool {
        self.at().kind == TokenKind::Op && self.at().text == text
    }

    fn describe(&self) -> String {
        let tok = self.at();
        match tok.kind {
            TokenKind::Eof => String::from("end of input"),
            TokenKind::Newline => String::from("end of line"),
            TokenKind::BlockBegin => String::from("indent"),
            TokenKind::BlockEnd => String::from("dedent"),
            _ => format!("'{}'", tok.text),
        }
    }

    fn expect_ident(&mut self, what: &str, errs: &mut ErrorManager) -> Result<String, CoreError> {
        if self.at().kind == TokenKind::Ident {
            let name = self.at().text.clone();
            self.advance();
            Ok(name)
        } else {
            errs.syntax_error(
                format!("expected {}, got {}", what, self.describe()),
                self.at().pos,
            )?;
            Ok(String::from("<error>"))
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(
            self.at().kind,
            TokenKind::Newline | TokenKind::BlockEnd | TokenKind::Eof
        )
    }

    fn expect_stmt_end(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        match self.at().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::BlockEnd | TokenKind::Eof => Ok(()),
            _ => {
                errs.syntax_error(
                    format!("expected end of statement, got {}", self.describe()),
                    self.at().pos,
                )?;
                self.resync();
                Ok(())
            }
        }
    }

    /// Skip forward to the next statement boundary: a line end at the
    /// current depth, a dedent, or a statement-leading keyword.
    fn resync(&mut self) {
        loop {
            match self.at().kind {
                TokenKind::Newline => {
                    self.advance();
                    return;
                }
                TokenKind::BlockEnd | TokenKind::Eof => return,
                TokenKind::BlockBegin => {
                    self.skip_block();
                }
                TokenKind::Class
                | TokenKind::Interface
                | TokenKind::Let
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => self.advance(),
            }
        }
    }

    /// Consume a balanced block including its markers.
    fn skip_block(&mut self) {
        debug_assert_eq!(self.at().kind, TokenKind::BlockBegin);
        self.advance();
        let mut depth = 1usize;
        while depth > 0 {
            match self.at().kind {
                TokenKind::BlockBegin => depth += 1,
                TokenKind::BlockEnd => depth -= 1,
                TokenKind::Eof => return,
                _ => {}
            }
            self.advance();
        }
    }

    /// True when the current line ends and an indented block opens.
    fn block_follows(&self) -> bool {
        let mut i = self.index;
        while self
            .tokens
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Newline)
        {
            i += 1;
        }
        i > self.index
            && self
                .tokens
                .get(i)
                .is_some_and(|t| t.kind == TokenKind::BlockBegin)
    }

    /// Consume line end plus `BlockBegin`; only call after
    /// [`Parser::block_follows`] returned true.
    fn enter_block(&mut self, _errs: &mut ErrorManager) -> Result<(), CoreError> {
        self.skip_newlines();
        debug_assert_eq!(self.at().kind, TokenKind::BlockBegin);
        self.advance();
        Ok(())
    }
}

fn decode_int(text: &str, pos: Pos, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
    let long = text.ends_with('L');
    let digits = text.trim_end_matches('L').replace('_', "");
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    };
    match parsed {
        Ok(value) => Ok(Expr {
            kind: if long {
                ExprKind::Long(value)
            } else {
                ExprKind::Int(value)
            },
            pos,
        }),
        Err(_) => {
            errs.syntax_error(format!("integer literal '{}' out of range", text), pos)?;
            Ok(Expr {
                kind: ExprKind::Error,
                pos,
            })
        }
    }
}

fn decode_float(text: &str, pos: Pos, errs: &mut ErrorManager) -> Result<Expr, CoreError> {
    let single = text.ends_with('f');
    let digits = text
        .trim_end_matches(['f', 'd'])
        .replace('_', "");
    if single {
        match digits.parse::<f32>() {
            Ok(value) => Ok(Expr {
                kind: ExprKind::Float(value),
                pos,
            }),
            Err(_) => {
                errs.syntax_error(format!("invalid float literal '{}'", text), pos)?;
                Ok(Expr {
                    kind: ExprKind::Error,
                    pos,
                })
            }
        }
    } else {
        match digits.parse::<f64>() {
            Ok(value) => Ok(Expr {
                kind: ExprKind::Double(value),
                pos,
            }),
            Err(_) => {
                errs.syntax_error(format!("invalid float literal '{}'", text), pos)?;
                Ok(Expr {
                    kind: ExprKind::Error,
                    pos,
                })
            }
        }
    }
}

/// Decode escape sequences; the scanner already validated them, so
/// anything unrecognized passes through untouched.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('0') => out.push('\0'),
            Some('u') => {
                let rest = chars.as_str();
                if let Some(end) = rest.find('}') {
                    if let Some(hex) = rest.strip_prefix('{') {
                        if let Ok(code) = u32::from_str_radix(&hex[..end - 1], 16) {
                            if let Some(decoded) = char::from_u32(code) {
                                out.push(decoded);
                            }
                        }
                    }
                    for _ in 0..=end {
                        chars.next();
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{scan, ScanConfig};

    fn parse_src(source: &str) -> (Vec<Stmt>, ErrorManager) {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, source, &ScanConfig::default(), &mut errs).expect("scan");
        let stmts = parse(&tokens, &mut errs).expect("parse");
        (stmts, errs)
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (stmts, errs) = parse_src(source);
        assert!(
            !errs.has_errors(),
            "unexpected errors: {:?}",
            errs.diagnostics()
        );
        stmts
    }

    #[test]
    fn precedence_builds_expected_tree() {
        let stmts = parse_ok("1 + 2 * 3\n");
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary node");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn assignment_is_right_associative() {
        let stmts = parse_ok("a = b = 1\n");
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary node");
        };
        assert_eq!(*op, BinOp::Assign);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary {
                op: BinOp::Assign,
                ..
            }
        ));
    }

    #[test]
    fn recovers_partial_binary_from_stray_token() {
        let (stmts, errs) = parse_src("1+,2\n");
        assert_eq!(errs.error_count(), 1);
        let diag = &errs.diagnostics()[0];
        assert_eq!((diag.pos.line, diag.pos.col), (1, 3));

        // The statement still parses as the binary tree for `1+2`.
        let expected = parse_ok("1+2\n");
        let StmtKind::Expr(got) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let StmtKind::Expr(want) = &expected[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, lhs, rhs } = &got.kind else {
            panic!("expected binary node");
        };
        let ExprKind::Binary {
            op: wop,
            lhs: wlhs,
            rhs: wrhs,
        } = &want.kind
        else {
            panic!("expected binary node");
        };
        assert_eq!(op, wop);
        assert_eq!(lhs.kind, wlhs.kind);
        // The recovered right operand sits one column further right.
        assert_eq!(rhs.kind, wrhs.kind);
    }

    #[test]
    fn trailing_operator_keeps_left_operand() {
        let (stmts, errs) = parse_src("1+\n");
        assert_eq!(errs.error_count(), 1);
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, lhs, rhs } = &expr.kind else {
            panic!("expected binary node preserved");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(lhs.kind, ExprKind::Int(1)));
        assert!(matches!(rhs.kind, ExprKind::Error));
    }

    #[test]
    fn error_resyncs_to_next_statement() {
        let (stmts, errs) = parse_src("let = 3\nlet y = 4\n");
        assert!(errs.has_errors());
        // The second statement survives.
        assert!(stmts.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Let { name, .. } if name == "y"
        )));
    }

    #[test]
    fn parses_class_with_members() {
        let source = "class Point(x: int, y: int) : Shape\n    let tag: int = 0\n    fn norm(): int\n        return x * x + y * y\n    static fn origin(): Point\n        return Point(0, 0)\n";
        let stmts = parse_ok(source);
        let StmtKind::Class(decl) = &stmts[0].kind else {
            panic!("expected class");
        };
        assert_eq!(decl.name, "Point");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.supers.len(), 1);
        assert_eq!(decl.members.len(), 3);
        let Member::Method(method) = &decl.members[2] else {
            panic!("expected method");
        };
        assert!(method.is_static);
        assert_eq!(method.name, "origin");
    }

    #[test]
    fn parses_interface_signatures() {
        let stmts = parse_ok("interface Shape\n    fn area(): int\n    fn name(): str\n");
        let StmtKind::Interface(decl) = &stmts[0].kind else {
            panic!("expected interface");
        };
        assert_eq!(decl.methods.len(), 2);
        assert!(decl.methods.iter().all(|m| m.body.is_none()));
    }

    #[test]
    fn parses_if_elif_else_chain() {
        let source = "if a\n    x\nelif b\n    y\nelse\n    z\n";
        let stmts = parse_ok(source);
        let StmtKind::If {
            elifs, else_body, ..
        } = &stmts[0].kind
        else {
            panic!("expected if");
        };
        assert_eq!(elifs.len(), 1);
        assert!(else_body.is_some());
    }

    #[test]
    fn parses_lambda_expression_and_block_forms() {
        let stmts = parse_ok("let f = fn(x: int) => x + 1\nlet g = fn(x: int) =>\n    return x * 2\n");
        for stmt in &stmts {
            let StmtKind::Let { init, .. } = &stmt.kind else {
                panic!("expected let");
            };
            assert!(matches!(
                init.as_ref().map(|e| &e.kind),
                Some(ExprKind::Lambda { .. })
            ));
        }
    }

    #[test]
    fn parses_postfix_chains() {
        let stmts = parse_ok("a.b(1).c[2]\n");
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression");
        };
        assert!(matches!(expr.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn parses_variadic_parameter() {
        let stmts = parse_ok("fn maxOf(xs: int...): int\n    return 0\n");
        let StmtKind::Fn(decl) = &stmts[0].kind else {
            panic!("expected fn");
        };
        assert!(decl.params[0].variadic);
    }
}
