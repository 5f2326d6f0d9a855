//! Recursive descent parser producing [`ast`](super::ast) trees.
//!
//! This is also where the restricted-compile name policy lives: identifiers and attribute
//! names starting with `_` never make it into a syntax tree.

use super::ast::*;
use super::lexer::{tokenize, Tok, Token};
use crate::error::BuildError;

/// Parses a whole module.
pub fn parse_module(file: &str, source: &str) -> Result<Block, BuildError> {
    let tokens = tokenize(file, source)?;
    let mut parser = Parser {
        file,
        tokens,
        pos: 0,
        next_scope: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        parser.statement(&mut body)?;
    }
    Ok(body)
}

struct Parser<'a> {
    file: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    next_scope: ScopeId,
}

type PResult<T> = Result<T, BuildError>;

const AUGMENTED: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Kw(k) if *k == kw)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> BuildError {
        BuildError::Syntax {
            file: self.file.to_owned(),
            line: self.line(),
            message: message.into(),
        }
    }

    fn unexpected(&self) -> BuildError {
        let found = match self.peek() {
            Tok::Name(n) => format!("name '{n}'"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(f) => format!("number {f}"),
            Tok::Str(_) => "string".to_owned(),
            Tok::Kw(k) => format!("'{k}'"),
            Tok::Op(o) => format!("'{o}'"),
            Tok::Newline => "end of line".to_owned(),
            Tok::Indent => "unexpected indent".to_owned(),
            Tok::Dedent => "unexpected dedent".to_owned(),
            Tok::Eof => "end of file".to_owned(),
        };
        self.error(format!("invalid syntax near {found}"))
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn expect_newline(&mut self) -> PResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn check_name(&self, name: &str, line: u32) -> PResult<()> {
        if name.starts_with('_') && name != "_" {
            return Err(BuildError::ReservedName {
                file: self.file.to_owned(),
                line,
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    fn ident(&mut self) -> PResult<String> {
        let line = self.line();
        let Tok::Name(name) = self.peek().clone() else {
            return Err(self.error("expected a name"));
        };
        self.advance();
        self.check_name(&name, line)?;
        Ok(name)
    }

    fn new_scope(&mut self) -> ScopeId {
        self.next_scope += 1;
        self.next_scope
    }

    // ---- statements ----

    fn statement(&mut self, out: &mut Block) -> PResult<()> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Kw("if") => {
                self.advance();
                self.if_statement()?
            }
            Tok::Kw("while") => {
                self.advance();
                let test = self.test()?;
                let body = self.block()?;
                if self.at_kw("else") {
                    return Err(self.error("'else' on loops is not supported"));
                }
                StmtKind::While { test, body }
            }
            Tok::Kw("for") => {
                self.advance();
                let target = self.target_list()?;
                if !self.eat_kw("in") {
                    return Err(self.error("expected 'in'"));
                }
                let iter = self.test_list()?;
                let body = self.block()?;
                if self.at_kw("else") {
                    return Err(self.error("'else' on loops is not supported"));
                }
                StmtKind::For { target, iter, body }
            }
            Tok::Kw("def") => {
                self.advance();
                StmtKind::Def(self.function_def(line)?)
            }
            Tok::Kw("try") => {
                self.advance();
                self.try_statement()?
            }
            Tok::Kw(kw @ ("class" | "with" | "yield" | "async" | "await" | "del" | "assert"
            | "nonlocal" | "finally")) => {
                return Err(self.error(format!("'{kw}' is not supported")));
            }
            Tok::Indent => return Err(self.error("unexpected indent")),
            _ => {
                self.simple_statements(out)?;
                return Ok(());
            }
        };
        out.push(Stmt { kind, line });
        Ok(())
    }

    fn simple_statements(&mut self, out: &mut Block) -> PResult<()> {
        loop {
            let line = self.line();
            let kind = self.small_statement(out)?;
            if let Some(kind) = kind {
                out.push(Stmt { kind, line });
            }
            if !self.eat_op(";") {
                break;
            }
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
        }
        self.expect_newline()
    }

    /// Returns `None` when the statement pushed its own nodes (multi-module imports).
    fn small_statement(&mut self, out: &mut Block) -> PResult<Option<StmtKind>> {
        let kind = match self.peek().clone() {
            Tok::Kw("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Kw("break") => {
                self.advance();
                StmtKind::Break
            }
            Tok::Kw("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Kw("return") => {
                self.advance();
                if matches!(self.peek(), Tok::Newline | Tok::Eof) || self.at_op(";") {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.test_list()?))
                }
            }
            Tok::Kw("raise") => {
                self.advance();
                if matches!(self.peek(), Tok::Newline | Tok::Eof) || self.at_op(";") {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.test()?))
                }
            }
            Tok::Kw("global") => {
                self.advance();
                let mut names = vec![self.ident()?];
                while self.eat_op(",") {
                    names.push(self.ident()?);
                }
                StmtKind::Global(names)
            }
            Tok::Kw("import") => {
                self.advance();
                let line = self.line();
                loop {
                    let module = self.module_name()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    out.push(Stmt {
                        kind: StmtKind::Import { module, alias },
                        line,
                    });
                    if !self.eat_op(",") {
                        break;
                    }
                }
                return Ok(None);
            }
            Tok::Kw("from") => {
                self.advance();
                let module = self.module_name()?;
                if !self.eat_kw("import") {
                    return Err(self.error("expected 'import'"));
                }
                if self.at_op("*") {
                    return Err(self.error("'import *' is not supported"));
                }
                let parens = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    let name = self.ident()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !self.eat_op(",") {
                        break;
                    }
                    if parens && self.at_op(")") {
                        break;
                    }
                }
                if parens {
                    self.expect_op(")")?;
                }
                StmtKind::ImportFrom { module, names }
            }
            _ => self.expression_statement()?,
        };
        Ok(Some(kind))
    }

    fn module_name(&mut self) -> PResult<String> {
        if self.at_op(".") {
            return Err(self.error("No relative imports (yet)."));
        }
        let name = self.ident()?;
        if self.at_op(".") {
            return Err(self.error("submodules are not supported"));
        }
        Ok(name)
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.test_list()?;

        if let Tok::Op(op) = self.peek().clone() {
            if let Some((_, bin)) = AUGMENTED.iter().find(|(s, _)| *s == op) {
                self.advance();
                self.check_target(&first, false)?;
                let value = self.test_list()?;
                return Ok(StmtKind::AugAssign {
                    target: first,
                    op: *bin,
                    value,
                });
            }
        }

        if !self.at_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut targets = vec![first];
        self.advance();
        let mut value = self.test_list()?;
        while self.eat_op("=") {
            let next = self.test_list()?;
            targets.push(std::mem::replace(&mut value, next));
        }
        for target in &targets {
            self.check_target(target, true)?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn check_target(&self, target: &Expr, allow_unpack: bool) -> PResult<()> {
        match &target.kind {
            ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
            ExprKind::Tuple(items) | ExprKind::List(items) if allow_unpack => {
                for item in items {
                    self.check_target(item, true)?;
                }
                Ok(())
            }
            _ => Err(BuildError::Syntax {
                file: self.file.to_owned(),
                line: target.line,
                message: "can't assign to this expression".to_owned(),
            }),
        }
    }

    fn block(&mut self) -> PResult<Block> {
        self.expect_op(":")?;
        let mut body = Vec::new();
        if self.at(&Tok::Newline) {
            self.advance();
            if !self.at(&Tok::Indent) {
                return Err(self.error("expected an indented block"));
            }
            self.advance();
            while !self.at(&Tok::Dedent) && !self.at(&Tok::Eof) {
                self.statement(&mut body)?;
            }
            if self.at(&Tok::Dedent) {
                self.advance();
            }
        } else {
            self.simple_statements(&mut body)?;
        }
        Ok(body)
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.at_kw("elif") {
            let line = self.line();
            self.advance();
            vec![Stmt {
                kind: self.if_statement()?,
                line,
            }]
        } else if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn function_def(&mut self, line: u32) -> PResult<FunctionDef> {
        let name = self.ident()?;
        self.expect_op("(")?;
        let params = self.parameters(")")?;
        self.expect_op(")")?;
        let id = self.new_scope();
        let body = self.block()?;
        Ok(FunctionDef {
            id,
            name,
            params,
            body,
            line,
        })
    }

    fn parameters(&mut self, closing: &str) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(closing) {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error("variadic parameters are not supported"));
            }
            let name = self.ident()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicate argument '{name}'")));
            }
            let default = if self.eat_op("=") {
                Some(self.test()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn try_statement(&mut self) -> PResult<StmtKind> {
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.at_kw("except") {
            let line = self.line();
            self.advance();
            let (class, name) = if self.at_op(":") {
                (None, None)
            } else {
                let class = self.test()?;
                let name = if self.eat_kw("as") {
                    Some(self.ident()?)
                } else {
                    None
                };
                (Some(class), name)
            };
            let body = self.block()?;
            handlers.push(Handler {
                class,
                name,
                body,
                line,
            });
        }
        if handlers.is_empty() {
            return Err(self.error("expected 'except'"));
        }
        if self.at_kw("else") || self.at_kw("finally") {
            return Err(self.error("'else' and 'finally' on try are not supported"));
        }
        Ok(StmtKind::Try { body, handlers })
    }

    // ---- expressions ----

    /// Comma separated expressions; more than one (or a trailing comma) makes a tuple.
    fn test_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.ends_expression() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn target_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.or_expr_target()?;
        let target = if self.at_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_kw("in") {
                    break;
                }
                items.push(self.or_expr_target()?);
            }
            Expr::new(ExprKind::Tuple(items), line)
        } else {
            first
        };
        self.check_target(&target, true)?;
        Ok(target)
    }

    fn or_expr_target(&mut self) -> PResult<Expr> {
        // targets never contain comparisons, so `in` is left for the loop header
        self.arith()
    }

    fn ends_expression(&self) -> bool {
        match self.peek() {
            Tok::Newline | Tok::Eof => true,
            Tok::Op(op) => matches!(*op, ")" | "]" | "}" | "=" | ";" | ":")
                || AUGMENTED.iter().any(|(s, _)| s == op),
            _ => false,
        }
    }

    fn test(&mut self) -> PResult<Expr> {
        if self.at_kw("lambda") {
            return self.lambda();
        }
        let line = self.line();
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            if !self.eat_kw("else") {
                return Err(self.error("expected 'else' in conditional expression"));
            }
            let orelse = self.test()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn test_no_cond(&mut self) -> PResult<Expr> {
        if self.at_kw("lambda") {
            return self.lambda();
        }
        self.or_test()
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.parameters(":")?;
        self.expect_op(":")?;
        let id = self.new_scope();
        let body = self.test()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                id,
                params,
                body: Box::new(body),
            },
            line,
        ))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.and_test()?;
        if !self.at_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
            line,
        ))
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.not_test()?;
        if !self.at_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
            line,
        ))
    }

    fn not_test(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.eat_kw("not") {
            let operand = self.not_test()?;
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Kw("in") => CmpOp::In,
            Tok::Kw("not") if self.peek_at(1) == &Tok::Kw("in") => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Kw("is") => {
                if self.peek_at(1) == &Tok::Kw("not") {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let line = self.line();
        let left = self.arith()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push(op);
            comparators.push(self.arith()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            line,
        ))
    }

    fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
        let line = left.line;
        Expr::new(
            ExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
        )
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Self::binary(left, op, right);
        }
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.factor()?;
            left = Self::binary(left, op, right);
        }
    }

    fn factor(&mut self) -> PResult<Expr> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        let operand = self.factor()?;
        // fold negative literals so `-9223372036854775808`-style bounds stay representable
        if op == UnaryOp::Neg {
            match operand.kind {
                ExprKind::Int(i) => return Ok(Expr::new(ExprKind::Int(-i), line)),
                ExprKind::Float(f) => return Ok(Expr::new(ExprKind::Float(-f), line)),
                _ => {}
            }
        }
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.atom_expr()?;
        if self.eat_op("**") {
            let exponent = self.factor()?;
            return Ok(Self::binary(base, BinOp::Pow, exponent));
        }
        Ok(base)
    }

    fn atom_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op("(") {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    },
                    line,
                );
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else if self.eat_op(".") {
                let attr = self.ident()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> PResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_keyword =
                matches!(self.peek(), Tok::Name(_)) && self.peek_at(1) == &Tok::Op("=");
            if is_keyword {
                let name = self.ident()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.test()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let line = self.line();
        let lower = if self.at_op(":") {
            None
        } else {
            let index = self.test_list()?;
            if !self.at_op(":") {
                return Ok(index);
            }
            Some(Box::new(index))
        };
        self.expect_op(":")?;
        let upper = if self.at_op("]") || self.at_op(":") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, line))
    }

    fn atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.at(&Tok::Eof) {
            return Err(self.unexpected());
        }
        let kind = match self.advance() {
            Tok::Int(i) => ExprKind::Int(i),
            Tok::Float(f) => ExprKind::Float(f),
            Tok::Str(s) => {
                let mut s = s;
                while let Tok::Str(next) = self.peek().clone() {
                    self.advance();
                    s.push_str(&next);
                }
                ExprKind::Str(s)
            }
            Tok::Kw("None") => ExprKind::None,
            Tok::Kw("True") => ExprKind::Bool(true),
            Tok::Kw("False") => ExprKind::Bool(false),
            Tok::Name(name) => {
                self.check_name(&name, line)?;
                ExprKind::Name(name)
            }
            Tok::Op("(") => {
                if self.eat_op(")") {
                    ExprKind::Tuple(Vec::new())
                } else {
                    let inner = self.test_list()?;
                    self.expect_op(")")?;
                    return Ok(inner);
                }
            }
            Tok::Op("[") => return self.list_display(line),
            Tok::Op("{") => {
                let mut items = Vec::new();
                while !self.at_op("}") {
                    let key = self.test()?;
                    self.expect_op(":")?;
                    let value = self.test()?;
                    items.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                ExprKind::Dict(items)
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected());
            }
        };
        Ok(Expr::new(kind, line))
    }

    fn list_display(&mut self, line: u32) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line));
        }
        let first = self.test()?;
        if self.at_kw("for") {
            let id = self.new_scope();
            let mut generators = Vec::new();
            while self.eat_kw("for") {
                let target = self.target_list()?;
                if !self.eat_kw("in") {
                    return Err(self.error("expected 'in'"));
                }
                let iter = self.or_test()?;
                let mut ifs = Vec::new();
                while self.eat_kw("if") {
                    ifs.push(self.test_no_cond()?);
                }
                generators.push(Comprehension { target, iter, ifs });
            }
            self.expect_op("]")?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    id,
                    elt: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(ExprKind::List(items), line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Block {
        parse_module("t", src).unwrap()
    }

    #[test]
    fn precedence_is_respected() {
        let body = parse("x = 1 + 2 * 3 ** 2\n");
        let StmtKind::Assign { value, .. } = &body[0].kind else {
            panic!("not an assignment")
        };
        let ExprKind::BinOp { op, right, .. } = &value.kind else {
            panic!("not a binop")
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let err = parse_module("bot", "x = 1\n__import__('os')\n").unwrap_err();
        assert_eq!(
            err,
            BuildError::ReservedName {
                file: "bot".into(),
                line: 2,
                name: "__import__".into()
            }
        );
        let err = parse_module("bot", "y = x._secret\n").unwrap_err();
        assert!(matches!(err, BuildError::ReservedName { .. }));
        // the lone underscore stays usable as a throwaway name
        parse("for _ in range(3):\n    pass\n");
    }

    #[test]
    fn compound_statements_nest() {
        let src = "def f(a, b=2):\n    if a:\n        return a\n    elif b:\n        return b\n    else:\n        return None\n";
        let body = parse(src);
        let StmtKind::Def(def) = &body[0].kind else {
            panic!("not a def")
        };
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
        let StmtKind::If { orelse, .. } = &def.body[0].kind else {
            panic!("not an if")
        };
        assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn try_except_and_imports() {
        let src = "import random, math as m\nfrom helper import go as g\ntry:\n    g()\nexcept RobotError as e:\n    pass\nexcept:\n    raise\n";
        let body = parse(src);
        assert_eq!(body.len(), 4);
        let StmtKind::Try { handlers, .. } = &body[3].kind else {
            panic!("not a try")
        };
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert!(handlers[1].class.is_none());
    }

    #[test]
    fn comprehension_and_lambda_get_scopes() {
        let body = parse("xs = [a * b for a, b in pairs if a]\nf = lambda y: y + 1\n");
        let StmtKind::Assign { value, .. } = &body[0].kind else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::ListComp { id: 1, .. }));
        let StmtKind::Assign { value, .. } = &body[1].kind else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::Lambda { id: 2, .. }));
    }

    #[test]
    fn syntax_errors_carry_lines() {
        let err = parse_module("bot", "x = 1\ny = (2 +\n").unwrap_err();
        assert!(matches!(err, BuildError::Syntax { .. }));
        let err = parse_module("bot", "class A:\n    pass\n").unwrap_err();
        assert!(matches!(err, BuildError::Syntax { line: 1, .. }));
    }
}
