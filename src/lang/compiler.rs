//! Code generation from syntax trees to [`CodeUnit`]s.

use tracing::trace;

use super::ast::*;
use super::parser::parse_module;
use super::scope::{NameRef, Scope, ScopeTable, COMPREHENSION_ARG, MODULE_SCOPE};
use crate::bytecode::{CodeUnit, Comparison, Constant, Opcode, MAKE_CLOSURE, MAKE_DEFAULTS};
use crate::error::BuildError;
use crate::instrument::instruction::{encode, line_table, Instruction};

/// Compiles the source of one module into an (uninstrumented) unit.
pub fn compile_module(file: &str, source: &str) -> Result<CodeUnit, BuildError> {
    let body = parse_module(file, source)?;
    let scopes = ScopeTable::analyze(&body);
    let mut unit = UnitCompiler::new(file, &scopes, MODULE_SCOPE, "<module>", 1);
    unit.block(&body)?;
    unit.return_none();
    let unit = unit.finish()?;
    trace!(file, bytes = unit.code.len(), "compiled module");
    Ok(unit)
}

#[derive(Debug, Clone, Copy)]
struct Label(usize);

enum FrameBlock {
    Loop {
        start: Label,
        end: Label,
        holds_iterator: bool,
    },
    /// Inside the protected body of a `try`.
    Protected,
    /// Inside an `except` clause.
    Handler,
}

struct UnitCompiler<'a> {
    file: &'a str,
    scopes: &'a ScopeTable,
    scope: &'a Scope,
    name: String,
    first_line: u32,
    consts: Vec<Constant>,
    names: Vec<String>,
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    pending: Vec<(usize, Label)>,
    blocks: Vec<FrameBlock>,
    line: u32,
}

type CResult = Result<(), BuildError>;

fn comparison(op: CmpOp) -> Comparison {
    match op {
        CmpOp::Eq => Comparison::Eq,
        CmpOp::NotEq => Comparison::NotEq,
        CmpOp::Lt => Comparison::Lt,
        CmpOp::LtE => Comparison::LtE,
        CmpOp::Gt => Comparison::Gt,
        CmpOp::GtE => Comparison::GtE,
        CmpOp::In => Comparison::In,
        CmpOp::NotIn => Comparison::NotIn,
        CmpOp::Is => Comparison::Is,
        CmpOp::IsNot => Comparison::IsNot,
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySubtract,
        BinOp::Mul => Opcode::BinaryMultiply,
        BinOp::Div => Opcode::BinaryTrueDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
    }
}

fn inplace_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::InplaceAdd,
        BinOp::Sub => Opcode::InplaceSubtract,
        BinOp::Mul => Opcode::InplaceMultiply,
        BinOp::Div => Opcode::InplaceTrueDivide,
        BinOp::FloorDiv => Opcode::InplaceFloorDivide,
        BinOp::Mod => Opcode::InplaceModulo,
        BinOp::Pow => Opcode::InplacePower,
    }
}

impl<'a> UnitCompiler<'a> {
    fn new(
        file: &'a str,
        scopes: &'a ScopeTable,
        scope: ScopeId,
        name: &str,
        first_line: u32,
    ) -> Self {
        UnitCompiler {
            file,
            scopes,
            scope: scopes.get(scope),
            name: name.to_owned(),
            first_line,
            consts: Vec::new(),
            names: Vec::new(),
            instructions: Vec::new(),
            labels: Vec::new(),
            pending: Vec::new(),
            blocks: Vec::new(),
            line: first_line,
        }
    }

    fn error(&self, message: impl Into<String>) -> BuildError {
        BuildError::Syntax {
            file: self.file.to_owned(),
            line: self.line,
            message: message.into(),
        }
    }

    // ---- emission ----

    fn emit(&mut self, opcode: Opcode, arg: u32) {
        let id = self.instructions.len();
        self.instructions
            .push(Instruction::new(id, opcode, arg, Some(self.line)));
    }

    fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        let id = self.instructions.len();
        self.pending.push((id, label));
        self.instructions
            .push(Instruction::jump(id, opcode, usize::MAX, Some(self.line)));
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.instructions.len());
    }

    fn constant(&mut self, value: Constant) -> u32 {
        let reusable = !matches!(value, Constant::Code(_));
        if reusable {
            if let Some(i) = self.consts.iter().position(|c| *c == value) {
                return i as u32;
            }
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    fn load_const(&mut self, value: Constant) {
        let index = self.constant(value);
        self.emit(Opcode::LoadConst, index);
    }

    fn name_index(&mut self, name: &str) -> u32 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as u32;
        }
        self.names.push(name.to_owned());
        (self.names.len() - 1) as u32
    }

    fn load_name(&mut self, name: &str) {
        match self.scope.resolve(name) {
            NameRef::Fast(i) => self.emit(Opcode::LoadFast, i),
            NameRef::Deref(i) => self.emit(Opcode::LoadDeref, i),
            NameRef::Global => {
                let index = self.name_index(name);
                self.emit(Opcode::LoadGlobal, index);
            }
        }
    }

    fn store_name(&mut self, name: &str) {
        match self.scope.resolve(name) {
            NameRef::Fast(i) => self.emit(Opcode::StoreFast, i),
            NameRef::Deref(i) => self.emit(Opcode::StoreDeref, i),
            NameRef::Global => {
                let index = self.name_index(name);
                self.emit(Opcode::StoreGlobal, index);
            }
        }
    }

    fn return_none(&mut self) {
        self.load_const(Constant::None);
        self.emit(Opcode::ReturnValue, 0);
    }

    fn finish(mut self) -> Result<CodeUnit, BuildError> {
        for (id, label) in std::mem::take(&mut self.pending) {
            let target = self.labels[label.0]
                .filter(|&t| t < self.instructions.len())
                .ok_or_else(|| BuildError::malformed(&self.name, "unbound jump label"))?;
            self.instructions[id].jump_to = Some(target);
        }
        let code = encode(&self.name, &mut self.instructions)?;
        let lines = line_table(&self.instructions);
        let is_module = self.scope.parent.is_none();
        Ok(CodeUnit {
            name: self.name,
            filename: self.file.to_owned(),
            first_line: self.first_line,
            argcount: self.scope.argcount as u32,
            varnames: if is_module {
                Vec::new()
            } else {
                self.scope.locals.clone()
            },
            cellvars: self.scope.cells.clone(),
            freevars: self.scope.frees.clone(),
            names: self.names,
            consts: self.consts,
            code,
            lines,
            instrumented: false,
        })
    }

    // ---- statements ----

    fn block(&mut self, body: &Block) -> CResult {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.expr(e)?;
                self.emit(Opcode::PopTop, 0);
            }
            StmtKind::Assign { targets, value } => {
                self.expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Opcode::DupTop, 0);
                    }
                    self.store(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                let otherwise = self.new_label();
                let end = self.new_label();
                self.expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, otherwise);
                self.block(body)?;
                if !orelse.is_empty() {
                    self.emit_jump(Opcode::JumpForward, end);
                }
                self.bind(otherwise);
                self.block(orelse)?;
                self.bind(end);
            }
            StmtKind::While { test, body } => {
                let start = self.new_label();
                let end = self.new_label();
                self.bind(start);
                self.expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, end);
                self.blocks.push(FrameBlock::Loop {
                    start,
                    end,
                    holds_iterator: false,
                });
                self.block(body)?;
                self.blocks.pop();
                self.line = stmt.line;
                self.emit_jump(Opcode::JumpAbsolute, start);
                self.bind(end);
            }
            StmtKind::For { target, iter, body } => {
                let start = self.new_label();
                let end = self.new_label();
                self.expr(iter)?;
                self.emit(Opcode::GetIter, 0);
                self.bind(start);
                self.emit_jump(Opcode::ForIter, end);
                self.store(target)?;
                self.blocks.push(FrameBlock::Loop {
                    start,
                    end,
                    holds_iterator: true,
                });
                self.block(body)?;
                self.blocks.pop();
                self.line = stmt.line;
                self.emit_jump(Opcode::JumpAbsolute, start);
                self.bind(end);
            }
            StmtKind::Break => self.loop_exit(true)?,
            StmtKind::Continue => self.loop_exit(false)?,
            StmtKind::Pass | StmtKind::Global(_) => {}
            StmtKind::Def(def) => {
                let code = self.function_unit(def.id, &def.name, def.line, &def.params, |unit| {
                    unit.block(&def.body)?;
                    unit.return_none();
                    Ok(())
                })?;
                self.line = stmt.line;
                self.make_function(code, &def.params)?;
                self.store_name(&def.name);
            }
            StmtKind::Return(value) => {
                if self.scope.parent.is_none() {
                    return Err(self.error("'return' outside function"));
                }
                match value {
                    Some(value) => self.expr(value)?,
                    None => self.load_const(Constant::None),
                }
                self.emit(Opcode::ReturnValue, 0);
            }
            StmtKind::Try { body, handlers } => self.try_statement(body, handlers)?,
            StmtKind::Raise(value) => match value {
                Some(value) => {
                    self.expr(value)?;
                    self.emit(Opcode::RaiseVarargs, 1);
                }
                None => self.emit(Opcode::RaiseVarargs, 0),
            },
            StmtKind::Import { module, alias } => {
                let index = self.name_index(module);
                self.emit(Opcode::ImportName, index);
                self.store_name(alias.as_ref().unwrap_or(module));
            }
            StmtKind::ImportFrom { module, names } => {
                let index = self.name_index(module);
                self.emit(Opcode::ImportName, index);
                for (name, alias) in names {
                    let index = self.name_index(name);
                    self.emit(Opcode::ImportFrom, index);
                    self.store_name(alias.as_ref().unwrap_or(name));
                }
                self.emit(Opcode::PopTop, 0);
            }
        }
        Ok(())
    }

    /// `break` (`is_break`) or `continue`: unwinds the blocks entered since the loop.
    fn loop_exit(&mut self, is_break: bool) -> CResult {
        let mut unwind = Vec::new();
        let mut target = None;
        for block in self.blocks.iter().rev() {
            match block {
                FrameBlock::Protected => unwind.push(Opcode::PopBlock),
                FrameBlock::Handler => unwind.push(Opcode::PopExcept),
                FrameBlock::Loop {
                    start,
                    end,
                    holds_iterator,
                } => {
                    target = Some((*start, *end, *holds_iterator));
                    break;
                }
            }
        }
        let Some((start, end, holds_iterator)) = target else {
            let keyword = if is_break { "break" } else { "continue" };
            return Err(self.error(format!("'{keyword}' outside loop")));
        };
        for opcode in unwind {
            self.emit(opcode, 0);
        }
        if is_break {
            if holds_iterator {
                self.emit(Opcode::PopTop, 0);
            }
            self.emit_jump(Opcode::JumpAbsolute, end);
        } else {
            self.emit_jump(Opcode::JumpAbsolute, start);
        }
        Ok(())
    }

    fn try_statement(&mut self, body: &Block, handlers: &[Handler]) -> CResult {
        let dispatch = self.new_label();
        let end = self.new_label();

        self.emit_jump(Opcode::SetupExcept, dispatch);
        self.blocks.push(FrameBlock::Protected);
        self.block(body)?;
        self.blocks.pop();
        self.emit(Opcode::PopBlock, 0);
        self.emit_jump(Opcode::JumpForward, end);

        // the raised exception is on the stack
        self.bind(dispatch);
        let mut catch_all = false;
        for handler in handlers {
            self.line = handler.line;
            let next = self.new_label();
            match &handler.class {
                Some(class) => {
                    self.emit(Opcode::DupTop, 0);
                    self.expr(class)?;
                    self.emit(Opcode::CompareOp, Comparison::ExceptionMatch as u32);
                    self.emit_jump(Opcode::PopJumpIfFalse, next);
                }
                None => catch_all = true,
            }
            match &handler.name {
                Some(name) => self.store_name(name),
                None => self.emit(Opcode::PopTop, 0),
            }
            self.blocks.push(FrameBlock::Handler);
            self.block(&handler.body)?;
            self.blocks.pop();
            self.emit(Opcode::PopExcept, 0);
            self.emit_jump(Opcode::JumpForward, end);
            self.bind(next);
            if catch_all {
                break;
            }
        }
        if !catch_all {
            self.emit(Opcode::RaiseVarargs, 0);
        }
        self.bind(end);
        Ok(())
    }

    fn store(&mut self, target: &Expr) -> CResult {
        self.line = target.line;
        match &target.kind {
            ExprKind::Name(name) => self.store_name(name),
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                let index = self.name_index(attr);
                self.emit(Opcode::StoreAttr, index);
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.emit(Opcode::StoreSubscr, 0);
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                self.emit(Opcode::UnpackSequence, items.len() as u32);
                for item in items {
                    self.store(item)?;
                }
            }
            _ => return Err(self.error("can't assign to this expression")),
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> CResult {
        let opcode = inplace_opcode(op);
        match &target.kind {
            ExprKind::Name(name) => {
                self.load_name(name);
                self.expr(value)?;
                self.emit(opcode, 0);
                self.store_name(name);
            }
            ExprKind::Attribute { value: object, attr } => {
                self.expr(object)?;
                self.emit(Opcode::DupTop, 0);
                let index = self.name_index(attr);
                self.emit(Opcode::LoadAttr, index);
                self.expr(value)?;
                self.emit(opcode, 0);
                self.emit(Opcode::RotTwo, 0);
                self.emit(Opcode::StoreAttr, index);
            }
            ExprKind::Subscript {
                value: object,
                index,
            } => {
                self.expr(object)?;
                self.expr(index)?;
                self.emit(Opcode::DupTopTwo, 0);
                self.emit(Opcode::BinarySubscr, 0);
                self.expr(value)?;
                self.emit(opcode, 0);
                self.emit(Opcode::RotThree, 0);
                self.emit(Opcode::StoreSubscr, 0);
            }
            _ => return Err(self.error("illegal expression for augmented assignment")),
        }
        Ok(())
    }

    // ---- functions ----

    fn function_unit(
        &mut self,
        id: ScopeId,
        name: &str,
        line: u32,
        params: &[Param],
        body: impl FnOnce(&mut UnitCompiler<'a>) -> CResult,
    ) -> Result<CodeUnit, BuildError> {
        let mut unit = UnitCompiler::new(self.file, self.scopes, id, name, line);
        debug_assert_eq!(unit.scope.argcount, params.len());
        body(&mut unit)?;
        unit.finish()
    }

    /// Pushes defaults and closure cells, then builds the function object.
    fn make_function(&mut self, code: CodeUnit, params: &[Param]) -> CResult {
        let mut flags = 0;
        let defaults: Vec<&Expr> = params.iter().filter_map(|p| p.default.as_ref()).collect();
        if !defaults.is_empty() {
            for default in &defaults {
                self.expr(default)?;
            }
            self.emit(Opcode::BuildTuple, defaults.len() as u32);
            flags |= MAKE_DEFAULTS;
        }
        if !code.freevars.is_empty() {
            for free in &code.freevars {
                match self.scope.resolve(free) {
                    NameRef::Deref(i) => self.emit(Opcode::LoadClosure, i),
                    _ => {
                        return Err(BuildError::malformed(
                            &code.name,
                            format!("free variable '{free}' has no enclosing cell"),
                        ))
                    }
                }
            }
            self.emit(Opcode::BuildTuple, code.freevars.len() as u32);
            flags |= MAKE_CLOSURE;
        }
        self.load_const(Constant::Code(Box::new(code)));
        self.emit(Opcode::MakeFunction, flags);
        Ok(())
    }

    // ---- expressions ----

    fn expr(&mut self, expr: &Expr) -> CResult {
        self.line = expr.line;
        match &expr.kind {
            ExprKind::None => self.load_const(Constant::None),
            ExprKind::Bool(b) => self.load_const(Constant::Bool(*b)),
            ExprKind::Int(i) => self.load_const(Constant::Int(*i)),
            ExprKind::Float(f) => self.load_const(Constant::Float(*f)),
            ExprKind::Str(s) => self.load_const(Constant::Str(s.clone())),
            ExprKind::Name(name) => self.load_name(name),
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Opcode::BuildList, items.len() as u32);
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Opcode::BuildTuple, items.len() as u32);
            }
            ExprKind::Dict(items) => {
                for (key, value) in items {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.emit(Opcode::BuildMap, items.len() as u32);
            }
            ExprKind::BinOp { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.line = expr.line;
                self.emit(binary_opcode(*op), 0);
            }
            ExprKind::UnaryOp { op, operand } => {
                self.expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::UnaryNegative,
                    UnaryOp::Pos => Opcode::UnaryPositive,
                    UnaryOp::Not => Opcode::UnaryNot,
                };
                self.emit(opcode, 0);
            }
            ExprKind::BoolOp { op, values } => {
                let end = self.new_label();
                let jump = match op {
                    BoolOp::And => Opcode::JumpIfFalseOrPop,
                    BoolOp::Or => Opcode::JumpIfTrueOrPop,
                };
                for (i, value) in values.iter().enumerate() {
                    self.expr(value)?;
                    if i + 1 < values.len() {
                        self.emit_jump(jump, end);
                    }
                }
                self.bind(end);
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compare(left, ops, comparators)?,
            ExprKind::Call { func, args, kwargs } => {
                self.expr(func)?;
                for arg in args {
                    self.expr(arg)?;
                }
                for (_, value) in kwargs {
                    self.expr(value)?;
                }
                self.line = expr.line;
                let argc = (args.len() + kwargs.len()) as u32;
                if kwargs.is_empty() {
                    self.emit(Opcode::CallFunction, argc);
                } else {
                    let keys = kwargs
                        .iter()
                        .map(|(k, _)| Constant::Str(k.clone()))
                        .collect();
                    self.load_const(Constant::Tuple(keys));
                    self.emit(Opcode::CallFunctionKw, argc);
                }
            }
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                let index = self.name_index(attr);
                self.emit(Opcode::LoadAttr, index);
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.line = expr.line;
                self.emit(Opcode::BinarySubscr, 0);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper] {
                    match part {
                        Some(part) => self.expr(part)?,
                        None => self.load_const(Constant::None),
                    }
                }
                match step {
                    Some(step) => {
                        self.expr(step)?;
                        self.emit(Opcode::BuildSlice, 3);
                    }
                    None => self.emit(Opcode::BuildSlice, 2),
                }
            }
            ExprKind::IfExp { test, body, orelse } => {
                let otherwise = self.new_label();
                let end = self.new_label();
                self.expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, otherwise);
                self.expr(body)?;
                self.emit_jump(Opcode::JumpForward, end);
                self.bind(otherwise);
                self.expr(orelse)?;
                self.bind(end);
            }
            ExprKind::Lambda { id, params, body } => {
                let code = self.function_unit(*id, "<lambda>", expr.line, params, |unit| {
                    unit.expr(body)?;
                    unit.emit(Opcode::ReturnValue, 0);
                    Ok(())
                })?;
                self.line = expr.line;
                self.make_function(code, params)?;
            }
            ExprKind::ListComp {
                id,
                elt,
                generators,
            } => self.list_comprehension(*id, elt, generators, expr.line)?,
        }
        Ok(())
    }

    fn compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> CResult {
        self.expr(left)?;
        if ops.len() == 1 {
            self.expr(&comparators[0])?;
            self.emit(Opcode::CompareOp, comparison(ops[0]) as u32);
            return Ok(());
        }
        let cleanup = self.new_label();
        let end = self.new_label();
        let last = ops.len() - 1;
        for (i, (op, comparator)) in ops.iter().zip(comparators).enumerate() {
            self.expr(comparator)?;
            if i < last {
                self.emit(Opcode::DupTop, 0);
                self.emit(Opcode::RotThree, 0);
                self.emit(Opcode::CompareOp, comparison(*op) as u32);
                self.emit_jump(Opcode::JumpIfFalseOrPop, cleanup);
            } else {
                self.emit(Opcode::CompareOp, comparison(*op) as u32);
            }
        }
        self.emit_jump(Opcode::JumpForward, end);
        self.bind(cleanup);
        self.emit(Opcode::RotTwo, 0);
        self.emit(Opcode::PopTop, 0);
        self.bind(end);
        Ok(())
    }

    fn list_comprehension(
        &mut self,
        id: ScopeId,
        elt: &Expr,
        generators: &[Comprehension],
        line: u32,
    ) -> CResult {
        let Some(first) = generators.first() else {
            return Err(self.error("comprehension without 'for'"));
        };
        let param = [Param {
            name: COMPREHENSION_ARG.to_owned(),
            default: None,
        }];
        let code = self.function_unit(id, "<listcomp>", line, &param, |unit| {
            unit.line = line;
            unit.emit(Opcode::BuildList, 0);
            unit.comprehension_loop(elt, generators, 0)?;
            unit.emit(Opcode::ReturnValue, 0);
            Ok(())
        })?;
        self.line = line;
        self.make_function(code, &[])?;
        self.expr(&first.iter)?;
        self.emit(Opcode::GetIter, 0);
        self.emit(Opcode::CallFunction, 1);
        Ok(())
    }

    fn comprehension_loop(
        &mut self,
        elt: &Expr,
        generators: &[Comprehension],
        depth: usize,
    ) -> CResult {
        let generator = &generators[depth];
        let start = self.new_label();
        let end = self.new_label();
        if depth == 0 {
            self.emit(Opcode::LoadFast, 0);
        } else {
            self.expr(&generator.iter)?;
            self.emit(Opcode::GetIter, 0);
        }
        self.bind(start);
        self.emit_jump(Opcode::ForIter, end);
        self.store(&generator.target)?;
        for cond in &generator.ifs {
            self.expr(cond)?;
            self.emit_jump(Opcode::PopJumpIfFalse, start);
        }
        if depth + 1 < generators.len() {
            self.comprehension_loop(elt, generators, depth + 1)?;
        } else {
            self.expr(elt)?;
            self.emit(Opcode::ListAppend, (generators.len() + 1) as u32);
        }
        self.emit_jump(Opcode::JumpAbsolute, start);
        self.bind(end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::instruction::decode;

    fn opcodes(unit: &CodeUnit) -> Vec<Opcode> {
        decode(unit).unwrap().into_iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn assignment_and_return() {
        let unit = compile_module("bot", "x = 1\n").unwrap();
        assert_eq!(
            opcodes(&unit),
            vec![
                Opcode::LoadConst,
                Opcode::StoreGlobal,
                Opcode::LoadConst,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(unit.names, vec!["x".to_owned()]);
        assert_eq!(unit.consts, vec![Constant::Int(1), Constant::None]);
    }

    #[test]
    fn chained_comparison_uses_stack_shuffles() {
        let unit = compile_module("bot", "y = 0 < x < 5\n").unwrap();
        let ops = opcodes(&unit);
        assert!(ops.contains(&Opcode::DupTop));
        assert!(ops.contains(&Opcode::RotThree));
        assert!(ops.contains(&Opcode::RotTwo));
    }

    #[test]
    fn functions_capture_cells() {
        let src = "def adder(n):\n    return lambda k: k + n\n";
        let unit = compile_module("bot", src).unwrap();
        let adder = unit.nested().next().unwrap();
        assert_eq!(adder.cellvars, vec!["n".to_owned()]);
        assert!(opcodes(adder).contains(&Opcode::LoadClosure));
        let lambda = adder.nested().next().unwrap();
        assert_eq!(lambda.freevars, vec!["n".to_owned()]);
        assert_eq!(lambda.argcount, 1);
    }

    #[test]
    fn lines_follow_statements() {
        let unit = compile_module("bot", "a = 1\n\nb = 2\nc = 3\n").unwrap();
        let lines: Vec<u32> = unit.lines.iter().map(|&(_, line)| line).collect();
        assert_eq!(lines, vec![1, 3, 4]);
    }

    #[test]
    fn misplaced_statements_are_rejected() {
        assert!(matches!(
            compile_module("bot", "break\n"),
            Err(BuildError::Syntax { .. })
        ));
        assert!(matches!(
            compile_module("bot", "return 1\n"),
            Err(BuildError::Syntax { .. })
        ));
    }

    #[test]
    fn break_inside_try_pops_block() {
        let src = "for i in range(3):\n    try:\n        break\n    except:\n        pass\n";
        let unit = compile_module("bot", src).unwrap();
        let ops = opcodes(&unit);
        let brk = ops.iter().position(|&o| o == Opcode::SetupExcept).unwrap();
        assert_eq!(ops[brk + 1], Opcode::PopBlock);
        assert_eq!(ops[brk + 2], Opcode::PopTop);
        assert_eq!(ops[brk + 3], Opcode::JumpAbsolute);
    }
}
