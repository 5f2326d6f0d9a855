use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::bytecode::{Comparison, Opcode, MAKE_CLOSURE, MAKE_DEFAULTS};

use super::builtins;
use super::gateway;
use super::ops::{self, Arith};
use super::value::{CellRef, Code, Exception, Function, Globals, Value};
use super::{Args, ExcKind, Host, Import, Unwind};

/// Handler installed by `SetupExcept`.
struct ExceptBlock {
    handler: usize,
    stack_len: usize,
    handling_len: usize,
}

enum FrameKind {
    Plain,
    /// Body of a module being imported; its namespace is the import's result.
    Import(Globals),
}

struct Frame {
    code: Rc<Code>,
    pc: usize,
    /// Offset of the instruction being executed, for line numbers.
    current: usize,
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    /// Own cells followed by the closure's.
    cells: Vec<CellRef>,
    globals: Globals,
    blocks: Vec<ExceptBlock>,
    /// Exceptions whose handlers are running.
    handling: Vec<Rc<Exception>>,
    kind: FrameKind,
}

impl Frame {
    fn new(code: Rc<Code>, globals: Globals, kind: FrameKind) -> Frame {
        Frame {
            locals: vec![None; code.varnames.len()],
            code,
            pc: 0,
            current: 0,
            stack: Vec::new(),
            cells: Vec::new(),
            globals,
            blocks: Vec::new(),
            handling: Vec::new(),
            kind,
        }
    }

    fn pop(&mut self) -> Result<Value, Unwind> {
        self.stack.pop().ok_or_else(|| corrupt("stack underflow"))
    }

    fn top(&self) -> Result<&Value, Unwind> {
        self.stack.last().ok_or_else(|| corrupt("stack underflow"))
    }

    fn popn(&mut self, n: usize) -> Result<Vec<Value>, Unwind> {
        if n > self.stack.len() {
            return Err(corrupt("stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn name(&self, index: u32) -> Result<Rc<str>, Unwind> {
        self.code
            .names
            .get(index as usize)
            .cloned()
            .ok_or_else(|| corrupt("name index out of range"))
    }

    fn cell(&self, index: u32) -> Result<&CellRef, Unwind> {
        self.cells
            .get(index as usize)
            .ok_or_else(|| corrupt("cell index out of range"))
    }

    fn cell_name(&self, index: u32) -> &str {
        let index = index as usize;
        let cellvars = &self.code.cellvars;
        match cellvars.get(index) {
            Some(name) => name,
            None => self
                .code
                .freevars
                .get(index - cellvars.len())
                .map_or("?", |n| n),
        }
    }

    fn line(&self) -> u32 {
        self.code.line_for(self.current)
    }
}

/// Bytecode the compiler never produces.
fn corrupt(what: &str) -> Unwind {
    Unwind::confine(format!("invalid bytecode: {what}"))
}

/// What the dispatch loop does after an instruction.
enum Flow {
    Next,
    Push(Frame),
    Return(Value),
}

/// Executes code units. One interpreter serves one agent.
pub struct Interpreter {
    builtins: HashMap<Rc<str>, Value>,
    frames: Vec<Frame>,
    max_depth: usize,
}

impl Interpreter {
    pub fn new(builtins: HashMap<Rc<str>, Value>, max_depth: usize) -> Interpreter {
        Interpreter {
            builtins,
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Adds or replaces a builtin.
    pub fn define(&mut self, name: &str, value: Value) {
        self.builtins.insert(Rc::from(name), value);
    }

    /// Runs a module body in `globals`.
    pub fn run_module(
        &mut self,
        host: &mut dyn Host,
        code: Rc<Code>,
        globals: Globals,
    ) -> Result<Value, Unwind> {
        let base = self.frames.len();
        self.frames.push(Frame::new(code, globals, FrameKind::Plain));
        self.execute(host, base)
    }

    /// Calls `callee` with positional `args` and runs it to completion.
    pub fn call(
        &mut self,
        host: &mut dyn Host,
        callee: &Value,
        args: Vec<Value>,
    ) -> Result<Value, Unwind> {
        let base = self.frames.len();
        match invoke(host, callee, Args::new(args), base, self.max_depth)? {
            Invoked::Value(value) => Ok(value),
            Invoked::Frame(frame) => {
                self.frames.push(frame);
                self.execute(host, base)
            }
        }
    }

    fn execute(&mut self, host: &mut dyn Host, base: usize) -> Result<Value, Unwind> {
        loop {
            let flow = match self.step(host) {
                Ok(flow) => flow,
                Err(unwind) => {
                    self.unwind(host, unwind, base)?;
                    continue;
                }
            };
            match flow {
                Flow::Next => {}
                Flow::Push(frame) => self.frames.push(frame),
                Flow::Return(value) => {
                    let Some(frame) = self.frames.pop() else {
                        return Err(corrupt("no frame to return from"));
                    };
                    let value = match frame.kind {
                        FrameKind::Import(module) => {
                            host.imported(&module.name, Some(module.clone()));
                            Value::Module(module)
                        }
                        FrameKind::Plain => value,
                    };
                    if self.frames.len() <= base {
                        return Ok(value);
                    }
                    if let Some(caller) = self.frames.last_mut() {
                        caller.stack.push(value);
                    }
                }
            }
        }
    }

    /// Routes an unwind to the innermost handler at or above `base`, or returns it.
    fn unwind(&mut self, host: &mut dyn Host, unwind: Unwind, base: usize) -> Result<(), Unwind> {
        let exception = match unwind {
            Unwind::Raise(exception) => exception,
            Unwind::Halt(halt) => {
                self.abandon(host, base);
                return Err(Unwind::Halt(halt));
            }
        };
        let catchable = exception.kind != ExcKind::Confinement;
        while self.frames.len() > base {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            exception.traceback.borrow_mut().push((
                frame.code.filename.clone(),
                frame.line(),
                frame.code.name.clone(),
            ));
            if catchable {
                if let Some(block) = frame.blocks.pop() {
                    trace!(handler = block.handler, "exception caught");
                    frame.stack.truncate(block.stack_len);
                    frame.handling.truncate(block.handling_len);
                    frame.stack.push(Value::Exception(exception.clone()));
                    frame.handling.push(exception);
                    frame.pc = block.handler;
                    return Ok(());
                }
            }
            if let Some(Frame {
                kind: FrameKind::Import(module),
                ..
            }) = self.frames.pop()
            {
                host.imported(&module.name, None);
            }
        }
        Err(Unwind::Raise(exception))
    }

    fn abandon(&mut self, host: &mut dyn Host, base: usize) {
        while self.frames.len() > base {
            if let Some(Frame {
                kind: FrameKind::Import(module),
                ..
            }) = self.frames.pop()
            {
                host.imported(&module.name, None);
            }
        }
    }

    fn step(&mut self, host: &mut dyn Host) -> Result<Flow, Unwind> {
        let depth = self.frames.len();
        let max_depth = self.max_depth;
        let Interpreter {
            builtins, frames, ..
        } = self;
        let frame = frames.last_mut().ok_or_else(|| corrupt("no frame"))?;
        let code = frame.code.clone();

        frame.current = frame.pc;
        let mut arg = 0u32;
        let opcode = loop {
            let (Some(&byte), Some(&raw)) = (code.code.get(frame.pc), code.code.get(frame.pc + 1))
            else {
                return Err(corrupt("ran past the end of the unit"));
            };
            frame.pc += 2;
            arg = (arg << 8) | raw as u32;
            match Opcode::from_byte(byte) {
                Some(Opcode::ExtendedArg) => continue,
                Some(opcode) => break opcode,
                None => return Err(corrupt("unknown opcode")),
            }
        };
        let limit = host.max_collection_len();

        match opcode {
            Opcode::ExtendedArg => {}
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::RotTwo => {
                let len = frame.stack.len();
                if len < 2 {
                    return Err(corrupt("stack underflow"));
                }
                frame.stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let top = frame.pop()?;
                let len = frame.stack.len();
                if len < 2 {
                    return Err(corrupt("stack underflow"));
                }
                frame.stack.insert(len - 2, top);
            }
            Opcode::DupTop => {
                let top = frame.top()?.clone();
                frame.stack.push(top);
            }
            Opcode::DupTopTwo => {
                let len = frame.stack.len();
                if len < 2 {
                    return Err(corrupt("stack underflow"));
                }
                frame.stack.extend_from_within(len - 2..);
            }
            Opcode::UnaryPositive => {
                let v = frame.pop()?;
                frame.stack.push(ops::positive(&v)?);
            }
            Opcode::UnaryNegative => {
                let v = frame.pop()?;
                frame.stack.push(ops::negate(&v)?);
            }
            Opcode::UnaryNot => {
                let v = frame.pop()?;
                frame.stack.push(Value::Bool(!v.truthy()));
            }
            Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryPower => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.stack.push(ops::arith(host, arith_of(opcode), &a, &b)?);
            }
            Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceModulo
            | Opcode::InplacePower => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.stack.push(gateway::inplace(host, arith_of(opcode), &a, &b)?);
            }
            Opcode::BinarySubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                frame.stack.push(gateway::get_item(host, &container, &key)?);
            }
            Opcode::StoreSubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                let value = frame.pop()?;
                gateway::set_item(&container, &key, value, limit)?;
            }
            Opcode::GetIter => {
                let v = frame.pop()?;
                frame.stack.push(gateway::iterate(host, &v)?);
            }
            Opcode::ReturnValue => return Ok(Flow::Return(frame.pop()?)),
            Opcode::PopBlock => {
                frame.blocks.pop();
            }
            Opcode::PopExcept => {
                frame.handling.pop();
            }
            Opcode::LoadConst => {
                let value = code
                    .consts
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| corrupt("constant index out of range"))?;
                frame.stack.push(value);
            }
            Opcode::LoadFast => {
                let slot = frame
                    .locals
                    .get(arg as usize)
                    .ok_or_else(|| corrupt("local index out of range"))?;
                let value = slot.clone().ok_or_else(|| {
                    Unwind::raise(
                        ExcKind::NameError,
                        format!(
                            "local variable '{}' referenced before assignment",
                            code.varnames[arg as usize]
                        ),
                    )
                })?;
                frame.stack.push(value);
            }
            Opcode::StoreFast => {
                let value = frame.pop()?;
                let slot = frame
                    .locals
                    .get_mut(arg as usize)
                    .ok_or_else(|| corrupt("local index out of range"))?;
                *slot = Some(value);
            }
            Opcode::LoadGlobal => {
                let name = frame.name(arg)?;
                let value = frame
                    .globals
                    .get(&name)
                    .or_else(|| builtins.get(&name).cloned())
                    .ok_or_else(|| {
                        Unwind::raise(ExcKind::NameError, format!("name '{name}' is not defined"))
                    })?;
                frame.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let name = frame.name(arg)?;
                let value = frame.pop()?;
                frame.globals.set(name, value);
            }
            Opcode::LoadDeref => {
                let value = frame.cell(arg)?.borrow().clone();
                let value = value.ok_or_else(|| {
                    Unwind::raise(
                        ExcKind::NameError,
                        format!(
                            "free variable '{}' referenced before assignment",
                            frame.cell_name(arg)
                        ),
                    )
                })?;
                frame.stack.push(value);
            }
            Opcode::StoreDeref => {
                let value = frame.pop()?;
                *frame.cell(arg)?.borrow_mut() = Some(value);
            }
            Opcode::LoadClosure => {
                let cell = frame.cell(arg)?.clone();
                frame.stack.push(Value::Cell(cell));
            }
            Opcode::LoadAttr => {
                let name = frame.name(arg)?;
                let obj = frame.pop()?;
                frame.stack.push(gateway::get_attr(&obj, &name)?);
            }
            Opcode::StoreAttr => {
                let name = frame.name(arg)?;
                let obj = frame.pop()?;
                let value = frame.pop()?;
                gateway::set_attr(&obj, &name, value)?;
            }
            Opcode::BuildTuple => {
                let items = frame.popn(arg as usize)?;
                frame.stack.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = frame.popn(arg as usize)?;
                frame.stack.push(Value::list(items));
            }
            Opcode::BuildMap => {
                let items = frame.popn(2 * arg as usize)?;
                let map = Value::Dict(Default::default());
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    ops::set_item(&map, &key, value, limit)?;
                }
                frame.stack.push(map);
            }
            Opcode::BuildSlice => {
                let mut parts = frame.popn(arg as usize)?;
                parts.resize(3, Value::None);
                let [lower, upper, step]: [Value; 3] = parts
                    .try_into()
                    .map_err(|_| corrupt("slice arity"))?;
                frame.stack.push(Value::Slice(Rc::new([lower, upper, step])));
            }
            Opcode::UnpackSequence => {
                let value = frame.pop()?;
                let items = gateway::unpack(&value, arg as usize)?;
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::ListAppend => {
                let item = frame.pop()?;
                let len = frame.stack.len();
                let target = (arg as usize)
                    .checked_sub(1)
                    .and_then(|back| len.checked_sub(back + 1))
                    .and_then(|i| frame.stack.get(i));
                let Some(Value::List(list)) = target else {
                    return Err(corrupt("ListAppend target is not a list"));
                };
                let mut items = list.borrow_mut();
                if items.len() >= limit {
                    return Err(ops::too_long());
                }
                items.push(item);
            }
            Opcode::CompareOp => {
                let op = Comparison::from_arg(arg).ok_or_else(|| corrupt("comparison"))?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                let result = if op == Comparison::ExceptionMatch {
                    Value::Bool(exception_matches(&a, &b)?)
                } else {
                    ops::compare(op, &a, &b)?
                };
                frame.stack.push(result);
            }
            Opcode::CallFunction | Opcode::CallFunctionKw => {
                let keys = if opcode == Opcode::CallFunctionKw {
                    match frame.pop()? {
                        Value::Tuple(keys) => keys,
                        _ => return Err(corrupt("keyword names")),
                    }
                } else {
                    Rc::new(Vec::new())
                };
                let mut positional = frame.popn(arg as usize)?;
                let split = positional
                    .len()
                    .checked_sub(keys.len())
                    .ok_or_else(|| corrupt("keyword count"))?;
                let values = positional.split_off(split);
                let keywords = keys
                    .iter()
                    .zip(values)
                    .map(|(key, value)| match key {
                        Value::Str(key) => Ok((key.clone(), value)),
                        _ => Err(corrupt("keyword name")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let callee = frame.pop()?;
                let args = Args {
                    positional,
                    keywords,
                };
                match invoke(host, &callee, args, depth, max_depth)? {
                    Invoked::Value(value) => frame.stack.push(value),
                    Invoked::Frame(new) => return Ok(Flow::Push(new)),
                }
            }
            Opcode::MakeFunction => {
                let Value::Code(body) = frame.pop()? else {
                    return Err(corrupt("MakeFunction without code"));
                };
                let closure = if arg & MAKE_CLOSURE != 0 {
                    match frame.pop()? {
                        Value::Tuple(cells) => cells
                            .iter()
                            .map(|c| match c {
                                Value::Cell(cell) => Ok(cell.clone()),
                                _ => Err(corrupt("closure entry is not a cell")),
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => return Err(corrupt("closure tuple")),
                    }
                } else {
                    Vec::new()
                };
                let defaults = if arg & MAKE_DEFAULTS != 0 {
                    match frame.pop()? {
                        Value::Tuple(defaults) => defaults.to_vec(),
                        _ => return Err(corrupt("defaults tuple")),
                    }
                } else {
                    Vec::new()
                };
                frame.stack.push(Value::Function(Rc::new(Function {
                    code: body,
                    globals: frame.globals.clone(),
                    defaults,
                    closure,
                })));
            }
            Opcode::RaiseVarargs => {
                let exception = if arg == 0 {
                    frame.handling.last().cloned().ok_or_else(|| {
                        Unwind::raise(ExcKind::Exception, "No active exception to reraise")
                    })?
                } else {
                    match frame.pop()? {
                        Value::Exception(e) => e,
                        Value::ExcClass(kind) => Exception::new(kind, ""),
                        _ => {
                            return Err(Unwind::type_error(
                                "exceptions must derive from BaseException",
                            ))
                        }
                    }
                };
                return Err(Unwind::Raise(exception));
            }
            Opcode::ImportName => {
                let name = frame.name(arg)?;
                match host.import(&name)? {
                    Import::Ready(module) => frame.stack.push(module),
                    Import::Execute { code, module } => {
                        if depth >= max_depth {
                            host.imported(&name, None);
                            return Err(recursion());
                        }
                        return Ok(Flow::Push(Frame::new(
                            code,
                            module.clone(),
                            FrameKind::Import(module),
                        )));
                    }
                }
            }
            Opcode::ImportFrom => {
                let name = frame.name(arg)?;
                let module = frame.top()?;
                let value = gateway::get_attr(module, &name).map_err(|e| match e {
                    Unwind::Raise(e) if e.kind == ExcKind::AttributeError => Unwind::raise(
                        ExcKind::NameError,
                        format!("cannot import name '{name}'"),
                    ),
                    other => other,
                })?;
                frame.stack.push(value);
            }
            Opcode::JumpForward => frame.pc += arg as usize,
            Opcode::ForIter => {
                let Value::Iter(state) = frame.top()? else {
                    return Err(corrupt("ForIter without iterator"));
                };
                let next = state.borrow_mut().next_value();
                match next {
                    Some(value) => frame.stack.push(value),
                    None => {
                        frame.pop()?;
                        frame.pc += arg as usize;
                    }
                }
            }
            Opcode::SetupExcept => {
                frame.blocks.push(ExceptBlock {
                    handler: frame.pc + arg as usize,
                    stack_len: frame.stack.len(),
                    handling_len: frame.handling.len(),
                });
            }
            Opcode::JumpAbsolute => frame.pc = arg as usize,
            Opcode::PopJumpIfFalse => {
                if !frame.pop()?.truthy() {
                    frame.pc = arg as usize;
                }
            }
            Opcode::PopJumpIfTrue => {
                if frame.pop()?.truthy() {
                    frame.pc = arg as usize;
                }
            }
            Opcode::JumpIfFalseOrPop => {
                if frame.top()?.truthy() {
                    frame.pop()?;
                } else {
                    frame.pc = arg as usize;
                }
            }
            Opcode::JumpIfTrueOrPop => {
                if frame.top()?.truthy() {
                    frame.pc = arg as usize;
                } else {
                    frame.pop()?;
                }
            }
        }
        Ok(Flow::Next)
    }
}

fn arith_of(opcode: Opcode) -> Arith {
    match opcode {
        Opcode::BinaryAdd | Opcode::InplaceAdd => Arith::Add,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => Arith::Sub,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => Arith::Mul,
        Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => Arith::Div,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => Arith::FloorDiv,
        Opcode::BinaryModulo | Opcode::InplaceModulo => Arith::Mod,
        _ => Arith::Pow,
    }
}

fn recursion() -> Unwind {
    Unwind::raise(ExcKind::RecursionError, "maximum recursion depth exceeded")
}

/// `except class:` test of `raised`.
fn exception_matches(raised: &Value, class: &Value) -> Result<bool, Unwind> {
    let Value::Exception(raised) = raised else {
        return Ok(false);
    };
    match class {
        Value::ExcClass(kind) => Ok(kind.matches(raised.kind)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(&Value::Exception(raised.clone()), class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Unwind::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

enum Invoked {
    Value(Value),
    Frame(Frame),
}

/// Calls a native right away, or prepares the frame of an agent function.
fn invoke(
    host: &mut dyn Host,
    callee: &Value,
    args: Args,
    depth: usize,
    max_depth: usize,
) -> Result<Invoked, Unwind> {
    match callee {
        Value::Function(function) => {
            if depth >= max_depth {
                return Err(recursion());
            }
            Ok(Invoked::Frame(bind(function, args)?))
        }
        Value::Native(native) => (native.func)(host, args).map(Invoked::Value),
        Value::Method(method) => {
            builtins::call_method(host, &method.receiver, method.name, args).map(Invoked::Value)
        }
        Value::ExcClass(kind) => {
            args.arity(kind.name(), 0, 1)?;
            let message = args.positional.first().map(Value::to_text).unwrap_or_default();
            Ok(Invoked::Value(Value::Exception(Exception::new(*kind, message))))
        }
        other => Err(Unwind::type_error(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

/// Builds the frame of a call to `function`, binding arguments to parameters.
fn bind(function: &Rc<Function>, args: Args) -> Result<Frame, Unwind> {
    let code = &function.code;
    let argc = code.argcount;
    let name = &code.name;
    if args.positional.len() > argc {
        return Err(Unwind::type_error(format!(
            "{name}() takes {argc} positional arguments but {} were given",
            args.positional.len()
        )));
    }
    let mut frame = Frame::new(code.clone(), function.globals.clone(), FrameKind::Plain);
    for (slot, value) in frame.locals.iter_mut().zip(args.positional) {
        *slot = Some(value);
    }
    for (key, value) in args.keywords {
        match code.varnames[..argc].iter().position(|p| *p == key) {
            Some(i) if frame.locals[i].is_none() => frame.locals[i] = Some(value),
            Some(_) => {
                return Err(Unwind::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                )))
            }
            None => {
                return Err(Unwind::type_error(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )))
            }
        }
    }
    let first_default = argc.saturating_sub(function.defaults.len());
    for i in 0..argc {
        if frame.locals[i].is_some() {
            continue;
        }
        match i.checked_sub(first_default) {
            Some(d) => frame.locals[i] = function.defaults.get(d).cloned(),
            None => {
                return Err(Unwind::type_error(format!(
                    "{name}() missing required argument '{}'",
                    code.varnames[i]
                )))
            }
        }
    }
    let own_cells = code.cellvars.iter().map(|cell| {
        let param = code.varnames[..argc].iter().position(|p| p == cell);
        Rc::new(RefCell::new(param.and_then(|i| frame.locals[i].clone())))
    });
    let cells: Vec<CellRef> = own_cells.chain(function.closure.iter().cloned()).collect();
    frame.cells = cells;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::{eval, run};

    fn text(source: &str) -> String {
        eval(source, "out").unwrap().to_text()
    }

    fn error_kind(source: &str) -> ExcKind {
        match eval(source, "out") {
            Err(Unwind::Raise(e)) => e.kind,
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_and_control_flow() {
        let source = "\
total = 0
i = 0
while True:
    i += 1
    if i % 2 == 0:
        continue
    if i > 9:
        break
    total += i
out = total
";
        assert_eq!(text(source), "25");
    }

    #[test]
    fn functions_defaults_and_keywords() {
        let source = "\
def f(a, b=10, c=100):
    return a + b + c
out = [f(1), f(1, 2), f(1, c=3), f(a=1, b=2, c=3)]
";
        assert_eq!(text(source), "[111, 103, 14, 6]");
    }

    #[test]
    fn closures_share_cells() {
        let source = "\
def counter(start):
    count = [start]
    def bump(by=1):
        count[0] += by
        return count[0]
    return bump
c = counter(5)
c()
out = c(10)
";
        assert_eq!(text(source), "16");
    }

    #[test]
    fn parameters_captured_by_closures() {
        let source = "\
def adder(n):
    return lambda x: x + n
out = adder(3)(4)
";
        assert_eq!(text(source), "7");
    }

    #[test]
    fn comprehensions() {
        let source = "out = [x * y for x in range(3) for y in [1, 10] if x != 1]\n";
        assert_eq!(text(source), "[0, 0, 2, 20]");
    }

    #[test]
    fn chained_comparison() {
        assert_eq!(text("x = 5\nout = [1 < x < 9, 1 < x > 9, 1 < 2 < 3 < 4]\n"), "[True, False, True]");
    }

    #[test]
    fn exceptions_are_caught_by_class() {
        let source = "\
out = []
for v in [0, 2, 'x']:
    try:
        out.append(10 // v)
    except ZeroDivisionError:
        out.append('zero')
    except (TypeError, ValueError) as e:
        out.append('type')
";
        assert_eq!(text(source), "['zero', 5, 'type']");
    }

    #[test]
    fn bare_raise_reraises() {
        let source = "\
def f():
    try:
        raise ValueError('inner')
    except ValueError:
        raise
try:
    f()
except Exception as e:
    out = str(e)
";
        assert_eq!(text(source), "inner");
    }

    #[test]
    fn unmatched_exception_propagates() {
        assert_eq!(
            error_kind("try:\n    [][1]\nexcept KeyError:\n    pass\n"),
            ExcKind::IndexError
        );
    }

    #[test]
    fn break_inside_try_inside_loop() {
        let source = "\
out = 0
for i in range(10):
    try:
        if i == 3:
            break
        out += i
    except Exception:
        pass
";
        assert_eq!(text(source), "3");
    }

    #[test]
    fn confinement_is_not_catchable() {
        let (result, _) = run(&[("main", "try:\n    x = 1\n    x %= 2\nexcept Exception:\n    pass\n")]);
        assert!(matches!(result, Err(e) if e.is_confinement()));
    }

    #[test]
    fn recursion_is_bounded() {
        assert_eq!(
            error_kind("def f(n):\n    return f(n + 1)\nout = f(0)\n"),
            ExcKind::RecursionError
        );
    }

    #[test]
    fn tracebacks_carry_lines() {
        let source = "\
def inner():
    x = 1
    return x / 0
def outer():
    return inner()
out = outer()
";
        let Err(Unwind::Raise(e)) = eval(source, "out") else {
            panic!("expected ZeroDivisionError");
        };
        assert_eq!(e.line(), Some(3));
        let formatted = e.format(5);
        assert!(formatted.contains("line 6, in <module>"));
        assert!(formatted.contains("line 5, in outer"));
        assert!(formatted.ends_with("ZeroDivisionError: division by zero"));
    }

    #[test]
    fn imports_run_once() {
        let (result, host) = run(&[
            ("main", "import helper\nimport helper as again\nfrom helper import value\nout = helper.calls + value\n"),
            ("helper", "log('loading')\ncalls = 1\nvalue = 41\n"),
        ]);
        let globals = result.unwrap();
        assert_eq!(globals.get("out").unwrap().as_int(), Some(42));
        assert_eq!(host.logs, vec!["loading".to_string()]);
    }

    #[test]
    fn missing_module_is_confinement() {
        let (result, _) = run(&[("main", "import os\n")]);
        assert!(matches!(result, Err(e) if e.is_confinement()));
    }

    #[test]
    fn module_attributes_are_read_only() {
        let (result, _) = run(&[
            ("main", "import helper\nhelper.value = 2\n"),
            ("helper", "value = 1\n"),
        ]);
        assert!(matches!(result, Err(e) if e.is_confinement()));
    }

    #[test]
    fn unpacking_and_subscript_assignment() {
        let source = "\
a, (b, c) = 1, [2, 3]
grid = [[0] * 2 for _ in range(2)]
grid[1][0] = a + b + c
d = {}
d['k'] = 1
d['k'] += 4
out = [grid, d]
";
        assert_eq!(text(source), "[[[0, 0], [6, 0]], {'k': 5}]");
    }
}
