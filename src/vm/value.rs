//! Run-time values of agent code.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{CodeUnit, Constant};

use super::{Args, Host, Unwind};

pub type Globals = Rc<ModuleScope>;
pub type CellRef = Rc<RefCell<Option<Value>>>;

/// Signature of host functions callable from agent code.
pub type NativeFn = dyn Fn(&mut dyn Host, Args) -> Result<Value, Unwind>;

/// Containers nested deeper than this are not walked by repr, equality or ordering.
pub const MAX_NESTING: usize = 200;

/// Longest text `repr` and `str` render.
pub const MAX_REPR_LEN: usize = 1 << 20;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Range(Range),
    Slice(Rc<[Value; 3]>),
    Iter(Rc<RefCell<IterState>>),
    Function(Rc<Function>),
    Native(Rc<Native>),
    Method(Rc<Method>),
    Module(Globals),
    Variant(Variant),
    ExcClass(ExcKind),
    Exception(Rc<Exception>),
    Code(Rc<Code>),
    Cell(CellRef),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Slice(_) => "slice",
            Value::Iter(_) => "iterator",
            Value::Function(_) => "function",
            Value::Native(_) | Value::Method(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::Variant(v) => v.family,
            Value::ExcClass(_) => "type",
            Value::Exception(e) => e.kind.name(),
            Value::Code(_) => "code",
            Value::Cell(_) => "cell",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Range(r) => r.len() > 0,
            _ => true,
        }
    }

    /// Whether the value is something agent code could use to reach host machinery.
    pub fn is_module_or_callable(&self) -> bool {
        matches!(
            self,
            Value::Module(_)
                | Value::Function(_)
                | Value::Native(_)
                | Value::Method(_)
                | Value::ExcClass(_)
                | Value::Code(_)
                | Value::Cell(_)
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    /// `str(value)`
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)`. Renderings longer than [`MAX_REPR_LEN`] are cut and end with `...`.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, 0);
        if out.len() > MAX_REPR_LEN {
            let mut end = MAX_REPR_LEN;
            while !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
            out.push_str("...");
        }
        out
    }

    fn write_repr(&self, out: &mut String, depth: usize) {
        if out.len() > MAX_REPR_LEN {
            return;
        }
        if depth > MAX_NESTING {
            out.push_str("...");
            return;
        }
        let join = |out: &mut String, items: &[Value]| {
            for (i, item) in items.iter().enumerate() {
                if out.len() > MAX_REPR_LEN {
                    return;
                }
                if i > 0 {
                    out.push_str(", ");
                }
                item.write_repr(out, depth + 1);
            }
        };
        match self {
            Value::List(l) => {
                out.push('[');
                join(out, l.borrow().as_slice());
                out.push(']');
            }
            Value::Tuple(t) if t.len() == 1 => {
                out.push('(');
                t[0].write_repr(out, depth + 1);
                out.push_str(",)");
            }
            Value::Tuple(t) => {
                out.push('(');
                join(out, t.as_slice());
                out.push(')');
            }
            Value::Dict(d) => {
                out.push('{');
                for (i, (k, v)) in d.borrow().entries.iter().enumerate() {
                    if out.len() > MAX_REPR_LEN {
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, depth + 1);
                    out.push_str(": ");
                    v.write_repr(out, depth + 1);
                }
                out.push('}');
            }
            other => out.push_str(&other.scalar_repr()),
        }
    }

    fn scalar_repr(&self) -> String {
        match self {
            Value::None => "None".to_owned(),
            Value::Bool(true) => "True".to_owned(),
            Value::Bool(false) => "False".to_owned(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote(s),
            Value::List(_) | Value::Tuple(_) | Value::Dict(_) => self.repr(),
            Value::Range(r) if r.step == 1 => format!("range({}, {})", r.start, r.stop),
            Value::Range(r) => format!("range({}, {}, {})", r.start, r.stop, r.step),
            Value::Slice(s) => format!("slice({}, {}, {})", s[0].repr(), s[1].repr(), s[2].repr()),
            Value::Iter(_) => "<iterator>".to_owned(),
            Value::Function(f) => format!("<function {}>", f.code.name),
            Value::Native(n) => format!("<built-in function {}>", n.name),
            Value::Method(m) => format!("<built-in method {}>", m.name),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Variant(v) => format!("{}.{}", v.family, v.name),
            Value::ExcClass(k) => format!("<class '{}'>", k.name()),
            Value::Exception(e) => format!("{}({})", e.kind.name(), quote(&e.message)),
            Value::Code(c) => format!("<code {}>", c.name),
            Value::Cell(_) => "<cell>".to_owned(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Lazy integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            self.stop as i128 - self.start as i128
        } else {
            self.start as i128 - self.stop as i128
        };
        let step = (self.step as i128).abs();
        if span <= 0 {
            0
        } else {
            ((span + step - 1) / step) as usize
        }
    }

    pub fn get(&self, index: usize) -> i64 {
        self.start + self.step * index as i64
    }
}

/// Insertion ordered map.
#[derive(Debug, Default, Clone)]
pub struct Dict {
    pub entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn insert(&mut self, key: HashKey, raw_key: Value, value: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((raw_key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// Hashable projection of a value, following the usual numeric key equivalences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
    Variant(&'static str, u8),
}

impl HashKey {
    pub fn of(value: &Value) -> Option<HashKey> {
        Some(match value {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => HashKey::Int(*f as i64),
            Value::Float(f) => HashKey::Float(f.to_bits()),
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => {
                HashKey::Tuple(items.iter().map(HashKey::of).collect::<Option<Vec<_>>>()?)
            }
            Value::Variant(v) => HashKey::Variant(v.family, v.value),
            _ => return None,
        })
    }
}

/// Member of a host enumeration such as `Team.WHITE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    pub family: &'static str,
    pub name: &'static str,
    pub value: u8,
}

pub enum IterState {
    List { list: Rc<RefCell<Vec<Value>>>, index: usize },
    Items { items: Rc<Vec<Value>>, index: usize },
    Range { range: Range, index: usize },
}

impl IterState {
    pub fn next_value(&mut self) -> Option<Value> {
        match self {
            IterState::List { list, index } => {
                let value = list.borrow().get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            IterState::Items { items, index } => {
                let value = items.get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            IterState::Range { range, index } => {
                if *index >= range.len() {
                    return None;
                }
                let value = range.get(*index);
                *index += 1;
                Some(Value::Int(value))
            }
        }
    }
}

/// A unit ready for execution: constants are materialized as values.
#[derive(Debug)]
pub struct Code {
    pub name: String,
    pub filename: Rc<str>,
    pub first_line: u32,
    pub argcount: usize,
    pub varnames: Vec<Rc<str>>,
    pub cellvars: Vec<Rc<str>>,
    pub freevars: Vec<Rc<str>>,
    pub names: Vec<Rc<str>>,
    pub consts: Vec<Value>,
    pub code: Vec<u8>,
    pub lines: Vec<(u32, u32)>,
}

impl Code {
    pub fn load(unit: &CodeUnit) -> Rc<Code> {
        let rc = |names: &[String]| names.iter().map(|n| Rc::from(n.as_str())).collect();
        Rc::new(Code {
            name: unit.name.clone(),
            filename: Rc::from(unit.filename.as_str()),
            first_line: unit.first_line,
            argcount: unit.argcount as usize,
            varnames: rc(&unit.varnames),
            cellvars: rc(&unit.cellvars),
            freevars: rc(&unit.freevars),
            names: rc(&unit.names),
            consts: unit.consts.iter().map(constant_value).collect(),
            code: unit.code.clone(),
            lines: unit.lines.clone(),
        })
    }

    pub fn line_for(&self, offset: usize) -> u32 {
        let idx = self
            .lines
            .partition_point(|&(start, _)| start as usize <= offset);
        if idx == 0 {
            self.first_line
        } else {
            self.lines[idx - 1].1
        }
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::str(s),
        Constant::Tuple(items) => Value::tuple(items.iter().map(constant_value).collect()),
        Constant::Code(unit) => Value::Code(Code::load(unit)),
    }
}

pub struct Function {
    pub code: Rc<Code>,
    pub globals: Globals,
    pub defaults: Vec<Value>,
    pub closure: Vec<CellRef>,
}

pub struct Native {
    pub name: String,
    pub func: Box<NativeFn>,
}

impl Native {
    pub fn value(
        name: &str,
        func: impl Fn(&mut dyn Host, Args) -> Result<Value, Unwind> + 'static,
    ) -> Value {
        Value::Native(Rc::new(Native {
            name: name.to_owned(),
            func: Box::new(func),
        }))
    }
}

/// Built-in method bound to its receiver, e.g. `xs.append`.
pub struct Method {
    pub receiver: Value,
    pub name: &'static str,
}

/// Namespace of a module, agent written or host provided.
pub struct ModuleScope {
    pub name: Rc<str>,
    pub vars: RefCell<HashMap<Rc<str>, Value>>,
}

impl ModuleScope {
    pub fn new(name: &str) -> Globals {
        Rc::new(ModuleScope {
            name: Rc::from(name),
            vars: RefCell::new(HashMap::new()),
        })
    }

    pub fn with(name: &str, vars: impl IntoIterator<Item = (&'static str, Value)>) -> Globals {
        let module = ModuleScope::new(name);
        module
            .vars
            .borrow_mut()
            .extend(vars.into_iter().map(|(k, v)| (Rc::from(k), v)));
        module
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    pub fn set(&self, name: Rc<str>, value: Value) {
        self.vars.borrow_mut().insert(name, value);
    }
}

/// Exception classes known to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    Exception,
    RobotError,
    GameError,
    ValueError,
    TypeError,
    IndexError,
    KeyError,
    NameError,
    AttributeError,
    ZeroDivisionError,
    OverflowError,
    MemoryError,
    RecursionError,
    /// Sandbox violation. Not visible to agent code and never caught by it.
    Confinement,
}

impl ExcKind {
    /// Classes exposed as builtins.
    pub const CATCHABLE: [ExcKind; 13] = [
        ExcKind::Exception,
        ExcKind::RobotError,
        ExcKind::GameError,
        ExcKind::ValueError,
        ExcKind::TypeError,
        ExcKind::IndexError,
        ExcKind::KeyError,
        ExcKind::NameError,
        ExcKind::AttributeError,
        ExcKind::ZeroDivisionError,
        ExcKind::OverflowError,
        ExcKind::MemoryError,
        ExcKind::RecursionError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExcKind::Exception => "Exception",
            ExcKind::RobotError => "RobotError",
            ExcKind::GameError => "GameError",
            ExcKind::ValueError => "ValueError",
            ExcKind::TypeError => "TypeError",
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyError => "KeyError",
            ExcKind::NameError => "NameError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::MemoryError => "MemoryError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::Confinement => "ConfinementError",
        }
    }

    /// Whether an `except self:` clause catches an exception of kind `raised`.
    pub fn matches(self, raised: ExcKind) -> bool {
        raised != ExcKind::Confinement && (self == raised || self == ExcKind::Exception)
    }
}

/// One traceback entry: file, line, function.
pub type TraceEntry = (Rc<str>, u32, String);

#[derive(Debug)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
    pub traceback: RefCell<Vec<TraceEntry>>,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Rc<Exception> {
        Rc::new(Exception {
            kind,
            message: message.into(),
            traceback: RefCell::new(Vec::new()),
        })
    }

    /// Traceback as shown to the agent: its own frames only, innermost `limit` of them.
    pub fn format(&self, limit: usize) -> String {
        let traceback = self.traceback.borrow();
        let mut out = String::from("Traceback (most recent call last):\n");
        // entries are recorded innermost first
        for (file, line, function) in traceback.iter().take(limit).rev() {
            out.push_str(&format!("  File \"{file}\", line {line}, in {function}\n"));
        }
        if self.message.is_empty() {
            out.push_str(self.kind.name());
        } else {
            out.push_str(&format!("{}: {}", self.kind.name(), self.message));
        }
        out
    }

    /// Line of the innermost recorded frame.
    pub fn line(&self) -> Option<u32> {
        self.traceback.borrow().first().map(|(_, line, _)| *line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_have_python_lengths() {
        let r = |start, stop, step| Range { start, stop, step }.len();
        assert_eq!(r(0, 10, 1), 10);
        assert_eq!(r(0, 10, 3), 4);
        assert_eq!(r(10, 0, -2), 5);
        assert_eq!(r(5, 5, 1), 0);
        assert_eq!(r(5, 0, 1), 0);
    }

    #[test]
    fn numeric_keys_collapse() {
        assert_eq!(HashKey::of(&Value::Bool(true)), HashKey::of(&Value::Int(1)));
        assert_eq!(HashKey::of(&Value::Float(2.0)), HashKey::of(&Value::Int(2)));
        assert!(HashKey::of(&Value::list(vec![])).is_none());
    }

    #[test]
    fn dict_keeps_insertion_order_through_removal() {
        let mut d = Dict::default();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            let key = Value::str(k);
            d.insert(HashKey::of(&key).unwrap(), key, Value::Int(i as i64));
        }
        d.remove(&HashKey::Str(Rc::from("a")));
        assert_eq!(d.len(), 2);
        assert_eq!(d.get(&HashKey::Str(Rc::from("c"))).and_then(Value::as_int), Some(2));
        assert_eq!(d.entries[0].0.to_text(), "b");
    }

    #[test]
    fn reprs_look_familiar() {
        assert_eq!(Value::Float(1.0).repr(), "1.0");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::str("a"), Value::None]).repr(),
            "['a', None]"
        );
    }

    #[test]
    fn long_reprs_are_cut() {
        let row = Value::list((0..2000).map(Value::Int).collect());
        let grid = Value::list(vec![row; 1000]);
        let out = grid.repr();
        assert!(out.len() <= MAX_REPR_LEN + 3);
        assert!(out.starts_with("[[0, 1, 2"));
        assert!(out.ends_with("..."));
    }

    #[test]
    fn confinement_is_never_matched() {
        assert!(ExcKind::Exception.matches(ExcKind::ValueError));
        assert!(ExcKind::RobotError.matches(ExcKind::RobotError));
        assert!(!ExcKind::RobotError.matches(ExcKind::GameError));
        assert!(!ExcKind::Exception.matches(ExcKind::Confinement));
    }
}
