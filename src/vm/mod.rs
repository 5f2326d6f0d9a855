//! Interpreter for instrumented units, with the capability gateway as its only way out.
//!
//! The interpreter never touches the simulation directly. Everything it needs from the outside
//! world (budget, log sink, module resolution) goes through the [`Host`] trait implemented by
//! the robot runtime, and everything agent code may call is a [`Value`] installed in the
//! builtins table.

pub mod builtins;
pub mod gateway;
mod interp;
pub mod ops;
pub mod value;

use std::fmt;
use std::rc::Rc;

pub use interp::Interpreter;
pub use value::{Code, ExcKind, Exception, Globals, ModuleScope, Native, Value};

/// Why agent execution stops unwinding through its frames.
pub enum Unwind {
    /// An exception. Agent code may catch it unless its kind is [`ExcKind::Confinement`].
    Raise(Rc<Exception>),
    /// The host stopped the execution. Never catchable.
    Halt(Halt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The runtime was stopped while running or suspended.
    Stopped,
    /// The turn exceeded its wall-clock allowance.
    TimedOut,
}

impl Unwind {
    pub fn raise(kind: ExcKind, message: impl Into<String>) -> Unwind {
        Unwind::Raise(Exception::new(kind, message))
    }

    pub fn confine(message: impl Into<String>) -> Unwind {
        Unwind::raise(ExcKind::Confinement, message)
    }

    pub fn type_error(message: impl Into<String>) -> Unwind {
        Unwind::raise(ExcKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Unwind {
        Unwind::raise(ExcKind::ValueError, message)
    }

    pub fn is_confinement(&self) -> bool {
        matches!(self, Unwind::Raise(e) if e.kind == ExcKind::Confinement)
    }
}

impl fmt::Debug for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::Raise(e) => write!(f, "Raise({}: {})", e.kind.name(), e.message),
            Unwind::Halt(h) => write!(f, "Halt({h:?})"),
        }
    }
}

/// Result of resolving an `import`.
pub enum Import {
    /// Already loaded, or provided by the host.
    Ready(Value),
    /// The module body must run in `module` before the import completes.
    Execute { code: Rc<Code>, module: Globals },
}

/// Services the interpreter needs from the runtime hosting it.
pub trait Host {
    /// Charges `cost` operations against the running agent's budget.
    ///
    /// May block while the agent is suspended, and fails with [`Unwind::Halt`] when the agent
    /// must stop.
    fn charge(&mut self, cost: i64) -> Result<(), Unwind>;

    /// Remaining budget.
    fn budget(&self) -> i64;

    /// Records one agent log line.
    fn log(&mut self, message: String);

    /// Longest list, string or dict agent code may build.
    fn max_collection_len(&self) -> usize;

    /// Resolves `import name`.
    fn import(&mut self, name: &str) -> Result<Import, Unwind>;

    /// The body started by [`Import::Execute`] for `name` finished. `module` is `None` when
    /// it raised.
    fn imported(&mut self, name: &str, module: Option<Globals>);
}

/// Arguments of a call into a native function.
#[derive(Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: Vec<(Rc<str>, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Args {
        Args {
            positional,
            keywords: Vec::new(),
        }
    }

    /// Checks the positional count lies in `min..=max` and that no keyword was passed.
    pub fn arity(&self, function: &str, min: usize, max: usize) -> Result<(), Unwind> {
        if let Some((key, _)) = self.keywords.first() {
            return Err(Unwind::type_error(format!(
                "{function}() got an unexpected keyword argument '{key}'"
            )));
        }
        self.positional_count(function, min, max)
    }

    pub fn positional_count(&self, function: &str, min: usize, max: usize) -> Result<(), Unwind> {
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else if max == usize::MAX {
                format!("at least {min}")
            } else {
                format!("from {min} to {max}")
            };
            return Err(Unwind::type_error(format!(
                "{function}() takes {expected} arguments ({n} given)"
            )));
        }
        Ok(())
    }

    /// Removes keyword argument `name`, if present.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(k, _)| &**k == name)?;
        Some(self.keywords.remove(index).1)
    }

    pub fn int(&self, function: &str, index: usize) -> Result<i64, Unwind> {
        let value = self.positional.get(index).unwrap_or(&Value::None);
        value.as_int().ok_or_else(|| {
            Unwind::type_error(format!(
                "{function}() argument {} must be int, not {}",
                index + 1,
                value.type_name()
            ))
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal host for running agent code in unit tests.

    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;
    use crate::lang::compile_module;

    pub struct TestHost {
        pub budget: i64,
        pub logs: Vec<String>,
        pub sources: HashMap<String, Rc<Code>>,
        pub loaded: HashMap<String, Globals>,
        pub path: Vec<String>,
        pub limit: usize,
    }

    impl TestHost {
        pub fn new(modules: &[(&str, &str)]) -> TestHost {
            let sources = modules
                .iter()
                .map(|(name, source)| {
                    let unit = compile_module(name, source).expect("test module compiles");
                    (name.to_string(), Code::load(&unit))
                })
                .collect();
            TestHost {
                budget: 1_000_000,
                logs: Vec::new(),
                sources,
                loaded: HashMap::new(),
                path: Vec::new(),
                limit: 1000,
            }
        }
    }

    impl Host for TestHost {
        fn charge(&mut self, cost: i64) -> Result<(), Unwind> {
            self.budget -= cost;
            Ok(())
        }

        fn budget(&self) -> i64 {
            self.budget
        }

        fn log(&mut self, message: String) {
            self.logs.push(message);
        }

        fn max_collection_len(&self) -> usize {
            self.limit
        }

        fn import(&mut self, name: &str) -> Result<Import, Unwind> {
            if let Some(module) = self.loaded.get(name) {
                return Ok(Import::Ready(Value::Module(module.clone())));
            }
            if self.path.iter().any(|p| p == name) {
                return Err(Unwind::confine("import cycle"));
            }
            let code = self
                .sources
                .get(name)
                .cloned()
                .ok_or_else(|| Unwind::confine(format!("Module \"{name}\" does not exist.")))?;
            self.path.push(name.to_owned());
            Ok(Import::Execute {
                code,
                module: ModuleScope::new(name),
            })
        }

        fn imported(&mut self, name: &str, module: Option<Globals>) {
            self.path.retain(|p| p != name);
            if let Some(module) = module {
                self.loaded.insert(name.to_owned(), module);
            }
        }
    }

    /// Runs module `main` of `modules` and returns its namespace.
    pub fn run(modules: &[(&str, &str)]) -> (Result<Globals, Unwind>, TestHost) {
        let mut host = TestHost::new(modules);
        let mut interp = Interpreter::new(builtins::standard(), 200);
        let code = host.sources["main"].clone();
        let globals = ModuleScope::new("main");
        host.path.push("main".into());
        let result = interp
            .run_module(&mut host, code, globals.clone())
            .map(|_| globals);
        (result, host)
    }

    /// Runs `source` as module `main` and returns global `name`.
    pub fn eval(source: &str, name: &str) -> Result<Value, Unwind> {
        let (result, _) = run(&[("main", source)]);
        let globals = result?;
        Ok(globals.get(name).unwrap_or(Value::None))
    }
}
