use std::cell::Cell;
use std::rc::Rc;

use pawnbox::instrument::{instrument, METER_NAME};
use pawnbox::lang::compile_module;
use pawnbox::vm::{self, Code, Globals, Host, Import, Interpreter, ModuleScope, Native, Unwind, Value};
use proptest::prelude::*;

#[derive(Default)]
struct Recorder {
    logs: Vec<String>,
}

impl Host for Recorder {
    fn charge(&mut self, _cost: i64) -> Result<(), Unwind> {
        Ok(())
    }

    fn budget(&self) -> i64 {
        i64::MAX
    }

    fn log(&mut self, message: String) {
        self.logs.push(message);
    }

    fn max_collection_len(&self) -> usize {
        10_000
    }

    fn import(&mut self, name: &str) -> Result<Import, Unwind> {
        Err(Unwind::confine(format!("Module \"{name}\" does not exist.")))
    }

    fn imported(&mut self, _name: &str, _module: Option<Globals>) {}
}

/// What a run leaves behind: its log and, when it raised, the kind, message and line.
#[derive(Debug, PartialEq)]
struct Trace {
    logs: Vec<String>,
    raised: Option<(String, String, Option<u32>)>,
}

fn execute(code: Rc<Code>, meter: Option<Rc<Cell<u64>>>) -> Trace {
    let mut host = Recorder::default();
    let mut interp = Interpreter::new(vm::builtins::standard(), 200);
    if let Some(meter) = meter {
        interp.define(
            METER_NAME,
            Native::value(METER_NAME, move |_, _| {
                meter.set(meter.get() + 1);
                Ok(Value::None)
            }),
        );
    }
    let raised = match interp.run_module(&mut host, code, ModuleScope::new("bot")) {
        Ok(_) => None,
        Err(Unwind::Raise(e)) => Some((e.kind.name().to_owned(), e.message.clone(), e.line())),
        Err(Unwind::Halt(halt)) => panic!("nothing halts a recorder: {halt:?}"),
    };
    Trace {
        logs: host.logs,
        raised,
    }
}

#[derive(Debug, Clone)]
enum Stmt {
    Mix(i64),
    Sum(u8),
    Halve,
    Report,
    Divide(i64),
    Guarded(i64),
    Call,
}

impl Stmt {
    fn render(&self) -> String {
        match self {
            Stmt::Mix(k) => format!("x = (x * 3 + {k}) % 1009\n"),
            Stmt::Sum(n) => format!("for i in range({n}):\n    x = (x + i) % 1009\n"),
            Stmt::Halve => "while x > 10:\n    x = x // 2\n".into(),
            Stmt::Report => "if x % 2 == 0:\n    log(x)\nelse:\n    log(-x)\n".into(),
            Stmt::Divide(k) => format!("x = x // (x % {k})\n"),
            Stmt::Guarded(k) => format!(
                "try:\n    x = 100 // (x % {k})\nexcept ZeroDivisionError:\n    log('zero')\n"
            ),
            Stmt::Call => "x = double(x)\nlog(x)\n".into(),
        }
    }
}

fn stmt() -> impl Strategy<Value = Stmt> {
    prop_oneof![
        (0i64..50).prop_map(Stmt::Mix),
        (0u8..20).prop_map(Stmt::Sum),
        Just(Stmt::Halve),
        Just(Stmt::Report),
        (2i64..6).prop_map(Stmt::Divide),
        (2i64..6).prop_map(Stmt::Guarded),
        Just(Stmt::Call),
    ]
}

fn program(stmts: &[Stmt]) -> String {
    let mut source = String::from("def double(a):\n    return a * 2 % 1009\n\nx = 7\n");
    for s in stmts {
        source.push_str(&s.render());
    }
    source.push_str("log(x)\n");
    source
}

proptest! {
    #[test]
    fn metering_does_not_change_behaviour(stmts in prop::collection::vec(stmt(), 1..12)) {
        let source = program(&stmts);
        let raw = compile_module("bot", &source).unwrap();
        let metered = instrument(&raw).unwrap();

        let charges = Rc::new(Cell::new(0));
        let plain = execute(Code::load(&raw), None);
        let counted = execute(Code::load(&metered), Some(charges.clone()));

        prop_assert_eq!(plain, counted);
        prop_assert!(charges.get() > 0);
    }

    #[test]
    fn longer_loops_charge_more(n in 1u8..40) {
        let charges_for = |count: u8| {
            let source = format!("x = 0\nfor i in range({count}):\n    x = x + i\n");
            let unit = instrument(&compile_module("bot", &source).unwrap()).unwrap();
            let charges = Rc::new(Cell::new(0));
            execute(Code::load(&unit), Some(charges.clone()));
            charges.get()
        };
        prop_assert!(charges_for(n) < charges_for(n + 1));
    }
}

#[test]
fn instrumenting_twice_is_refused() {
    let unit = instrument(&compile_module("bot", "x = 1\n").unwrap()).unwrap();
    assert!(instrument(&unit).is_err());
}
