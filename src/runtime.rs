//! Metered runtime of one robot: its namespace, budget, import graph and turn entry point.
//!
//! A runner moves through `Uninitialized → Initialized → (Running ⇄ Suspended) → Stopped`.
//! The metering hook injected by [`instrument`](crate::instrument) charges one unit of budget
//! per original instruction. When the budget runs out the hook parks the execution through
//! [`Suspend`]; the next turn refills the budget and the execution resumes where it stopped.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::code_container::{CodeContainer, ENTRY_MODULE};
use crate::constraints::Constraints;
use crate::error::AgentError;
use crate::instrument::METER_NAME;
use crate::vm::builtins::{self, math_module, random_module};
use crate::vm::{
    Code, ExcKind, Globals, Halt, Host, Import, Interpreter, ModuleScope, Native, Unwind, Value,
};

/// Frames kept in the tracebacks shown to agents.
pub const TRACEBACK_LIMIT: usize = 5;

/// Name agent modules must define to act each turn.
pub const TURN_FUNCTION: &str = "turn";

pub type Builtins = HashMap<Rc<str>, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    Initialized,
    Running,
    Suspended,
    Stopped,
}

/// Host functions a simulation exposes to one robot.
///
/// Implementations are built on the simulation side and sent to the robot's worker, where
/// `bind` turns them into builtins closing over that robot's identity.
pub trait HostBindings: Send {
    fn bind(self: Box<Self>, builtins: &mut Builtins);
}

/// No host functions, for running agent code outside a match.
pub struct NoBindings;

impl HostBindings for NoBindings {
    fn bind(self: Box<Self>, _builtins: &mut Builtins) {}
}

/// State of an execution whose budget ran out.
#[derive(Debug)]
pub struct Parked {
    /// Budget left, zero or negative.
    pub remaining: i64,
    /// Log lines of the turn that just ended.
    pub logs: Vec<String>,
    /// Whether the entry module had finished before the budget ran out.
    pub initialized: bool,
}

/// Where an execution waits when its budget runs out.
pub trait Suspend {
    /// Blocks until the robot's next turn. Returns `false` when the runtime must stop instead.
    fn park(&mut self, parked: Parked) -> bool;
}

/// Never resumes: a budget overrun ends the runtime.
pub struct NeverResume;

impl Suspend for NeverResume {
    fn park(&mut self, _parked: Parked) -> bool {
        false
    }
}

/// Identity and limits of one runtime.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Robot label used in traces, e.g. `WHITE pawn 4`.
    pub label: String,
    /// Seed of the `random` module.
    pub seed: u64,
    /// Echo agent logs through tracing.
    pub debug: bool,
    pub constraints: Constraints,
}

/// Import edges of the resolution chain in progress.
///
/// Discarded whenever the chain returns to its root.
#[derive(Debug, Default)]
pub struct ImportGraph {
    path: Vec<String>,
    edges: Vec<(String, String)>,
}

impl ImportGraph {
    /// Records that the module on top of the path imports `module`.
    ///
    /// # Errors
    /// A confinement error if the new edge closes a cycle.
    pub fn enter(&mut self, module: &str) -> Result<(), Unwind> {
        if let Some(importer) = self.path.last() {
            let edge = (importer.clone(), module.to_owned());
            if self.reaches(module, importer) {
                let mut chain = self.path.clone();
                chain.push(module.to_owned());
                return Err(Unwind::confine(format!(
                    "Import cycle detected: {}",
                    chain.join(" -> ")
                )));
            }
            if !self.edges.contains(&edge) {
                self.edges.push(edge);
            }
        }
        self.path.push(module.to_owned());
        Ok(())
    }

    /// `module` finished importing, successfully or not.
    pub fn leave(&mut self, module: &str) {
        if let Some(at) = self.path.iter().rposition(|m| m == module) {
            self.path.truncate(at);
        }
        if self.path.is_empty() {
            self.edges.clear();
        }
    }

    /// Whether `to` is reachable from `from` through recorded edges, or they are equal.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = vec![from];
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            for (a, b) in &self.edges {
                if a == node && !seen.contains(&b.as_str()) {
                    seen.push(b);
                    stack.push(b);
                }
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

/// Runtime side of [`Host`]: budget, logs and module resolution.
struct RunnerHost {
    label: String,
    debug: bool,
    seed: u64,
    constraints: Constraints,
    container: Arc<CodeContainer>,
    modules: HashMap<String, Value>,
    graph: ImportGraph,
    budget: i64,
    state: RunnerState,
    initialized: bool,
    cancel: Arc<AtomicBool>,
    suspend: Box<dyn Suspend>,
    logs: Vec<String>,
    logs_truncated: bool,
}

impl RunnerHost {
    fn refill(&mut self, allowance: i64) {
        self.budget = self.budget.min(0) + allowance;
        trace!(robot = %self.label, budget = self.budget, "budget refilled");
    }

    fn record(&mut self, message: String) {
        if self.logs.len() >= self.constraints.max_log_entries {
            if !self.logs_truncated {
                self.logs_truncated = true;
                self.logs.push(format!(
                    "Log limit of {} lines reached, further output dropped",
                    self.constraints.max_log_entries
                ));
            }
            return;
        }
        let message = match message.char_indices().nth(self.constraints.max_log_len) {
            Some((cut, _)) => format!("{}...", &message[..cut]),
            None => message,
        };
        if self.debug {
            debug!(robot = %self.label, "{message}");
        }
        self.logs.push(message);
    }
}

impl Host for RunnerHost {
    fn charge(&mut self, cost: i64) -> Result<(), Unwind> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Unwind::Halt(Halt::TimedOut));
        }
        self.budget -= cost;
        while self.budget <= 0 {
            let exhausted = AgentError::BudgetExhausted {
                remaining: self.budget,
            };
            self.record(exhausted.to_string());
            debug!(robot = %self.label, budget = self.budget, "suspended");
            self.state = RunnerState::Suspended;
            self.logs_truncated = false;
            let parked = Parked {
                remaining: self.budget,
                logs: std::mem::take(&mut self.logs),
                initialized: self.initialized,
            };
            if !self.suspend.park(parked) {
                self.state = RunnerState::Stopped;
                return Err(Unwind::Halt(Halt::Stopped));
            }
            self.state = RunnerState::Running;
            self.cancel.store(false, Ordering::Relaxed);
            self.refill(self.constraints.turn_allowance);
        }
        Ok(())
    }

    fn budget(&self) -> i64 {
        self.budget
    }

    fn log(&mut self, message: String) {
        self.record(message);
    }

    fn max_collection_len(&self) -> usize {
        self.constraints.max_collection_len
    }

    fn import(&mut self, name: &str) -> Result<Import, Unwind> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Import::Ready(module.clone()));
        }
        let native = match name {
            "random" => Some(random_module(self.seed)),
            "math" => Some(math_module()),
            _ => None,
        };
        if let Some(module) = native {
            self.modules.insert(name.to_owned(), module.clone());
            return Ok(Import::Ready(module));
        }
        let Some(unit) = self.container.get(name) else {
            return Err(Unwind::confine(format!("Module \"{name}\" does not exist.")));
        };
        self.graph.enter(name)?;
        trace!(robot = %self.label, module = name, "importing");
        Ok(Import::Execute {
            code: Code::load(unit),
            module: ModuleScope::new(name),
        })
    }

    fn imported(&mut self, name: &str, module: Option<Globals>) {
        self.graph.leave(name);
        if let Some(module) = module {
            self.modules.insert(name.to_owned(), Value::Module(module));
        }
    }
}

/// One robot's sandboxed agent.
pub struct RobotRunner {
    interp: Interpreter,
    host: RunnerHost,
    turn: Option<Value>,
}

impl RobotRunner {
    /// Creates an uninitialized runner.
    ///
    /// `cancel` is polled by the metering hook; setting it unwinds the running turn with
    /// [`AgentError::TimedOut`].
    pub fn new(
        container: Arc<CodeContainer>,
        settings: RunnerSettings,
        bindings: Box<dyn HostBindings>,
        suspend: Box<dyn Suspend>,
        cancel: Arc<AtomicBool>,
    ) -> RobotRunner {
        let mut table = builtins::standard();
        table.insert(
            Rc::from(METER_NAME),
            Native::value(METER_NAME, |host, _| host.charge(1).map(|()| Value::None)),
        );
        bindings.bind(&mut table);
        RobotRunner {
            interp: Interpreter::new(table, settings.constraints.max_call_depth),
            host: RunnerHost {
                label: settings.label,
                debug: settings.debug,
                seed: settings.seed,
                constraints: settings.constraints,
                container,
                modules: HashMap::new(),
                graph: ImportGraph::default(),
                budget: 0,
                state: RunnerState::Uninitialized,
                initialized: false,
                cancel,
                suspend,
                logs: Vec::new(),
                logs_truncated: false,
            },
            turn: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.host.state
    }

    pub fn budget(&self) -> i64 {
        self.host.budget
    }

    /// Whether the entry module ran to completion.
    pub fn is_initialized(&self) -> bool {
        self.host.initialized
    }

    /// Log lines recorded since the last call.
    pub fn take_logs(&mut self) -> Vec<String> {
        self.host.logs_truncated = false;
        std::mem::take(&mut self.host.logs)
    }

    /// Marks the runner stopped. Later turns fail with [`AgentError::Killed`].
    pub fn stop(&mut self) {
        self.host.state = RunnerState::Stopped;
    }

    /// Runs the entry module once, with the starting budget.
    ///
    /// A failure stops the runner for good; the error is also written to its log.
    #[instrument(skip(self), fields(robot = %self.host.label))]
    pub fn initialize(&mut self) -> Result<(), AgentError> {
        if self.host.state != RunnerState::Uninitialized {
            return Ok(());
        }
        self.host.cancel.store(false, Ordering::Relaxed);
        self.host.refill(self.host.constraints.starting_budget);
        self.host.state = RunnerState::Running;
        match self.run_entry() {
            Ok(globals) => {
                self.turn = globals.get(TURN_FUNCTION);
                self.host.state = RunnerState::Initialized;
                self.host.initialized = true;
                debug!(has_turn = self.turn.is_some(), "initialized");
                Ok(())
            }
            Err(unwind) => {
                let error = agent_error(unwind);
                warn!(%error, "initialization failed");
                self.host.record(error.to_string());
                self.host.state = RunnerState::Stopped;
                Err(error)
            }
        }
    }

    fn run_entry(&mut self) -> Result<Globals, Unwind> {
        let unit = self
            .host
            .container
            .get(ENTRY_MODULE)
            .ok_or_else(|| Unwind::confine(format!("Module \"{ENTRY_MODULE}\" does not exist.")))?;
        let code = Code::load(unit);
        let globals = ModuleScope::new(ENTRY_MODULE);
        self.host.graph.enter(ENTRY_MODULE)?;
        let result = self
            .interp
            .run_module(&mut self.host, code, globals.clone());
        self.host.graph.leave(ENTRY_MODULE);
        result?;
        self.host
            .modules
            .insert(ENTRY_MODULE.to_owned(), Value::Module(globals.clone()));
        Ok(globals)
    }

    /// Executes one turn: initializes on first use, refills the budget otherwise, then calls
    /// the agent's `turn()`.
    ///
    /// Errors are written to the robot's log as well. Only initialization failures and
    /// [`AgentError::Killed`] leave the runner stopped.
    pub fn run_turn(&mut self) -> Result<(), AgentError> {
        match self.host.state {
            RunnerState::Stopped => return Err(AgentError::Killed),
            RunnerState::Uninitialized => self.initialize()?,
            _ => {
                self.host.cancel.store(false, Ordering::Relaxed);
                self.host.refill(self.host.constraints.turn_allowance);
            }
        }
        let Some(turn) = self.turn.clone() else {
            let error = AgentError::Configuration("Couldn't find turn function.".into());
            self.host.record(error.to_string());
            return Err(error);
        };
        self.host.state = RunnerState::Running;
        let result = self.interp.call(&mut self.host, &turn, Vec::new());
        match result {
            Ok(_) => {
                self.host.state = RunnerState::Initialized;
                Ok(())
            }
            Err(unwind) => {
                let error = agent_error(unwind);
                self.host.state = if error == AgentError::Killed {
                    RunnerState::Stopped
                } else {
                    RunnerState::Initialized
                };
                self.host.record(error.to_string());
                Err(error)
            }
        }
    }
}

fn agent_error(unwind: Unwind) -> AgentError {
    match unwind {
        Unwind::Raise(e) if e.kind == ExcKind::Confinement => {
            let location = e.traceback.borrow().first().cloned();
            match location {
                Some((file, line, _)) => AgentError::Confinement(format!(
                    "{} (File \"{file}\", line {line})",
                    e.message
                )),
                None => AgentError::Confinement(e.message.clone()),
            }
        }
        Unwind::Raise(e) => AgentError::Runtime(e.format(TRACEBACK_LIMIT)),
        Unwind::Halt(Halt::TimedOut) => AgentError::TimedOut,
        Unwind::Halt(Halt::Stopped) => AgentError::Killed,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::constraints::ConstraintsBuilder;

    /// Resumes a fixed number of times, keeping what each park handed over.
    struct Resume {
        left: usize,
        parked: Rc<RefCell<Vec<Parked>>>,
    }

    impl Suspend for Resume {
        fn park(&mut self, parked: Parked) -> bool {
            self.parked.borrow_mut().push(parked);
            if self.left == 0 {
                return false;
            }
            self.left -= 1;
            true
        }
    }

    fn runner_with(
        files: &[(&str, &str)],
        constraints: ConstraintsBuilder,
        suspend: Box<dyn Suspend>,
    ) -> RobotRunner {
        let container = CodeContainer::from_sources(files.iter().copied()).unwrap();
        let settings = RunnerSettings {
            label: "test".into(),
            seed: 7,
            debug: false,
            constraints: constraints.build().unwrap(),
        };
        RobotRunner::new(
            Arc::new(container),
            settings,
            Box::new(NoBindings),
            suspend,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn runner(files: &[(&str, &str)]) -> RobotRunner {
        runner_with(files, ConstraintsBuilder::new(), Box::new(NeverResume))
    }

    #[test]
    fn turns_run_after_lazy_initialization() {
        let mut r = runner(&[("bot.py", "count = [0]\ndef turn():\n    count[0] += 1\n    log(count[0])\n")]);
        assert_eq!(r.state(), RunnerState::Uninitialized);
        r.run_turn().unwrap();
        r.run_turn().unwrap();
        assert_eq!(r.state(), RunnerState::Initialized);
        assert_eq!(r.take_logs(), vec!["1", "2"]);
    }

    #[test]
    fn missing_turn_is_a_configuration_error_every_turn() {
        let mut r = runner(&[("bot.py", "x = 1\n")]);
        for _ in 0..2 {
            assert!(matches!(r.run_turn(), Err(AgentError::Configuration(_))));
            assert_eq!(r.state(), RunnerState::Initialized);
        }
    }

    #[test]
    fn missing_module_stops_the_runner() {
        let mut r = runner(&[("bot.py", "import numpy\ndef turn():\n    pass\n")]);
        let err = r.initialize().unwrap_err();
        assert!(matches!(&err, AgentError::Confinement(m) if m.contains("\"numpy\" does not exist")));
        assert_eq!(r.state(), RunnerState::Stopped);
        assert_eq!(r.run_turn(), Err(AgentError::Killed));
    }

    #[test]
    fn import_cycles_are_confined() {
        let mut r = runner(&[
            ("bot.py", "import a\ndef turn():\n    pass\n"),
            ("a.py", "import b\n"),
            ("b.py", "import a\n"),
        ]);
        let err = r.initialize().unwrap_err();
        assert!(matches!(&err, AgentError::Confinement(m) if m.contains("bot -> a -> b -> a")));
    }

    #[test]
    fn modules_execute_once() {
        let mut r = runner(&[
            ("bot.py", "import a\nimport b\ndef turn():\n    import a\n"),
            ("a.py", "log('a loaded')\n"),
            ("b.py", "import a\n"),
        ]);
        r.run_turn().unwrap();
        r.run_turn().unwrap();
        assert_eq!(r.take_logs(), vec!["a loaded"]);
    }

    #[test]
    fn budget_exhaustion_suspends_and_resumes() {
        let parked = Rc::new(RefCell::new(Vec::new()));
        let suspend = Resume {
            left: 100,
            parked: parked.clone(),
        };
        let mut r = runner_with(
            &[("bot.py", "def turn():\n    i = 0\n    while i < 200:\n        i += 1\n    log(i)\n")],
            ConstraintsBuilder::new().with_turn_allowance(300),
            Box::new(suspend),
        );
        r.run_turn().unwrap();
        let parked = parked.borrow();
        assert!(parked.len() >= 2);
        for p in parked.iter() {
            assert!(p.remaining <= 0);
            assert!(p.initialized);
            assert_eq!(p.logs.len(), 1);
            assert!(p.logs[0].starts_with("Ran out of budget"));
        }
        assert_eq!(r.take_logs(), vec!["200"]);
    }

    #[test]
    fn suspension_during_initialization_is_reported() {
        let parked = Rc::new(RefCell::new(Vec::new()));
        let suspend = Resume {
            left: 0,
            parked: parked.clone(),
        };
        let mut r = runner_with(
            &[("bot.py", "i = 0\nwhile i < 100:\n    i += 1\ndef turn():\n    pass\n")],
            ConstraintsBuilder::new().with_turn_allowance(50),
            Box::new(suspend),
        );
        assert_eq!(r.run_turn(), Err(AgentError::Killed));
        assert!(!parked.borrow()[0].initialized);
        assert!(!r.is_initialized());
    }

    #[test]
    fn budget_is_never_overspent() {
        let mut r = runner_with(
            &[("bot.py", "def turn():\n    while True:\n        pass\n")],
            ConstraintsBuilder::new().with_turn_allowance(50),
            Box::new(NeverResume),
        );
        assert_eq!(r.run_turn(), Err(AgentError::Killed));
        assert_eq!(r.budget(), 0);
        assert_eq!(r.state(), RunnerState::Stopped);
    }

    #[test]
    fn large_allocations_exhaust_the_budget() {
        let parked = Rc::new(RefCell::new(Vec::new()));
        let suspend = Resume {
            left: 0,
            parked: parked.clone(),
        };
        let mut r = runner_with(
            &[(
                "bot.py",
                "keep = []\ndef turn():\n    for i in range(10):\n        keep.append([0] * 1000000)\n",
            )],
            ConstraintsBuilder::new(),
            Box::new(suspend),
        );
        assert_eq!(r.run_turn(), Err(AgentError::Killed));
        let parked = parked.borrow();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].initialized);
        assert!(parked[0].remaining < -80_000);
        assert!(parked[0].logs[0].starts_with("Ran out of budget"));
    }

    #[test]
    fn runtime_errors_keep_the_runner_alive() {
        let mut r = runner(&[("bot.py", "def turn():\n    x = 1\n    return x // 0\n")]);
        let err = r.run_turn().unwrap_err();
        let AgentError::Runtime(trace) = err else {
            panic!("expected a runtime error");
        };
        assert!(trace.contains("File \"bot\", line 3, in turn"));
        assert_eq!(r.state(), RunnerState::Initialized);
    }

    #[test]
    fn logs_are_limited() {
        let mut r = runner_with(
            &[(
                "bot.py",
                "def turn():\n    log('x' * 50)\n    for i in range(10):\n        log(i)\n",
            )],
            ConstraintsBuilder::new().with_log_limits(5, 20),
            Box::new(NeverResume),
        );
        r.run_turn().unwrap();
        let logs = r.take_logs();
        assert_eq!(logs.len(), 6);
        assert_eq!(logs[0], format!("{}...", "x".repeat(20)));
        assert!(logs[5].starts_with("Log limit"));
    }

    #[test]
    fn random_is_seeded_per_runner() {
        let source = "import random\ndef turn():\n    log(random.randint(0, 1000000))\n";
        let mut a = runner(&[("bot.py", source)]);
        let mut b = runner(&[("bot.py", source)]);
        a.run_turn().unwrap();
        b.run_turn().unwrap();
        assert_eq!(a.take_logs(), b.take_logs());
    }

    #[test]
    fn meter_is_not_reachable_from_agent_code() {
        let mut r = runner(&[("bot.py", "def turn():\n    f = getattr(log, '__call__')\n")]);
        assert!(matches!(r.run_turn(), Err(AgentError::Confinement(_))));
    }

    #[test]
    fn import_graph_detects_indirect_cycles() {
        let mut graph = ImportGraph::default();
        graph.enter("bot").unwrap();
        graph.enter("a").unwrap();
        graph.leave("a");
        graph.enter("b").unwrap();
        assert!(graph.enter("bot").is_err());
        graph.leave("b");
        graph.leave("bot");
        assert!(graph.is_empty());
    }
}
