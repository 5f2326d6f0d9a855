//! Drives one robot's runtime on a dedicated worker thread.
//!
//! The simulation owns a [`RunnerHandle`] per robot and hands it one turn at a time. Each turn
//! is a request/report exchange over channels, bounded by the wall-clock timeout of the
//! [`Constraints`]. A robot whose turn overruns gets a strike and its turn is cancelled through
//! a shared flag polled by the metering hook; after too many strikes the robot is stopped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, error, instrument, trace, warn};

use crate::code_container::CodeContainer;
use crate::constraints::Constraints;
use crate::error::AgentError;
use crate::runtime::{HostBindings, Parked, RobotRunner, RunnerSettings, Suspend};

/// Stack of worker threads. Deep agent recursion runs on the native stack of the interpreter.
const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
enum Command {
    Go,
    Stop,
}

#[derive(Debug)]
enum Report {
    Finished {
        result: Result<(), AgentError>,
        logs: Vec<String>,
        initialized: bool,
    },
    Suspended {
        logs: Vec<String>,
        initialized: bool,
    },
    Crashed(String),
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `turn()` returned.
    Completed,
    /// The budget ran out; the execution resumes next turn.
    Suspended,
    /// The agent failed. Timeouts land here as [`AgentError::TimedOut`].
    Failed(AgentError),
    /// The worker panicked. The robot is stopped.
    Crashed(String),
    /// The robot was already stopped; nothing ran.
    Stopped,
}

/// What the simulation learns from one turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub logs: Vec<String>,
    /// Whether the robot's entry module has run to completion.
    pub initialized: bool,
}

/// Channel ends shared by the worker loop and its [`Suspend`] implementation.
struct Link {
    commands: Receiver<Command>,
    reports: Sender<Report>,
}

struct ChannelSuspend(Rc<Link>);

impl Suspend for ChannelSuspend {
    fn park(&mut self, parked: Parked) -> bool {
        let report = Report::Suspended {
            logs: parked.logs,
            initialized: parked.initialized,
        };
        if self.0.reports.send(report).is_err() {
            return false;
        }
        matches!(self.0.commands.recv(), Ok(Command::Go))
    }
}

/// Simulation side of a robot's worker thread.
///
/// Dropping the handle stops the worker; [`retire`](Self::retire) also hands its thread over so
/// it can be joined.
pub struct RunnerHandle {
    label: String,
    commands: Sender<Command>,
    reports: Receiver<Report>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    constraints: Constraints,
    strikes: u32,
    initialized: bool,
    stopped: bool,
}

impl RunnerHandle {
    /// Starts a worker thread owning a fresh [`RobotRunner`].
    ///
    /// Nothing runs until the first [`run_turn`](Self::run_turn).
    ///
    /// # Errors
    /// The thread cannot be spawned.
    #[instrument(skip_all, fields(robot = %settings.label))]
    pub fn spawn(
        container: Arc<CodeContainer>,
        settings: RunnerSettings,
        bindings: Box<dyn HostBindings>,
    ) -> anyhow::Result<RunnerHandle> {
        let (command_tx, command_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let label = settings.label.clone();
        let constraints = settings.constraints;

        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name(label.clone())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let link = Rc::new(Link {
                    commands: command_rx,
                    reports: report_tx,
                });
                work(container, settings, bindings, link, worker_cancel);
            })
            .with_context(|| format!("could not spawn worker for {label}"))?;
        trace!("worker started");

        Ok(RunnerHandle {
            label,
            commands: command_tx,
            reports: report_rx,
            cancel,
            worker: Some(worker),
            constraints,
            strikes: 0,
            initialized: false,
            stopped: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Runs one turn and waits for its report, at most the turn timeout plus the cancel grace.
    #[instrument(skip(self), fields(robot = %self.label))]
    pub fn run_turn(&mut self) -> TurnReport {
        if self.stopped {
            return self.report(TurnOutcome::Stopped, Vec::new());
        }
        if self.commands.send(Command::Go).is_err() {
            return self.crashed("worker is gone".into());
        }
        match self.reports.recv_timeout(self.constraints.turn_timeout) {
            Ok(report) => self.accept(report),
            Err(RecvTimeoutError::Timeout) => self.cancel_turn(),
            Err(RecvTimeoutError::Disconnected) => self.crashed("worker is gone".into()),
        }
    }

    fn cancel_turn(&mut self) -> TurnReport {
        self.cancel.store(true, Ordering::Relaxed);
        self.strikes += 1;
        warn!(strikes = self.strikes, "turn timed out");
        let mut report = match self.reports.recv_timeout(self.constraints.cancel_grace) {
            Ok(report) => self.accept(report),
            Err(_) => {
                error!("worker unresponsive, abandoning it");
                self.stopped = true;
                self.report(
                    TurnOutcome::Failed(AgentError::TimedOut),
                    vec![AgentError::TimedOut.to_string()],
                )
            }
        };
        if report.outcome == TurnOutcome::Completed {
            report.outcome = TurnOutcome::Failed(AgentError::TimedOut);
        }
        if self.strikes >= self.constraints.timeout_strikes && !self.stopped {
            warn!("too many timeouts, stopping robot");
            self.stop();
        }
        report
    }

    fn accept(&mut self, report: Report) -> TurnReport {
        match report {
            Report::Finished {
                result,
                logs,
                initialized,
            } => {
                self.initialized = initialized;
                let outcome = match result {
                    Ok(()) => TurnOutcome::Completed,
                    Err(AgentError::Killed) => {
                        self.stopped = true;
                        TurnOutcome::Failed(AgentError::Killed)
                    }
                    Err(e) => TurnOutcome::Failed(e),
                };
                self.report(outcome, logs)
            }
            Report::Suspended { logs, initialized } => {
                self.initialized = initialized;
                self.report(TurnOutcome::Suspended, logs)
            }
            Report::Crashed(message) => self.crashed(message),
        }
    }

    fn crashed(&mut self, message: String) -> TurnReport {
        error!(%message, "worker crashed");
        self.stopped = true;
        self.initialized = false;
        self.report(TurnOutcome::Crashed(message), Vec::new())
    }

    fn report(&self, outcome: TurnOutcome, logs: Vec<String>) -> TurnReport {
        TurnReport {
            outcome,
            logs,
            initialized: self.initialized && !self.stopped,
        }
    }

    /// Stops the worker. A suspended execution is abandoned.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.commands.send(Command::Stop);
        debug!(robot = %self.label, "stopped");
    }

    /// Stops the worker and returns its thread, unless it was already handed over.
    pub fn retire(mut self) -> Option<JoinHandle<()>> {
        self.stop();
        self.worker.take()
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!(robot = %self.label, "worker still running, detaching it");
            }
        }
    }
}

/// Joins retired workers, waiting at most `grace` for the slow ones. Returns how many were
/// still running and got detached.
pub fn join_workers(workers: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    let mut pending = workers;
    loop {
        let (done, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(JoinHandle::is_finished);
        for worker in done {
            if worker.join().is_err() {
                warn!("retired worker panicked");
            }
        }
        pending = running;
        if pending.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if !pending.is_empty() {
        warn!(detached = pending.len(), "workers did not stop in time");
    }
    pending.len()
}

fn work(
    container: Arc<CodeContainer>,
    settings: RunnerSettings,
    bindings: Box<dyn HostBindings>,
    link: Rc<Link>,
    cancel: Arc<AtomicBool>,
) {
    let suspend = Box::new(ChannelSuspend(link.clone()));
    let mut runner = RobotRunner::new(container, settings, bindings, suspend, cancel);
    while let Ok(Command::Go) = link.commands.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run_turn()));
        let report = match result {
            Ok(result) => Report::Finished {
                result,
                logs: runner.take_logs(),
                initialized: runner.is_initialized(),
            },
            Err(payload) => {
                let _ = link.reports.send(Report::Crashed(panic_message(payload)));
                return;
            }
        };
        if link.reports.send(report).is_err() {
            return;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsBuilder;
    use crate::runtime::NoBindings;

    fn spawn(source: &str, constraints: ConstraintsBuilder) -> RunnerHandle {
        let container = CodeContainer::from_sources([("bot.py", source)]).unwrap();
        let settings = RunnerSettings {
            label: "robot".into(),
            seed: 1,
            debug: false,
            constraints: constraints.build().unwrap(),
        };
        RunnerHandle::spawn(Arc::new(container), settings, Box::new(NoBindings)).unwrap()
    }

    #[test]
    fn completed_turns_carry_their_logs() {
        let mut handle = spawn("def turn():\n    log('hi')\n", ConstraintsBuilder::new());
        let report = handle.run_turn();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.logs, vec!["hi"]);
        assert!(report.initialized);
    }

    #[test]
    fn exhausted_budget_suspends_then_resumes() {
        let source = "def turn():\n    i = 0\n    while i < 30:\n        i += 1\n    log(i)\n";
        let mut handle = spawn(source, ConstraintsBuilder::new().with_turn_allowance(40));
        let first = handle.run_turn();
        assert_eq!(first.outcome, TurnOutcome::Suspended);
        assert!(first.logs[0].starts_with("Ran out of budget"));
        let mut last = handle.run_turn();
        while last.outcome == TurnOutcome::Suspended {
            last = handle.run_turn();
        }
        assert_eq!(last.outcome, TurnOutcome::Completed);
        assert_eq!(last.logs, vec!["30"]);
    }

    #[test]
    fn repeated_timeouts_stop_the_robot() {
        let constraints = ConstraintsBuilder::new()
            .with_turn_allowance(i64::MAX / 2)
            .with_turn_timeout(Duration::from_millis(30))
            .with_cancel_grace(Duration::from_secs(2))
            .with_timeout_strikes(2);
        let mut handle = spawn("def turn():\n    while True:\n        pass\n", constraints);
        for strike in 1..=2 {
            let report = handle.run_turn();
            assert_eq!(report.outcome, TurnOutcome::Failed(AgentError::TimedOut));
            assert_eq!(handle.strikes(), strike);
        }
        assert!(handle.is_stopped());
        assert_eq!(handle.run_turn().outcome, TurnOutcome::Stopped);
        let worker = handle.retire();
        assert!(worker.is_some());
        assert_eq!(join_workers(worker.into_iter().collect(), Duration::from_secs(2)), 0);
    }

    #[test]
    fn slow_workers_are_detached_after_the_grace() {
        let quick = thread::spawn(|| {});
        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        assert_eq!(join_workers(vec![quick, slow], Duration::from_millis(20)), 1);
    }

    #[test]
    fn failed_initialization_stops_the_robot() {
        let mut handle = spawn("import os\n", ConstraintsBuilder::new());
        let report = handle.run_turn();
        assert!(matches!(report.outcome, TurnOutcome::Failed(AgentError::Confinement(_))));
        assert!(!report.initialized);
        assert_eq!(report.logs.len(), 1);
    }
}
