//! Error taxonomy shared by the compiler, the runtime and the simulation.
//!
//! Per-agent failures ([`AgentError`]) are always recovered and attributed to the agent that
//! caused them. Only [`EngineError::SimulationInvariant`] is allowed to abort a match.

use thiserror::Error;

/// Raised while turning a submission into an instrumented [`CodeContainer`](crate::code_container::CodeContainer).
///
/// Fatal to compiling that submission only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The source does not parse.
    #[error("File \"{file}\", line {line}: {message}")]
    Syntax {
        /// Module the error was found in.
        file: String,
        /// 1-based source line.
        line: u32,
        /// Human readable reason.
        message: String,
    },
    /// Identifiers beginning with `_` are reserved for the host.
    #[error("File \"{file}\", line {line}: \"{name}\" is an invalid name because it starts with \"_\"")]
    ReservedName {
        /// Module the name was found in.
        file: String,
        /// 1-based source line.
        line: u32,
        /// The offending identifier.
        name: String,
    },
    /// A jump instruction targets itself and cannot be metered.
    #[error("unit '{unit}': no self-referential loops (jump at offset {offset})")]
    SelfReferentialJump {
        /// Name of the unit holding the jump.
        unit: String,
        /// Byte offset of the jump.
        offset: usize,
    },
    /// A unit went through the instrumentation pass twice.
    #[error("unit '{0}' is already instrumented")]
    AlreadyInstrumented(String),
    /// A unit that never went through the instrumentation pass was handed to the runtime.
    #[error("unit '{0}' is not instrumented")]
    NotInstrumented(String),
    /// The submission has no `bot` module.
    #[error("submission has no entry module '{0}'")]
    MissingEntry(String),
    /// The bytecode of a unit cannot be decoded or re-encoded.
    #[error("malformed unit '{unit}': {reason}")]
    Malformed {
        /// Name of the unit.
        unit: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The serialized artifact cannot be read back.
    #[error("invalid artifact: {0}")]
    Artifact(String),
}

impl BuildError {
    pub(crate) fn malformed(unit: &str, reason: impl Into<String>) -> Self {
        BuildError::Malformed {
            unit: unit.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Failure of one agent's execution, recorded in that agent's log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent attempted an operation outside the capability gateway.
    #[error("ConfinementError: {0}")]
    Confinement(String),
    /// The agent executed more operations than its budget allows.
    #[error("Ran out of budget. Remaining budget: {remaining}")]
    BudgetExhausted {
        /// Budget left when execution stopped (zero or negative).
        remaining: i64,
    },
    /// The agent is missing a required entry point.
    #[error("ConfigurationError: {0}")]
    Configuration(String),
    /// An uncaught exception escaped agent code. Holds the redacted traceback.
    #[error("{0}")]
    Runtime(String),
    /// The turn exceeded its wall-clock allowance.
    #[error("turn timed out")]
    TimedOut,
    /// The runtime was stopped by the simulation.
    #[error("runtime stopped")]
    Killed,
}

/// Failure of the simulation itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Board and robot records disagree. Pure implementation bug signal.
    #[error("simulation invariant violated: {0}")]
    SimulationInvariant(String),
    /// A submission could not be built or loaded.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A round was requested after the match finished.
    #[error("game is over")]
    GameOver,
    /// A robot's worker thread could not be started.
    #[error("could not start robot worker: {0}")]
    Worker(String),
    /// Match output could not be serialized.
    #[error("invalid match artifact: {0}")]
    Artifact(String),
}
