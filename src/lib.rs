//! # Pawnbox
//!
//! Metered, sandboxed execution of untrusted agent scripts in a deterministic turn-based match.
//!
//! Two independently written agents, each a set of modules in a small Python-like language,
//! are compiled to bytecode, rewritten so that every instruction charges a budget, and then
//! played against each other on a square board. Agents only see the functions their robot is
//! given; everything else is rejected by the capability gateway of the interpreter.
//!
//! It provides:
//! - A compiler front end and bytecode format ([`lang`], [`bytecode`])
//! - The metering pass ([`instrument`]) and the portable [`code_container`]
//! - An interpreter whose only way out is a capability gateway ([`vm`])
//! - Per-robot runtimes with budgets, import graphs and suspension ([`runtime`]), each driven
//!   on its own worker thread with wall-clock timeouts ([`scheduler`])
//! - The turn-based simulation ([`game`]) and the external interface ([`server`])
//!
//! # Documentation Overview
//!
//! - For compiling submissions and running matches, see the [`server`] module.
//! - For match parameters and per-robot limits, see
//!   [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - For the rules robots play by, see [`game::world`].
//!
//! # Usage Example
//!
//! ```no_run
//! use pawnbox::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bot = "\
//! def turn():
//!     if get_type() == RobotType.OVERLORD:
//!         row = 0 if get_team() == Team.WHITE else get_board_size() - 1
//!         if not check_space(row, 0):
//!             spawn(row, 0)
//!     else:
//!         try:
//!             move_forward()
//!         except RobotError:
//!             pass
//! ";
//!     let white = compile([("bot.py", bot)])?;
//!     let black = compile([("bot.py", bot)])?;
//!
//!     let constraints = ConstraintsBuilder::new().with_turn_allowance(10_000).build()?;
//!     let config = Configuration::new().with_seed(42);
//!     let result = run_match(&white, &black, &config, &constraints)?;
//!     println!("{} won after {} rounds", result.winner, result.rounds);
//!     Ok(())
//! }
//! ```
//!
//! ## Agent Requirements
//!
//! - The entry module is `bot.py`; it runs once, on the robot's first turn
//! - `bot.py` defines `turn()`, called once per round
//! - Names starting with `_` are reserved, and only bundled modules plus `random` and `math`
//!   can be imported

pub use anyhow;

pub mod agent_collector;
pub mod bytecode;
pub mod code_container;
pub mod configuration;
pub mod constraints;
pub mod error;
pub mod game;
pub mod instrument;
pub mod lang;
mod logger;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod vm;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use pawnbox::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - [`Evaluator`](crate::server::Evaluator) and the [`SubmissionStore`](crate::server::SubmissionStore) it works against
/// - the [`compile`](crate::server::compile) and [`run_match`](crate::server::run_match) entry points
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::constraints::{Constraints, ConstraintsBuilder};
    pub use crate::error::{AgentError, BuildError, EngineError};
    pub use crate::game::Team;
    pub use crate::server::{
        compile, run_match, Evaluator, MatchResult, MemoryStore, SubmissionStore,
    };
}
