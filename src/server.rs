//! Entry points for the layer that stores submissions and schedules matches.
//!
//! Two free functions form the contract with that layer:
//!
//! - [`compile`] turns a submission's source files into artifact bytes,
//! - [`run_match`] plays two artifacts against each other and returns a [`MatchResult`].
//!
//! The [`Evaluator`] ties them to a [`SubmissionStore`], fetching sources and artifacts,
//! reporting outcomes and uploading replays.
//!
//! # Example
//!
//! ```no_run
//! use pawnbox::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bot = "def turn():\n    log('hello')\n";
//!     let mut store = MemoryStore::new();
//!     store.add_submission("alice", vec![("bot.py".into(), bot.into())]);
//!     store.add_submission("bob", vec![("bot.py".into(), bot.into())]);
//!
//!     let evaluator = Evaluator::new(Configuration::new(), ConstraintsBuilder::new().build()?)?;
//!     evaluator.compile_submission(&mut store, "alice")?;
//!     evaluator.compile_submission(&mut store, "bob")?;
//!     let result = evaluator.play(&mut store, "final", "alice", "bob")?;
//!     println!("{} won after {} rounds", result.winner, result.rounds);
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::{info, instrument, trace};

use crate::agent_collector::SourceFiles;
use crate::code_container::CodeContainer;
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::error::{BuildError, EngineError};
use crate::game::{AgentLog, Game, Snapshot, Team};
use crate::logger::init_logger;

/// Outcome of one match.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub winner: Team,
    pub rounds: u32,
    /// Pawns of each team on the opponent's home row at the end, indexed by [`Team::index`].
    pub score: [usize; 2],
    pub history: Vec<Snapshot>,
    pub logs: Vec<AgentLog>,
}

impl MatchResult {
    /// Replay as JSON, one board per round.
    pub fn history_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(&self.history).map_err(|e| EngineError::Artifact(e.to_string()))
    }

    /// Log lines of one team, in the order they were produced.
    pub fn team_logs(&self, team: Team) -> impl Iterator<Item = &AgentLog> {
        self.logs.iter().filter(move |log| log.team == team)
    }
}

/// Compiles and instruments a submission into artifact bytes.
///
/// # Errors
/// Any [`BuildError`] of the submission.
pub fn compile<I, N, S>(files: I) -> Result<Vec<u8>, BuildError>
where
    I: IntoIterator<Item = (N, S)>,
    N: AsRef<str>,
    S: AsRef<str>,
{
    CodeContainer::from_sources(files)?.to_bytes()
}

/// Plays `white` against `black` until a team wins.
///
/// # Errors
/// An artifact cannot be loaded, or the simulation broke one of its invariants. Agent failures
/// never surface here, they end up in the agents' logs.
#[instrument(skip_all, fields(seed = config.seed, board = config.board_size))]
pub fn run_match(
    white: &[u8],
    black: &[u8],
    config: &Configuration,
    constraints: &Constraints,
) -> Result<MatchResult, EngineError> {
    let code = [
        Arc::new(CodeContainer::from_bytes(white)?),
        Arc::new(CodeContainer::from_bytes(black)?),
    ];
    let mut game = Game::new(code, *config, *constraints)?;
    game.run()?;
    let (state, logs) = game.into_parts();
    let winner = state
        .winner
        .ok_or_else(|| EngineError::SimulationInvariant("match finished without a winner".into()))?;
    Ok(MatchResult {
        winner,
        rounds: state.round,
        score: state.score,
        history: state.history,
        logs,
    })
}

/// Storage and reporting services of the surrounding platform.
pub trait SubmissionStore {
    fn fetch_submission(&self, id: &str) -> anyhow::Result<SourceFiles>;
    fn store_artifact(&mut self, id: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
    fn fetch_artifact(&self, id: &str) -> anyhow::Result<Vec<u8>>;
    fn report_match_result(
        &mut self,
        match_id: &str,
        winner: Team,
        score: [usize; 2],
    ) -> anyhow::Result<()>;
    fn upload_replay(&mut self, match_id: &str, history: Vec<u8>) -> anyhow::Result<()>;
}

/// [`SubmissionStore`] kept in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: HashMap<String, SourceFiles>,
    artifacts: HashMap<String, Vec<u8>>,
    results: HashMap<String, (Team, [usize; 2])>,
    replays: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_submission(&mut self, id: &str, files: SourceFiles) {
        self.submissions.insert(id.to_owned(), files);
    }

    pub fn result(&self, match_id: &str) -> Option<(Team, [usize; 2])> {
        self.results.get(match_id).copied()
    }

    pub fn replay(&self, match_id: &str) -> Option<&[u8]> {
        self.replays.get(match_id).map(Vec::as_slice)
    }

    pub fn has_artifact(&self, id: &str) -> bool {
        self.artifacts.contains_key(id)
    }
}

impl SubmissionStore for MemoryStore {
    fn fetch_submission(&self, id: &str) -> anyhow::Result<SourceFiles> {
        self.submissions
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown submission '{id}'"))
    }

    fn store_artifact(&mut self, id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.artifacts.insert(id.to_owned(), bytes);
        Ok(())
    }

    fn fetch_artifact(&self, id: &str) -> anyhow::Result<Vec<u8>> {
        self.artifacts
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no artifact for submission '{id}'"))
    }

    fn report_match_result(
        &mut self,
        match_id: &str,
        winner: Team,
        score: [usize; 2],
    ) -> anyhow::Result<()> {
        self.results.insert(match_id.to_owned(), (winner, score));
        Ok(())
    }

    fn upload_replay(&mut self, match_id: &str, history: Vec<u8>) -> anyhow::Result<()> {
        self.replays.insert(match_id.to_owned(), history);
        Ok(())
    }
}

/// Compiles submissions and plays matches against a [`SubmissionStore`].
#[derive(Debug)]
pub struct Evaluator {
    config: Configuration,
    constraints: Constraints,
}

impl Evaluator {
    /// Create an [`Evaluator`] with given [`Configuration`] and [`Constraints`].
    ///
    /// Installs the file logger when [`Configuration::with_log`] is set.
    #[instrument(skip_all)]
    pub fn new(config: Configuration, constraints: Constraints) -> anyhow::Result<Evaluator> {
        if config.log {
            init_logger("pawnbox")?;
        }
        trace!(?config, ?constraints);
        Ok(Evaluator {
            config,
            constraints,
        })
    }

    /// Fetches a submission's sources, builds them and stores the artifact under the same id.
    #[instrument(skip(self, store))]
    pub fn compile_submission(
        &self,
        store: &mut impl SubmissionStore,
        id: &str,
    ) -> anyhow::Result<()> {
        let files = store.fetch_submission(id)?;
        let artifact = compile(files).with_context(|| format!("compiling submission '{id}'"))?;
        store.store_artifact(id, artifact)?;
        info!(id, "submission compiled");
        Ok(())
    }

    /// Plays `white` against `black`, reports the outcome and uploads the replay.
    #[instrument(skip(self, store))]
    pub fn play(
        &self,
        store: &mut impl SubmissionStore,
        match_id: &str,
        white: &str,
        black: &str,
    ) -> anyhow::Result<MatchResult> {
        let white_artifact = store.fetch_artifact(white)?;
        let black_artifact = store.fetch_artifact(black)?;
        let result = run_match(&white_artifact, &black_artifact, &self.config, &self.constraints)
            .with_context(|| format!("running match '{match_id}'"))?;
        store.report_match_result(match_id, result.winner, result.score)?;
        store.upload_replay(match_id, result.history_bytes()?)?;
        info!(match_id, winner = %result.winner, rounds = result.rounds, "match played");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsBuilder;

    const IDLE: &str = "def turn():\n    pass\n";

    fn evaluator(rounds: u32) -> Evaluator {
        let config = Configuration::new().with_max_rounds(rounds);
        Evaluator::new(config, ConstraintsBuilder::new().build().unwrap()).unwrap()
    }

    #[test]
    fn compile_reports_syntax_errors() {
        let err = compile([("bot.py", "def turn(:\n")]).unwrap_err();
        assert!(matches!(err, BuildError::Syntax { line: 1, .. }));
    }

    #[test]
    fn evaluator_reports_and_uploads() {
        let mut store = MemoryStore::new();
        store.add_submission("a", vec![("bot.py".into(), IDLE.into())]);
        store.add_submission("b", vec![("bot.py".into(), IDLE.into())]);
        let evaluator = evaluator(2);
        evaluator.compile_submission(&mut store, "a").unwrap();
        evaluator.compile_submission(&mut store, "b").unwrap();
        assert!(store.has_artifact("a"));

        let result = evaluator.play(&mut store, "m1", "a", "b").unwrap();
        assert_eq!(store.result("m1"), Some((result.winner, [0, 0])));
        let replay: serde_json::Value = serde_json::from_slice(store.replay("m1").unwrap()).unwrap();
        assert_eq!(replay.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn unknown_submissions_are_errors() {
        let mut store = MemoryStore::new();
        assert!(evaluator(1).compile_submission(&mut store, "ghost").is_err());
        assert!(evaluator(1).play(&mut store, "m", "ghost", "ghost").is_err());
    }
}
