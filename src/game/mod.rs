//! Deterministic turn-based simulation.
//!
//! A [`Game`] owns the [`World`] and one [`RunnerHandle`] per robot. Each round, pawns act in
//! creation order, each followed by a termination check, then the two HQs act in an order that
//! reverses every round. Robots act one at a time: the world is shared with the worker threads
//! only so that host functions can reach it during the acting robot's turn.

mod bindings;
pub mod board;
pub mod robot;
pub mod world;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use self::bindings::RobotBindings;
pub use self::robot::{Robot, RobotId, RobotType, Team};
pub use self::world::{CellSnapshot, Snapshot, World};
use crate::code_container::CodeContainer;
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::error::EngineError;
use crate::runtime::RunnerSettings;
use crate::scheduler::{self, RunnerHandle, TurnOutcome, TurnReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Running,
    Finished,
}

/// One agent log line, attributed to the robot and round that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentLog {
    pub round: u32,
    pub robot: RobotId,
    pub team: Team,
    pub message: String,
}

/// Round counter, outcome and replay history of a match.
#[derive(Debug, Clone)]
pub struct MatchState {
    pub round: u32,
    pub phase: Phase,
    pub winner: Option<Team>,
    /// Pawns of each team on the opponent's home row when the match finished.
    pub score: [usize; 2],
    /// One snapshot per completed round, the last one showing the final board.
    pub history: Vec<Snapshot>,
}

pub struct Game {
    config: Configuration,
    constraints: Constraints,
    code: [Arc<CodeContainer>; 2],
    world: Arc<Mutex<World>>,
    runners: BTreeMap<RobotId, RunnerHandle>,
    /// Threads of stopped runtimes, joined once the match is over.
    retired: Vec<JoinHandle<()>>,
    lords: Vec<RobotId>,
    state: MatchState,
    rng: StdRng,
    logs: Vec<AgentLog>,
}

impl Game {
    /// Sets up the board and starts both HQ runtimes. `code` is indexed by [`Team::index`].
    ///
    /// # Errors
    /// A worker thread cannot be started.
    #[instrument(skip_all, fields(seed = config.seed))]
    pub fn new(
        code: [Arc<CodeContainer>; 2],
        config: Configuration,
        constraints: Constraints,
    ) -> Result<Game, EngineError> {
        let world = World::new(config.board_size, config.sensor_radius);
        let lords = Team::ALL.iter().map(|&t| t.index() as RobotId).collect();
        let mut game = Game {
            config,
            constraints,
            code,
            world: Arc::new(Mutex::new(world)),
            runners: BTreeMap::new(),
            retired: Vec::new(),
            lords,
            state: MatchState {
                round: 0,
                phase: Phase::Setup,
                winner: None,
                score: [0; 2],
                history: Vec::new(),
            },
            rng: StdRng::seed_from_u64(config.seed),
            logs: Vec::new(),
        };
        for hq in game.lords.clone() {
            game.animate(hq)?;
        }
        game.state.phase = Phase::Running;
        debug!("match set up");
        Ok(game)
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.phase == Phase::Running
    }

    pub fn logs(&self) -> &[AgentLog] {
        &self.logs
    }

    /// Consumes the game, returning its final state and every agent log line.
    pub fn into_parts(self) -> (MatchState, Vec<AgentLog>) {
        (self.state.clone(), self.logs.clone())
    }

    fn world(&self) -> Result<MutexGuard<'_, World>, EngineError> {
        self.world
            .lock()
            .map_err(|_| EngineError::SimulationInvariant("world lock poisoned".into()))
    }

    /// Starts the runtime of a robot already placed in the world.
    fn animate(&mut self, id: RobotId) -> Result<(), EngineError> {
        let (team, kind, label) = {
            let world = self.world()?;
            let robot = world.robot(id).ok_or_else(|| {
                EngineError::SimulationInvariant(format!("robot {id} has no record"))
            })?;
            (robot.team, robot.kind, robot.label())
        };
        let settings = RunnerSettings {
            label,
            seed: self.config.seed.wrapping_mul(1_000_003).wrapping_add(id as u64),
            debug: self.config.debug,
            constraints: self.constraints,
        };
        let bindings = RobotBindings {
            world: self.world.clone(),
            id,
            team,
            kind,
            board_size: self.config.board_size,
        };
        let handle = RunnerHandle::spawn(self.code[team.index()].clone(), settings, Box::new(bindings))
            .map_err(|e| EngineError::Worker(format!("{e:#}")))?;
        self.runners.insert(id, handle);
        Ok(())
    }

    /// Plays one round.
    ///
    /// # Errors
    /// [`EngineError::GameOver`] once the match finished, or a broken simulation invariant.
    #[instrument(skip(self), fields(round = self.state.round + 1))]
    pub fn turn(&mut self) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::GameOver);
        }
        self.state.round += 1;
        if self.state.round > self.config.max_rounds {
            self.check_over()?;
            if !self.is_running() {
                return Ok(());
            }
        }

        let pawns = self.world()?.pawns();
        for id in pawns {
            if self.world()?.robot(id).is_none() {
                continue;
            }
            let report = self.play(id)?;
            if !report.initialized {
                trace!(robot = id, "removing pawn that is not initialized");
                self.delete_robot(id)?;
            }
            self.check_over()?;
            if !self.is_running() {
                return Ok(());
            }
        }

        for hq in self.lords.clone() {
            self.play(hq)?;
        }
        self.lords.reverse();
        let snapshot = {
            let world = self.world()?;
            if self.config.debug {
                debug!("round {}\n{}", self.state.round, world.render());
            }
            world.snapshot()
        };
        self.state.history.push(snapshot);
        Ok(())
    }

    /// Plays rounds until the match finishes.
    pub fn run(&mut self) -> Result<(), EngineError> {
        while self.is_running() {
            self.turn()?;
        }
        info!(
            winner = ?self.state.winner,
            rounds = self.state.round,
            "match finished"
        );
        Ok(())
    }

    /// Runs one robot's turn and applies its side effects on the runner set.
    fn play(&mut self, id: RobotId) -> Result<TurnReport, EngineError> {
        self.world()?.begin_turn(id);
        let report = match self.runners.get_mut(&id) {
            Some(handle) => handle.run_turn(),
            None => TurnReport {
                outcome: TurnOutcome::Stopped,
                logs: Vec::new(),
                initialized: false,
            },
        };
        match &report.outcome {
            TurnOutcome::Failed(error) => trace!(robot = id, %error, "turn failed"),
            TurnOutcome::Crashed(message) => warn!(robot = id, %message, "runtime crashed"),
            _ => {}
        }

        let (team, spawned, removed) = {
            let mut world = self.world()?;
            world.end_turn(id, report.logs.clone());
            let team = world.robot(id).map(|r| r.team);
            (team, world.take_spawned(), world.take_removed())
        };
        if let Some(team) = team {
            self.logs.extend(report.logs.iter().map(|message| AgentLog {
                round: self.state.round,
                robot: id,
                team,
                message: message.clone(),
            }));
        }
        for victim in removed {
            debug!(robot = victim, "captured");
            self.retire(victim);
        }
        for pawn in spawned {
            self.animate(pawn)?;
        }
        self.world()?.check_consistency()?;
        Ok(report)
    }

    fn delete_robot(&mut self, id: RobotId) -> Result<(), EngineError> {
        self.world()?.remove(id);
        self.retire(id);
        Ok(())
    }

    fn retire(&mut self, id: RobotId) {
        if let Some(worker) = self.runners.remove(&id).and_then(RunnerHandle::retire) {
            self.retired.push(worker);
        }
    }

    /// Decides whether the match is over and, if so, freezes it.
    fn check_over(&mut self) -> Result<(), EngineError> {
        let [white, black] = self.world()?.home_row_counts();
        let mut winner = None;
        if self.state.round > self.config.max_rounds {
            winner = Some(if white == black {
                if self.rng.gen_bool(0.5) {
                    Team::White
                } else {
                    Team::Black
                }
            } else if white > black {
                Team::White
            } else {
                Team::Black
            });
        }
        let threshold = (self.config.board_size + 1) / 2;
        if white >= threshold {
            winner = Some(Team::White);
        }
        if black >= threshold {
            winner = Some(Team::Black);
        }
        let Some(winner) = winner else {
            return Ok(());
        };

        self.state.phase = Phase::Finished;
        self.state.winner = Some(winner);
        self.state.score = [white, black];
        let snapshot = self.world()?.snapshot();
        self.state.history.push(snapshot);
        self.process_over()
    }

    /// Removes every pawn and stops every runtime.
    fn process_over(&mut self) -> Result<(), EngineError> {
        let pawns = self.world()?.pawns();
        for id in pawns {
            self.delete_robot(id)?;
        }
        let ids: Vec<RobotId> = self.runners.keys().copied().collect();
        for id in ids {
            self.retire(id);
        }
        let workers = std::mem::take(&mut self.retired);
        let stopped = workers.len();
        let detached = scheduler::join_workers(workers, self.constraints.cancel_grace);
        debug!(stopped, detached, "runtimes stopped");
        Ok(())
    }
}

impl Drop for Game {
    fn drop(&mut self) {
        if !self.runners.is_empty() {
            warn!(running = self.runners.len(), "match dropped before it finished");
        }
        if !self.retired.is_empty() {
            scheduler::join_workers(std::mem::take(&mut self.retired), self.constraints.cancel_grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::constraints::ConstraintsBuilder;

    const IDLE: &str = "def turn():\n    pass\n";

    const MARCH: &str = "\
spawned = [0]

def turn():
    if get_type() == RobotType.OVERLORD:
        row = 0 if get_team() == Team.WHITE else get_board_size() - 1
        col = spawned[0] % get_board_size()
        if not check_space(row, col):
            spawn(row, col)
            spawned[0] += 1
    else:
        try:
            move_forward()
        except RobotError as e:
            log(str(e))
";

    fn game(white: &str, black: &str, config: Configuration) -> Game {
        let build = |src: &str| Arc::new(CodeContainer::from_sources([("bot.py", src)]).unwrap());
        let constraints = ConstraintsBuilder::new()
            .with_turn_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        Game::new([build(white), build(black)], config, constraints).unwrap()
    }

    #[test]
    fn marching_team_wins_by_occupation() {
        let mut g = game(MARCH, IDLE, Configuration::new().with_board_size(4));
        g.run().unwrap();
        let state = g.state();
        assert_eq!(state.winner, Some(Team::White));
        assert_eq!(state.round, 5);
        assert_eq!(state.score, [2, 0]);
        assert_eq!(state.history.len(), 5);
        assert_eq!(g.turn().unwrap_err().to_string(), EngineError::GameOver.to_string());
        assert!(g.runners.is_empty());
        assert!(g.retired.is_empty());
    }

    #[test]
    fn cutoff_tie_is_decided_by_the_seed() {
        let winner = |seed| {
            let mut g = game(IDLE, IDLE, Configuration::new().with_max_rounds(3).with_seed(seed));
            g.run().unwrap();
            assert_eq!(g.state().round, 4);
            assert_eq!(g.state().history.len(), 4);
            g.state().winner
        };
        assert!(winner(9).is_some());
        assert_eq!(winner(9), winner(9));
    }

    #[test]
    fn uninitialized_pawns_are_removed() {
        let spawn_then_fail = "\
if get_type() == RobotType.PAWN:
    import missing
def turn():
    if get_type() == RobotType.OVERLORD:
        spawn(0 if get_team() == Team.WHITE else get_board_size() - 1, 0)
";
        let mut g = game(spawn_then_fail, IDLE, Configuration::new().with_max_rounds(2));
        g.turn().unwrap();
        assert_eq!(g.world().unwrap().pawns(), vec![2]);
        g.turn().unwrap();
        assert!(g.world().unwrap().pawns().len() == 1);
        let logs = g.logs();
        assert!(logs
            .iter()
            .any(|l| l.robot == 2 && l.message.contains("\"missing\" does not exist")));
    }

    #[test]
    fn snapshots_carry_robot_logs() {
        let mut g = game(MARCH, IDLE, Configuration::new().with_board_size(4));
        g.turn().unwrap();
        g.turn().unwrap();
        let last = g.state().history.last().unwrap();
        let pawn = last[1][0].as_ref().unwrap();
        assert_eq!(pawn.id, 2);
        assert_eq!(pawn.team, Team::White);
        assert!(pawn.logs.is_empty());
    }
}
