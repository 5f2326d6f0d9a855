//! Authoritative board state and the rules every robot action is validated against.
//!
//! Each action checks all its preconditions before touching anything, so a rejected action
//! leaves the board exactly as it was.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use super::board::Board;
use super::robot::{Robot, RobotId, RobotType, Team};
use crate::error::EngineError;

/// An illegal action. Surfaces as a `RobotError` inside the acting agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RuleError(pub String);

fn rule<T>(message: &str) -> Result<T, RuleError> {
    Err(RuleError(message.to_owned()))
}

const ALREADY_MOVED: &str = "this unit has already moved this turn; robots can only move once per turn";
const DESYNC: &str = "something went wrong; please contact the devs";

/// One occupied cell of a board snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    pub id: RobotId,
    pub team: Team,
    pub health: u32,
    pub logs: Vec<String>,
}

/// Board rows as seen at the end of a round.
pub type Snapshot = Vec<Vec<Option<CellSnapshot>>>;

#[derive(Debug)]
pub struct World {
    board: Board,
    robots: BTreeMap<RobotId, Robot>,
    next_id: RobotId,
    sensor_radius: usize,
    acting: Option<RobotId>,
    spawned: Vec<RobotId>,
    removed: Vec<RobotId>,
}

impl World {
    /// An empty board with both HQs.
    pub fn new(board_size: usize, sensor_radius: usize) -> World {
        let mut world = World {
            board: Board::new(board_size),
            robots: BTreeMap::new(),
            next_id: 0,
            sensor_radius,
            acting: None,
            spawned: Vec::new(),
            removed: Vec::new(),
        };
        for team in Team::ALL {
            world.add(team, RobotType::Overlord, None);
        }
        world
    }

    fn add(&mut self, team: Team, kind: RobotType, position: Option<(usize, usize)>) -> RobotId {
        let id = self.next_id;
        self.next_id += 1;
        self.robots.insert(id, Robot::new(id, team, kind, position));
        if let Some(cell) = position {
            self.board.set(cell, Some(id));
        }
        id
    }

    pub fn board_size(&self) -> usize {
        self.board.size()
    }

    pub fn robot(&self, id: RobotId) -> Option<&Robot> {
        self.robots.get(&id)
    }

    /// Pawns on the board, oldest first.
    pub fn pawns(&self) -> Vec<RobotId> {
        self.robots
            .values()
            .filter(|r| r.kind == RobotType::Pawn)
            .map(|r| r.id)
            .collect()
    }

    /// Gives `id` the right to act until [`end_turn`](Self::end_turn).
    pub fn begin_turn(&mut self, id: RobotId) {
        if let Some(robot) = self.robots.get_mut(&id) {
            robot.has_moved = false;
            robot.logs.clear();
        }
        self.acting = Some(id);
    }

    pub fn end_turn(&mut self, id: RobotId, logs: Vec<String>) {
        if let Some(robot) = self.robots.get_mut(&id) {
            robot.logs = logs;
        }
        self.acting = None;
    }

    /// Rejects calls from a robot whose turn it is not.
    pub fn authorize(&self, id: RobotId) -> Result<(), RuleError> {
        if self.acting != Some(id) {
            return rule("it is not this robot's turn");
        }
        Ok(())
    }

    /// Pawns created since the last call.
    pub fn take_spawned(&mut self) -> Vec<RobotId> {
        std::mem::take(&mut self.spawned)
    }

    /// Pawns captured since the last call.
    pub fn take_removed(&mut self) -> Vec<RobotId> {
        std::mem::take(&mut self.removed)
    }

    /// Takes a pawn off the board.
    pub fn remove(&mut self, id: RobotId) {
        if let Some(robot) = self.robots.remove(&id) {
            if let Some(cell) = robot.position {
                self.board.set(cell, None);
            }
        }
    }

    fn acting_pawn(&self, id: RobotId) -> Result<&Robot, RuleError> {
        let robot = self.robots.get(&id).ok_or_else(|| RuleError(DESYNC.into()))?;
        match robot.position {
            Some(cell) if self.board.get(cell) == Some(id) => Ok(robot),
            _ => rule(DESYNC),
        }
    }

    fn relocate(&mut self, id: RobotId, to: (usize, usize)) {
        if let Some(robot) = self.robots.get_mut(&id) {
            if let Some(from) = robot.position.replace(to) {
                self.board.set(from, None);
            }
            robot.has_moved = true;
        }
        self.board.set(to, Some(id));
    }

    pub fn location(&self, id: RobotId) -> Result<(usize, usize), RuleError> {
        let robot = self.acting_pawn(id)?;
        robot.position.ok_or_else(|| RuleError(DESYNC.into()))
    }

    /// Steps a pawn one cell towards the opponent's home row.
    pub fn move_forward(&mut self, id: RobotId) -> Result<(), RuleError> {
        let robot = self.acting_pawn(id)?;
        if robot.has_moved {
            return rule(ALREADY_MOVED);
        }
        let (row, col) = self.location(id)?;
        let Some(target) = self.board.locate(row as i64 + robot.team.forward() as i64, col as i64)
        else {
            return rule("you cannot move to a space that is not on the board");
        };
        if self.board.get(target).is_some() {
            return rule("you cannot move to a space that is already occupied");
        }
        self.relocate(id, target);
        Ok(())
    }

    /// Captures the enemy pawn diagonally one step forward of `id`.
    pub fn capture(&mut self, id: RobotId, row: i64, col: i64) -> Result<(), RuleError> {
        let robot = self.acting_pawn(id)?;
        if robot.has_moved {
            return rule(ALREADY_MOVED);
        }
        let team = robot.team;
        let (from_row, from_col) = self.location(id)?;
        let Some(target) = self.board.locate(row, col) else {
            return rule("you cannot capture a space that is not on the board");
        };
        let Some(victim) = self.board.get(target) else {
            return rule("you cannot capture an empty space");
        };
        if self.robots.get(&victim).map(|r| r.team) == Some(team) {
            return rule("you cannot capture your own piece");
        }
        if (from_col as i64 - col).abs() != 1 {
            return rule("you must capture diagonally");
        }
        if row - from_row as i64 != team.forward() as i64 {
            return rule("you must capture diagonally forwards");
        }
        self.remove(victim);
        self.removed.push(victim);
        self.relocate(id, target);
        Ok(())
    }

    /// Places a new pawn of the HQ's team on its home row.
    pub fn spawn(&mut self, hq: RobotId, row: i64, col: i64) -> Result<RobotId, RuleError> {
        let Some(robot) = self.robots.get(&hq) else {
            return rule(DESYNC);
        };
        if robot.has_moved {
            return rule("you have already spawned a unit this turn");
        }
        let team = robot.team;
        if row != team.home_row(self.board.size()) as i64 {
            return rule("you can only spawn in the end row of your side of the board");
        }
        let Some(cell) = self.board.locate(row, col) else {
            return rule("you cannot spawn a unit on a space that is not on the board");
        };
        if self.board.get(cell).is_some() {
            return rule("you cannot spawn a unit on a space that is already occupied");
        }
        let id = self.add(team, RobotType::Pawn, Some(cell));
        self.spawned.push(id);
        if let Some(robot) = self.robots.get_mut(&hq) {
            robot.has_moved = true;
        }
        Ok(id)
    }

    fn team_at(&self, cell: (usize, usize)) -> Option<Team> {
        self.board
            .get(cell)
            .and_then(|id| self.robots.get(&id))
            .map(|r| r.team)
    }

    /// Team occupying a cell anywhere on the board.
    pub fn hq_check_space(&self, row: i64, col: i64) -> Result<Option<Team>, RuleError> {
        match self.board.locate(row, col) {
            Some(cell) => Ok(self.team_at(cell)),
            None => rule("that space is not on the board"),
        }
    }

    /// Team occupying a cell within the pawn's sensor radius.
    pub fn pawn_check_space(&self, id: RobotId, row: i64, col: i64) -> Result<Option<Team>, RuleError> {
        let (r, c) = self.location(id)?;
        let distance = (r as i64 - row).abs().max((c as i64 - col).abs());
        if distance > self.sensor_radius as i64 {
            return rule("that space is not within sensory radius of this robot");
        }
        self.hq_check_space(row, col)
    }

    /// Robots within the sensor radius of a pawn, excluding itself, row-major.
    pub fn sense(&self, id: RobotId) -> Result<Vec<(usize, usize, Team)>, RuleError> {
        let (row, col) = self.location(id)?;
        let radius = self.sensor_radius as i64;
        let mut found = Vec::new();
        for dr in -radius..=radius {
            for dc in -radius..=radius {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let Some(cell) = self.board.locate(row as i64 + dr, col as i64 + dc) else {
                    continue;
                };
                if let Some(team) = self.team_at(cell) {
                    found.push((cell.0, cell.1, team));
                }
            }
        }
        Ok(found)
    }

    /// Teams of every cell, row by row.
    pub fn teams(&self) -> Vec<Vec<Option<Team>>> {
        (0..self.board.size())
            .map(|row| {
                (0..self.board.size())
                    .map(|col| self.team_at((row, col)))
                    .collect()
            })
            .collect()
    }

    /// Pawns of each team standing on the opponent's home row, indexed by [`Team::index`].
    pub fn home_row_counts(&self) -> [usize; 2] {
        let size = self.board.size();
        let mut counts = [0; 2];
        for team in Team::ALL {
            let row = team.opponent().home_row(size);
            counts[team.index()] = (0..size)
                .filter(|&col| self.team_at((row, col)) == Some(team))
                .count();
        }
        counts
    }

    /// Checks that every pawn and the cell it stands on point at each other.
    pub fn check_consistency(&self) -> Result<(), EngineError> {
        for robot in self.robots.values() {
            match (robot.kind, robot.position) {
                (RobotType::Pawn, Some(cell)) if self.board.get(cell) == Some(robot.id) => {}
                (RobotType::Overlord, None) => {}
                _ => {
                    return Err(EngineError::SimulationInvariant(format!(
                        "robot {} at {:?} is not on its cell",
                        robot.id, robot.position
                    )))
                }
            }
        }
        for (cell, id) in self.board.occupied() {
            if self.robots.get(&id).and_then(|r| r.position) != Some(cell) {
                return Err(EngineError::SimulationInvariant(format!(
                    "cell {cell:?} points at robot {id} standing elsewhere"
                )));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        (0..self.board.size())
            .map(|row| {
                self.board
                    .row(row)
                    .iter()
                    .map(|cell| {
                        let robot = self.robots.get(&(*cell)?)?;
                        Some(CellSnapshot {
                            id: robot.id,
                            team: robot.team,
                            health: robot.health,
                            logs: robot.logs.clone(),
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Human readable board, one line per row.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for row in 0..self.board.size() {
            for cell in self.board.row(row) {
                match cell.and_then(|id| self.robots.get(&id)) {
                    Some(robot) => out.push_str(&format!("[{robot}] ")),
                    None => out.push_str("[    ] "),
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE_HQ: RobotId = 0;
    const BLACK_HQ: RobotId = 1;

    fn world() -> World {
        World::new(6, 2)
    }

    fn spawn(world: &mut World, hq: RobotId, row: i64, col: i64) -> RobotId {
        world.begin_turn(hq);
        let id = world.spawn(hq, row, col).unwrap();
        world.end_turn(hq, Vec::new());
        id
    }

    #[test]
    fn spawns_are_limited_to_home_row_once_per_turn() {
        let mut w = world();
        w.begin_turn(WHITE_HQ);
        assert!(w.spawn(WHITE_HQ, 1, 0).is_err());
        assert!(w.spawn(WHITE_HQ, 0, 6).is_err());
        assert_eq!(w.spawn(WHITE_HQ, 0, 2), Ok(2));
        assert!(w.spawn(WHITE_HQ, 0, 3).is_err());
        assert_eq!(w.take_spawned(), vec![2]);
        w.begin_turn(BLACK_HQ);
        assert_eq!(w.spawn(BLACK_HQ, 5, 2), Ok(3));
        w.check_consistency().unwrap();
    }

    #[test]
    fn pawns_move_towards_the_opponent() {
        let mut w = world();
        let white = spawn(&mut w, WHITE_HQ, 0, 1);
        let black = spawn(&mut w, BLACK_HQ, 5, 1);
        w.begin_turn(white);
        w.move_forward(white).unwrap();
        assert_eq!(w.move_forward(white), rule(ALREADY_MOVED));
        w.begin_turn(black);
        w.move_forward(black).unwrap();
        assert_eq!(w.location(white), Ok((1, 1)));
        assert_eq!(w.location(black), Ok((4, 1)));
        w.check_consistency().unwrap();
    }

    #[test]
    fn capture_takes_the_enemy_cell() {
        let mut w = world();
        let white = spawn(&mut w, WHITE_HQ, 0, 1);
        let black = spawn(&mut w, BLACK_HQ, 5, 2);
        for _ in 0..3 {
            w.begin_turn(black);
            w.move_forward(black).unwrap();
        }
        w.begin_turn(white);
        assert!(w.capture(white, 2, 2).is_err());
        w.begin_turn(black);
        w.move_forward(black).unwrap();
        w.begin_turn(white);
        w.capture(white, 1, 2).unwrap();
        assert_eq!(w.take_removed(), vec![black]);
        assert_eq!(w.location(white), Ok((1, 2)));
        assert!(w.robot(black).is_none());
        w.check_consistency().unwrap();
    }

    #[test]
    fn rejected_actions_leave_the_board_unchanged() {
        let mut w = world();
        let white = spawn(&mut w, WHITE_HQ, 0, 0);
        let before = w.snapshot();
        w.begin_turn(white);
        assert!(w.capture(white, -1, 1).is_err());
        assert!(w.capture(white, 1, 1).is_err());
        assert_eq!(w.snapshot(), before);
    }

    #[test]
    fn pawns_cannot_step_off_the_far_edge() {
        let mut w = world();
        let white = spawn(&mut w, WHITE_HQ, 0, 3);
        for _ in 0..5 {
            w.begin_turn(white);
            w.move_forward(white).unwrap();
            w.end_turn(white, Vec::new());
        }
        assert_eq!(w.location(white), Ok((5, 3)));

        let before = w.snapshot();
        w.begin_turn(white);
        assert_eq!(
            w.move_forward(white),
            rule("you cannot move to a space that is not on the board")
        );
        assert_eq!(w.snapshot(), before);
        assert_eq!(w.location(white), Ok((5, 3)));
        w.check_consistency().unwrap();
    }

    #[test]
    fn pawn_sensing_is_bounded_by_radius() {
        let mut w = world();
        let white = spawn(&mut w, WHITE_HQ, 0, 0);
        spawn(&mut w, WHITE_HQ, 0, 2);
        spawn(&mut w, WHITE_HQ, 0, 3);
        assert_eq!(w.sense(white), Ok(vec![(0, 2, Team::White)]));
        assert_eq!(w.pawn_check_space(white, 0, 2), Ok(Some(Team::White)));
        assert_eq!(w.pawn_check_space(white, 1, 1), Ok(None));
        assert!(w.pawn_check_space(white, 0, 3).is_err());
        assert_eq!(w.hq_check_space(0, 3), Ok(Some(Team::White)));
    }

    #[test]
    fn home_rows_are_counted_per_team() {
        let mut w = World::new(2, 2);
        let white = spawn(&mut w, WHITE_HQ, 0, 0);
        w.begin_turn(white);
        w.move_forward(white).unwrap();
        assert_eq!(w.home_row_counts(), [1, 0]);
        assert_eq!(w.render(), "[    ] [    ] \n[W  2] [    ] \n");
    }

    #[test]
    fn only_the_acting_robot_is_authorized() {
        let mut w = world();
        w.begin_turn(WHITE_HQ);
        assert!(w.authorize(WHITE_HQ).is_ok());
        assert!(w.authorize(BLACK_HQ).is_err());
        w.end_turn(WHITE_HQ, vec!["done".into()]);
        assert!(w.authorize(WHITE_HQ).is_err());
        assert_eq!(w.robot(WHITE_HQ).map(|r| r.logs.len()), Some(1));
    }

    #[derive(Debug, Clone)]
    enum Action {
        Spawn(Team, i64),
        Move(usize),
        Capture(usize, i64),
    }

    fn action() -> impl proptest::strategy::Strategy<Value = Action> {
        use proptest::prelude::*;
        let team = prop_oneof![Just(Team::White), Just(Team::Black)];
        prop_oneof![
            (team, -1i64..7).prop_map(|(t, c)| Action::Spawn(t, c)),
            (0usize..32).prop_map(Action::Move),
            (0usize..32, prop_oneof![Just(-1i64), Just(1)]).prop_map(|(p, d)| Action::Capture(p, d)),
        ]
    }

    proptest::proptest! {
        #[test]
        fn any_action_sequence_keeps_the_board_consistent(
            actions in proptest::collection::vec(action(), 1..120)
        ) {
            let mut w = world();
            for action in actions {
                match action {
                    Action::Spawn(team, col) => {
                        let hq = team.index() as RobotId;
                        w.begin_turn(hq);
                        let _ = w.spawn(hq, team.home_row(6) as i64, col);
                        w.end_turn(hq, Vec::new());
                    }
                    Action::Move(_) | Action::Capture(..) if w.pawns().is_empty() => {}
                    Action::Move(pick) => {
                        let pawns = w.pawns();
                        let id = pawns[pick % pawns.len()];
                        w.begin_turn(id);
                        let _ = w.move_forward(id);
                        w.end_turn(id, Vec::new());
                    }
                    Action::Capture(pick, dc) => {
                        let pawns = w.pawns();
                        let id = pawns[pick % pawns.len()];
                        let (row, col) = w.location(id).unwrap();
                        let team = w.robot(id).unwrap().team;
                        w.begin_turn(id);
                        let _ = w.capture(id, row as i64 + team.forward() as i64, col as i64 + dc);
                        w.end_turn(id, Vec::new());
                    }
                }
                proptest::prop_assert!(w.check_consistency().is_ok());
                let ids: Vec<RobotId> = w.snapshot().iter().flatten().flatten().map(|c| c.id).collect();
                let mut unique = ids.clone();
                unique.sort_unstable();
                unique.dedup();
                proptest::prop_assert_eq!(ids.len(), unique.len());
            }
            w.take_removed();
            proptest::prop_assert!(w.pawns().iter().all(|&id| w.location(id).is_ok()));
        }
    }
}
