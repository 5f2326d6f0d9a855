use std::fmt;

use serde::Serialize;

use crate::vm::value::{Value, Variant};

/// Robot identity. HQs are 0 and 1, pawns count up from 2 in creation order.
pub type RobotId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Team {
    White,
    Black,
}

impl Team {
    pub const ALL: [Team; 2] = [Team::White, Team::Black];

    pub fn name(self) -> &'static str {
        match self {
            Team::White => "WHITE",
            Team::Black => "BLACK",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Team::White => 0,
            Team::Black => 1,
        }
    }

    pub fn opponent(self) -> Team {
        match self {
            Team::White => Team::Black,
            Team::Black => Team::White,
        }
    }

    /// Row this team spawns on.
    pub fn home_row(self, board_size: usize) -> usize {
        match self {
            Team::White => 0,
            Team::Black => board_size.saturating_sub(1),
        }
    }

    /// Row delta of one step forward.
    pub fn forward(self) -> isize {
        match self {
            Team::White => 1,
            Team::Black => -1,
        }
    }

    pub fn value(self) -> Value {
        Value::Variant(Variant {
            family: "Team",
            name: self.name(),
            value: self.index() as u8,
        })
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RobotType {
    Pawn,
    Overlord,
}

impl RobotType {
    pub fn name(self) -> &'static str {
        match self {
            RobotType::Pawn => "PAWN",
            RobotType::Overlord => "OVERLORD",
        }
    }

    pub fn value(self) -> Value {
        Value::Variant(Variant {
            family: "RobotType",
            name: self.name(),
            value: self as u8,
        })
    }
}

/// Simulation record of one robot. Its runtime lives on a worker thread.
#[derive(Debug, Clone)]
pub struct Robot {
    pub id: RobotId,
    pub team: Team,
    pub kind: RobotType,
    /// Board cell of a pawn. HQs stay off the board.
    pub position: Option<(usize, usize)>,
    pub health: u32,
    /// Set once the robot moved, captured or spawned this turn.
    pub has_moved: bool,
    /// Log lines of the robot's latest turn.
    pub logs: Vec<String>,
}

impl Robot {
    pub const STARTING_HEALTH: u32 = 1;

    pub fn new(id: RobotId, team: Team, kind: RobotType, position: Option<(usize, usize)>) -> Robot {
        Robot {
            id,
            team,
            kind,
            position,
            health: Robot::STARTING_HEALTH,
            has_moved: false,
            logs: Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        match self.kind {
            RobotType::Overlord => format!("{} HQ", self.team),
            RobotType::Pawn => format!("{} pawn {}", self.team, self.id),
        }
    }
}

impl fmt::Display for Robot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let team = match self.team {
            Team::White => 'W',
            Team::Black => 'B',
        };
        write!(f, "{team}{:3}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teams_face_each_other() {
        assert_eq!(Team::White.home_row(16), 0);
        assert_eq!(Team::Black.home_row(16), 15);
        assert_eq!(Team::White.opponent(), Team::Black);
        assert_eq!(Team::White.forward(), -Team::Black.forward());
    }

    #[test]
    fn robots_render_in_four_columns() {
        let pawn = Robot::new(7, Team::Black, RobotType::Pawn, Some((3, 4)));
        assert_eq!(pawn.to_string(), "B  7");
        assert_eq!(pawn.label(), "BLACK pawn 7");
    }
}
