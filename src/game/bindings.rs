//! Host functions injected into each robot's builtins.
//!
//! Every function closes over the robot it was created for, so an agent can only act as
//! itself. World access happens under the shared lock, one action at a time.

use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};

use super::robot::{RobotId, RobotType, Team};
use super::world::{RuleError, World};
use crate::runtime::{Builtins, HostBindings};
use crate::vm::{Args, ExcKind, Host, ModuleScope, Native, Unwind, Value};

pub struct RobotBindings {
    pub(crate) world: Arc<Mutex<World>>,
    pub(crate) id: RobotId,
    pub(crate) team: Team,
    pub(crate) kind: RobotType,
    pub(crate) board_size: usize,
}

fn install(
    builtins: &mut Builtins,
    name: &'static str,
    func: impl Fn(&mut dyn Host, Args) -> Result<Value, Unwind> + 'static,
) {
    builtins.insert(Rc::from(name), Native::value(name, func));
}

fn robot_error(error: RuleError) -> Unwind {
    Unwind::raise(ExcKind::RobotError, error.0)
}

/// Locks the world on behalf of `id`, failing if it is not `id`'s turn.
fn acting(world: &Mutex<World>, id: RobotId) -> Result<MutexGuard<'_, World>, Unwind> {
    let guard = world
        .lock()
        .map_err(|_| Unwind::raise(ExcKind::GameError, "game state is unavailable"))?;
    guard.authorize(id).map_err(robot_error)?;
    Ok(guard)
}

fn team_or_false(team: Option<Team>) -> Value {
    team.map_or(Value::Bool(false), Team::value)
}

fn cell(value: usize) -> Value {
    Value::Int(value as i64)
}

impl HostBindings for RobotBindings {
    fn bind(self: Box<Self>, builtins: &mut Builtins) {
        let RobotBindings {
            world,
            id,
            team,
            kind,
            board_size,
        } = *self;

        builtins.insert(
            Rc::from("Team"),
            Value::Module(ModuleScope::with(
                "Team",
                Team::ALL.map(|t| (t.name(), t.value())),
            )),
        );
        builtins.insert(
            Rc::from("RobotType"),
            Value::Module(ModuleScope::with(
                "RobotType",
                [RobotType::Pawn, RobotType::Overlord].map(|k| (k.name(), k.value())),
            )),
        );
        install(builtins, "get_board_size", move |_, args| {
            args.arity("get_board_size", 0, 0)?;
            Ok(cell(board_size))
        });
        install(builtins, "get_team", move |_, args| {
            args.arity("get_team", 0, 0)?;
            Ok(team.value())
        });
        install(builtins, "get_type", move |_, args| {
            args.arity("get_type", 0, 0)?;
            Ok(kind.value())
        });

        match kind {
            RobotType::Overlord => bind_hq(builtins, world, id),
            RobotType::Pawn => bind_pawn(builtins, world, id),
        }
    }
}

fn bind_hq(builtins: &mut Builtins, world: Arc<Mutex<World>>, id: RobotId) {
    let w = world.clone();
    install(builtins, "check_space", move |_, args| {
        args.arity("check_space", 2, 2)?;
        let (row, col) = (args.int("check_space", 0)?, args.int("check_space", 1)?);
        let team = acting(&w, id)?.hq_check_space(row, col).map_err(robot_error)?;
        Ok(team_or_false(team))
    });

    let w = world.clone();
    install(builtins, "get_board", move |_, args| {
        args.arity("get_board", 0, 0)?;
        let teams = acting(&w, id)?.teams();
        let rows = teams
            .into_iter()
            .map(|row| {
                Value::list(
                    row.into_iter()
                        .map(|t| t.map_or(Value::None, Team::value))
                        .collect(),
                )
            })
            .collect();
        Ok(Value::list(rows))
    });

    install(builtins, "spawn", move |_, args| {
        args.arity("spawn", 2, 2)?;
        let (row, col) = (args.int("spawn", 0)?, args.int("spawn", 1)?);
        acting(&world, id)?
            .spawn(id, row, col)
            .map_err(robot_error)?;
        Ok(Value::None)
    });
}

fn bind_pawn(builtins: &mut Builtins, world: Arc<Mutex<World>>, id: RobotId) {
    let w = world.clone();
    install(builtins, "get_location", move |_, args| {
        args.arity("get_location", 0, 0)?;
        let (row, col) = acting(&w, id)?.location(id).map_err(robot_error)?;
        Ok(Value::tuple(vec![cell(row), cell(col)]))
    });

    let w = world.clone();
    install(builtins, "move_forward", move |_, args| {
        args.arity("move_forward", 0, 0)?;
        acting(&w, id)?.move_forward(id).map_err(robot_error)?;
        Ok(Value::None)
    });

    let w = world.clone();
    install(builtins, "capture", move |_, args| {
        args.arity("capture", 2, 2)?;
        let (row, col) = (args.int("capture", 0)?, args.int("capture", 1)?);
        acting(&w, id)?.capture(id, row, col).map_err(robot_error)?;
        Ok(Value::None)
    });

    let w = world.clone();
    install(builtins, "check_space", move |_, args| {
        args.arity("check_space", 2, 2)?;
        let (row, col) = (args.int("check_space", 0)?, args.int("check_space", 1)?);
        let team = acting(&w, id)?
            .pawn_check_space(id, row, col)
            .map_err(robot_error)?;
        Ok(team_or_false(team))
    });

    install(builtins, "sense", move |_, args| {
        args.arity("sense", 0, 0)?;
        let found = acting(&world, id)?.sense(id).map_err(robot_error)?;
        Ok(Value::list(
            found
                .into_iter()
                .map(|(row, col, team)| Value::tuple(vec![cell(row), cell(col), team.value()]))
                .collect(),
        ))
    });
}
