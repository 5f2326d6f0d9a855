use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use pawnbox::agent_collector::collect_submission;
use pawnbox::game::Snapshot;
use pawnbox::prelude::*;
use tracing::Level;

fn init_test_logger() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn artifact(agent: &str) -> Vec<u8> {
    let files = collect_submission(&Path::new("tests/agents").join(agent)).unwrap();
    compile(files).unwrap()
}

fn constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_turn_timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

fn play(white: &str, black: &str, config: Configuration) -> MatchResult {
    init_test_logger();
    run_match(&artifact(white), &artifact(black), &config, &constraints()).unwrap()
}

fn logs_of(result: &MatchResult, team: Team) -> Vec<String> {
    result.team_logs(team).map(|l| l.message.clone()).collect()
}

fn teams_on(snapshot: &Snapshot) -> HashSet<Team> {
    snapshot.iter().flatten().flatten().map(|c| c.team).collect()
}

#[test]
fn exhausted_budgets_end_in_a_seeded_coin_flip() {
    let config = Configuration::new().with_max_rounds(20).with_seed(7);
    let first = play("burns_budget", "burns_budget", config);
    assert_eq!(first.rounds, 21);
    assert_eq!(first.score, [0, 0]);
    assert!(logs_of(&first, Team::White)
        .iter()
        .all(|l| l.starts_with("Ran out of budget")));
    assert!(!logs_of(&first, Team::Black).is_empty());

    let second = play("burns_budget", "burns_budget", config);
    assert_eq!(first.winner, second.winner);
}

#[test]
fn missing_import_leaves_its_team_inert() {
    let config = Configuration::new().with_board_size(6).with_seed(3);
    let result = play("imports_missing", "marcher", config);
    assert_eq!(result.winner, Team::Black);

    let white = logs_of(&result, Team::White);
    assert_eq!(white.len(), 1);
    assert!(white[0].starts_with("ConfinementError: Module \"numpy\" does not exist."));
    assert!(result
        .history
        .iter()
        .all(|board| !teams_on(board).contains(&Team::White)));
}

#[test]
fn import_cycles_are_reported_not_looped() {
    let config = Configuration::new().with_max_rounds(3);
    let result = play("import_cycle", "idle", config);
    let white = logs_of(&result, Team::White);
    assert_eq!(white.len(), 1);
    assert!(white[0].contains("Import cycle detected: bot -> first -> second -> first"));
}

#[test]
fn out_of_bounds_capture_is_catchable_and_harmless() {
    let config = Configuration::new().with_board_size(4).with_max_rounds(4);
    let result = play("out_of_bounds", "out_of_bounds", config);
    let white = logs_of(&result, Team::White);
    assert!(white.contains(&"refused: you cannot capture a space that is not on the board".to_string()));

    let pawns_at = |board: &Snapshot| -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for (r, row) in board.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if cell.is_some() {
                    cells.push((r, c));
                }
            }
        }
        cells
    };
    let settled = &result.history[result.history.len() - 2];
    assert_eq!(pawns_at(settled), vec![(0, 0), (3, 0)]);
}

#[test]
fn runtime_errors_report_agent_lines() {
    let config = Configuration::new().with_max_rounds(1);
    let result = play("crashes_at_line", "idle", config);
    let white = logs_of(&result, Team::White);
    let trace = white
        .iter()
        .find(|l| l.starts_with("Traceback"))
        .expect("the HQ turn raised");
    assert!(trace.contains("File \"bot\", line 9, in turn"));
    assert!(trace.contains("File \"bot\", line 2, in divide"));
    assert!(trace.ends_with("ZeroDivisionError: integer division or modulo by zero"));
}

#[test]
fn matches_are_deterministic() {
    let config = Configuration::new().with_board_size(8).with_max_rounds(60).with_seed(11);
    let first = play("marcher", "marcher", config);
    let second = play("marcher", "marcher", config);
    assert_eq!(first.history_bytes().unwrap(), second.history_bytes().unwrap());
    assert_eq!(first.winner, second.winner);
    assert_eq!(first.rounds, second.rounds);
    assert_eq!(logs_of(&first, Team::White), logs_of(&second, Team::White));
}

#[test]
fn snapshots_never_place_a_robot_twice() {
    let config = Configuration::new().with_board_size(8).with_max_rounds(60).with_seed(5);
    let result = play("marcher", "marcher", config);
    assert_eq!(result.history.len() as u32, result.rounds);
    for board in &result.history {
        let ids: Vec<_> = board.iter().flatten().flatten().map(|c| c.id).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(ids.iter().all(|&id| id >= 2));
    }
}

#[test]
fn artifacts_survive_a_round_trip_through_bytes() {
    let bytes = artifact("marcher");
    let result = run_match(&bytes, &bytes, &Configuration::new().with_max_rounds(2), &constraints());
    assert!(result.is_ok());
    assert!(matches!(
        run_match(b"not an artifact", &bytes, &Configuration::new(), &constraints()),
        Err(EngineError::Build(BuildError::Artifact(_)))
    ));
}
