//! Reads submissions from disk.
//!
//! A submission is a directory holding the agent's `*.py` modules, `bot.py` among them.
//! Anything else in the directory is ignored.

use std::path::Path;

use anyhow::{bail, Context};
use tracing::{error, info, instrument, warn};

use crate::code_container::CodeContainer;

/// Source files of one submission, as `(file name, source)` pairs sorted by name.
pub type SourceFiles = Vec<(String, String)>;

/// Reads every `*.py` regular file of `directory`.
///
/// # Errors
/// `directory` is not a readable directory, a source file is not valid UTF-8, or there is no
/// source file at all.
#[instrument]
pub fn collect_submission(directory: &Path) -> anyhow::Result<SourceFiles> {
    if !directory.is_dir() {
        bail!("'{directory:?}' is not a valid directory");
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory).with_context(|| format!("reading {directory:?}"))? {
        let entry = entry.context("one entry cannot be read in directory")?;
        let Ok(name) = entry.file_name().into_string() else {
            warn!("skipping non UTF-8 file name: {:?}", entry.file_name());
            continue;
        };
        if !name.ends_with(".py") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            warn!("Not a file: '{name}'");
            continue;
        }
        let source = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading source file '{name}'"))?;
        files.push((name, source));
    }
    if files.is_empty() {
        bail!("no source file in {directory:?}");
    }
    files.sort();
    info!(files = ?files.iter().map(|(name, _)| name).collect::<Vec<_>>());
    Ok(files)
}

/// Collects and builds every submission found in the subdirectories of `directory`.
///
/// Submissions that cannot be read or compiled are logged and skipped. The result is sorted by
/// submission name, which is the subdirectory name.
#[instrument]
pub fn collect_submissions(directory: &Path) -> anyhow::Result<Vec<(String, CodeContainer)>> {
    if !directory.is_dir() {
        bail!("'{directory:?}' is not a valid directory");
    }

    let mut built = Vec::new();
    for entry in std::fs::read_dir(directory).with_context(|| format!("reading {directory:?}"))? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let container = collect_submission(&path)
            .and_then(|files| CodeContainer::from_sources(files).map_err(Into::into));
        match container {
            Ok(container) => built.push((name, container)),
            Err(e) => error!("submission '{name}' skipped: {e:#}"),
        }
    }
    built.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(built)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pawnbox-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn only_python_files_are_collected() {
        let dir = scratch("collect");
        fs::write(dir.join("bot.py"), "def turn():\n    pass\n").unwrap();
        fs::write(dir.join("helper.py"), "x = 1\n").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();
        fs::create_dir(dir.join("sub.py")).unwrap();
        let files = collect_submission(&dir).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bot.py", "helper.py"]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn broken_submissions_are_skipped() {
        let dir = scratch("submissions");
        fs::create_dir(dir.join("good")).unwrap();
        fs::write(dir.join("good/bot.py"), "def turn():\n    pass\n").unwrap();
        fs::create_dir(dir.join("bad")).unwrap();
        fs::write(dir.join("bad/bot.py"), "def turn(:\n").unwrap();
        let built = collect_submissions(&dir).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].0, "good");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(collect_submission(Path::new("/definitely/not/here")).is_err());
    }
}
