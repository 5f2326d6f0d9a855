//! Portable bundle of one submission's instrumented modules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::bytecode::CodeUnit;
use crate::error::BuildError;
use crate::instrument::instrument;
use crate::lang::compile_module;

/// Module executed by [`RobotRunner::initialize`](crate::runtime::RobotRunner::initialize).
pub const ENTRY_MODULE: &str = "bot";

const ARTIFACT_FORMAT: u32 = 1;
const SOURCE_SUFFIX: &str = ".py";

#[derive(Serialize, Deserialize)]
struct Artifact {
    format: u32,
    modules: BTreeMap<String, CodeUnit>,
}

/// Module name to instrumented unit. Read-only once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeContainer {
    modules: BTreeMap<String, CodeUnit>,
}

impl CodeContainer {
    /// Compiles and instruments every `*.py` file of a submission.
    ///
    /// `files` yields `(file name, source)` pairs. The module name is the file name without
    /// its `.py` suffix; other files are ignored.
    ///
    /// # Errors
    /// Any syntax or reserved-name error, or a missing `bot.py`.
    #[instrument(skip_all)]
    pub fn from_sources<I, N, S>(files: I) -> Result<CodeContainer, BuildError>
    where
        I: IntoIterator<Item = (N, S)>,
        N: AsRef<str>,
        S: AsRef<str>,
    {
        let mut modules = BTreeMap::new();
        for (file_name, source) in files {
            let file_name = file_name.as_ref();
            let Some(module) = file_name.strip_suffix(SOURCE_SUFFIX) else {
                warn!(file_name, "ignoring non-source file");
                continue;
            };
            let raw = compile_module(module, source.as_ref())?;
            modules.insert(module.to_owned(), instrument(&raw)?);
        }
        if !modules.contains_key(ENTRY_MODULE) {
            return Err(BuildError::MissingEntry(ENTRY_MODULE.to_owned()));
        }
        debug!(modules = ?modules.keys().collect::<Vec<_>>(), "built container");
        Ok(CodeContainer { modules })
    }

    /// Serializes the container. Module order is stable, so equal containers give equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BuildError> {
        let artifact = Artifact {
            format: ARTIFACT_FORMAT,
            modules: self.modules.clone(),
        };
        serde_json::to_vec(&artifact).map_err(|e| BuildError::Artifact(e.to_string()))
    }

    /// Reads back an artifact produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    /// Malformed bytes, an unknown format, or any unit that was not instrumented.
    pub fn from_bytes(bytes: &[u8]) -> Result<CodeContainer, BuildError> {
        let artifact: Artifact =
            serde_json::from_slice(bytes).map_err(|e| BuildError::Artifact(e.to_string()))?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(BuildError::Artifact(format!(
                "unsupported format {}",
                artifact.format
            )));
        }
        if let Some((name, _)) = artifact
            .modules
            .iter()
            .find(|(_, unit)| !unit.fully_instrumented())
        {
            return Err(BuildError::NotInstrumented(name.clone()));
        }
        if !artifact.modules.contains_key(ENTRY_MODULE) {
            return Err(BuildError::MissingEntry(ENTRY_MODULE.to_owned()));
        }
        Ok(CodeContainer {
            modules: artifact.modules,
        })
    }

    pub fn get(&self, module: &str) -> Option<&CodeUnit> {
        self.modules.get(module)
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<(&'static str, &'static str)> {
        vec![
            ("bot.py", "import helper\ndef turn():\n    helper.go()\n"),
            ("helper.py", "def go():\n    return 1\n"),
            ("README.md", "# not code"),
        ]
    }

    #[test]
    fn builds_every_source_file() {
        let container = CodeContainer::from_sources(sources()).unwrap();
        assert_eq!(
            container.module_names().collect::<Vec<_>>(),
            vec!["bot", "helper"]
        );
        assert!(container.get("bot").unwrap().fully_instrumented());
    }

    #[test]
    fn bytes_roundtrip_and_are_stable() {
        let container = CodeContainer::from_sources(sources()).unwrap();
        let bytes = container.to_bytes().unwrap();
        assert_eq!(CodeContainer::from_bytes(&bytes).unwrap(), container);
        let again = CodeContainer::from_sources(sources()).unwrap();
        assert_eq!(again.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn entry_module_is_required() {
        assert_eq!(
            CodeContainer::from_sources([("helper.py", "x = 1\n")]),
            Err(BuildError::MissingEntry("bot".into()))
        );
    }

    #[test]
    fn uninstrumented_artifacts_are_rejected() {
        let raw = compile_module("bot", "x = 1\n").unwrap();
        let artifact = Artifact {
            format: ARTIFACT_FORMAT,
            modules: BTreeMap::from([("bot".to_owned(), raw)]),
        };
        let bytes = serde_json::to_vec(&artifact).unwrap();
        assert_eq!(
            CodeContainer::from_bytes(&bytes),
            Err(BuildError::NotInstrumented("bot".into()))
        );
    }

    #[test]
    fn garbage_is_not_an_artifact() {
        assert!(matches!(
            CodeContainer::from_bytes(b"{\"format\": 7, \"modules\": {}}"),
            Err(BuildError::Artifact(_))
        ));
        assert!(matches!(
            CodeContainer::from_bytes(b"\x00\x01"),
            Err(BuildError::Artifact(_))
        ));
    }

    #[test]
    fn compile_errors_name_the_module() {
        let err = CodeContainer::from_sources([("bot.py", "x = (\n")]).unwrap_err();
        assert!(matches!(err, BuildError::Syntax { file, .. } if file == "bot"));
    }
}
