//! Recording sessions for passthrough spies.
//!
//! A session buffers each finalized `(invocation, response)` pair during
//! replay and serializes the buffer to disk when the controller verifies,
//! before the environment is torn down. Scrubbing and fixture replay are
//! the concern of the outer record mode, not this layer.

use std::io::Write;
use std::path::{Path, PathBuf};

use cmdmox_common::wire::{CommandResponse, Invocation};
use serde::Serialize;
use tempfile::NamedTempFile;

#[derive(Debug, Serialize)]
struct RecordedExchange {
    invocation: Invocation,
    response: CommandResponse,
}

#[derive(Debug)]
pub(crate) struct RecordingSession {
    path: PathBuf,
    exchanges: Vec<RecordedExchange>,
    finalized: bool,
}

impl RecordingSession {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exchanges: Vec::new(),
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, invocation: Invocation, response: CommandResponse) {
        self.exchanges.push(RecordedExchange {
            invocation,
            response,
        });
    }

    /// Write the buffered exchanges as pretty JSON. Idempotent.
    pub fn finalize(&mut self) -> std::io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        let rendered = serde_json::to_string_pretty(&self.exchanges)?;
        write_atomic(&self.path, &rendered)?;
        self.finalized = true;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.flush()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn finalize_writes_pretty_json_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures").join("echo.json");
        let mut session = RecordingSession::new(&path);

        let invocation = Invocation::new(
            "inv-1",
            "echo",
            vec!["hello".to_string()],
            String::new(),
            BTreeMap::new(),
        );
        session.append(invocation, CommandResponse::text("hello\n", "", 0));
        session.finalize().unwrap();
        session.finalize().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"command\": \"echo\""));
        assert!(contents.contains("\"stdout\": \"hello\\n\""));
    }

    #[test]
    fn empty_session_writes_an_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.json");
        RecordingSession::new(&path).finalize().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
    }
}
