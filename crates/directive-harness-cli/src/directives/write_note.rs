use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use directive_harness_contract::{Directive, RunContext, ShapeError};
use directive_harness_domain::ensure_non_empty;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct WriteNoteInput {
    pub path: PathBuf,
    pub contents: String,
    /// Append instead of replacing the file.
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct WriteNoteOutput {
    pub path: PathBuf,
    pub bytes_written: usize,
}

/// Writes a note to disk. Re-running identical input is skipped by the ledger,
/// so an append happens once per distinct payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteNoteDirective;

impl Directive for WriteNoteDirective {
    type Input = WriteNoteInput;
    type Output = WriteNoteOutput;

    fn directive_id(&self) -> &str {
        "write-note"
    }

    fn directive_version(&self) -> &str {
        "1.0.0"
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn validate(&self, raw: &Value) -> Result<WriteNoteInput, ShapeError> {
        let input: WriteNoteInput =
            serde_json::from_value(raw.clone()).map_err(|err| ShapeError::Input(err.to_string()))?;
        ensure_non_empty("path", &input.path.to_string_lossy())
            .map_err(|err| ShapeError::Input(err.to_string()))?;
        Ok(input)
    }

    fn plan(&self, input: &WriteNoteInput) -> Value {
        json!({
            "action": if input.append { "append_file" } else { "write_file" },
            "path": input.path,
            "bytes": input.contents.len(),
        })
    }

    fn execute(
        &self,
        input: WriteNoteInput,
        ctx: &mut RunContext<'_>,
    ) -> anyhow::Result<WriteNoteOutput> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(input.append)
            .truncate(!input.append)
            .open(&input.path)
            .with_context(|| format!("failed to open note {}", input.path.display()))?;
        file.write_all(input.contents.as_bytes())
            .with_context(|| format!("failed to write note {}", input.path.display()))?;

        ctx.attach_artifact("path", json!(input.path));
        tracing::info!(run_id = %ctx.run_id(), path = %input.path.display(), "note written");
        Ok(WriteNoteOutput {
            path: input.path,
            bytes_written: input.contents.len(),
        })
    }
}
