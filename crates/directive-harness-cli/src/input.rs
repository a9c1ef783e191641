use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use directive_harness_contract::ShapeError;
use serde_json::Value;

/// Load the raw payload from `--input`, `--input-file`, or stdin, in that order.
pub fn read_raw_input(
    inline: Option<&str>,
    file: Option<&Path>,
    stdin: &mut impl Read,
) -> Result<Value> {
    let body = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?,
        (None, None) => {
            let mut buffer = String::new();
            stdin
                .read_to_string(&mut buffer)
                .context("failed to read input from stdin")?;
            buffer
        }
    };

    if body.trim().is_empty() {
        return Err(ShapeError::Input("no input payload supplied".to_string()).into());
    }
    serde_json::from_str(&body).context("input is not valid JSON")
}
