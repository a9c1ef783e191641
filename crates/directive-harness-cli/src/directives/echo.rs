use directive_harness_contract::{Directive, RunContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EchoInput {
    pub query: String,
    /// Free-form caller metadata. Part of the idempotency key and echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EchoOutput {
    pub echoed: String,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Side-effect free directive that returns its query.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDirective;

impl Directive for EchoDirective {
    type Input = EchoInput;
    type Output = EchoOutput;

    fn directive_id(&self) -> &str {
        "echo"
    }

    fn directive_version(&self) -> &str {
        "1.0.0"
    }

    fn execute(&self, input: EchoInput, ctx: &mut RunContext<'_>) -> anyhow::Result<EchoOutput> {
        tracing::debug!(run_id = %ctx.run_id(), "echoing query");
        let length = input.query.chars().count();
        ctx.record_metric("query_chars", json!(length));
        Ok(EchoOutput {
            echoed: input.query,
            length,
            context: input.context,
        })
    }
}
