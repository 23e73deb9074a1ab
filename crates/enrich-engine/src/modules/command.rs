use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use enrich_types::{AttributeId, EnrichError, Result, StepOutcome};

use crate::module::{settings_mismatch, ModuleKind, ModuleSettings, PipelineModule, StepContext};

// ---------------------------------------------------------------------------
// CommandModule — delegates to an external shell command (processor)
// ---------------------------------------------------------------------------

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub command: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub struct CommandModule;

/// Structured reply a command may print instead of a bare value.
#[derive(Debug, Deserialize)]
struct CommandReply {
    value: serde_json::Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    justification: Option<String>,
    #[serde(default)]
    meta: serde_json::Map<String, serde_json::Value>,
}

/// Turn command stdout into an outcome.
fn parse_stdout(stdout: &str) -> StepOutcome {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return StepOutcome::skipped("command produced no output");
    }
    let parsed: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return StepOutcome::ok(serde_json::Value::String(trimmed.to_string())),
    };
    let is_reply = parsed
        .as_object()
        .is_some_and(|obj| obj.contains_key("value"));
    if !is_reply {
        return StepOutcome::ok(parsed);
    }
    match serde_json::from_value::<CommandReply>(parsed) {
        Ok(reply) => {
            let mut outcome = StepOutcome::ok(reply.value);
            outcome.confidence = reply.confidence;
            outcome.justification = reply.justification;
            outcome.meta = reply.meta;
            outcome
        }
        Err(e) => StepOutcome::error(format!("malformed command reply: {e}")),
    }
}

/// Cut long output at a UTF-8 boundary.
fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}

impl CommandModule {
    fn settings<'a>(&self, settings: &'a ModuleSettings) -> Result<&'a CommandSettings> {
        match settings {
            ModuleSettings::Command(s) => Ok(s),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }
}

#[async_trait]
impl PipelineModule for CommandModule {
    fn module_type(&self) -> &str {
        "command"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Processor
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let s = self.settings(settings)?;
        if s.command.trim().is_empty() {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "command is empty".into(),
            });
        }
        if s.timeout_ms == 0 {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "timeout_ms must be positive".into(),
            });
        }
        Ok(())
    }

    fn input_attributes(&self, _settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        BTreeSet::new()
    }

    async fn process(&self, context: &StepContext) -> Result<StepOutcome> {
        let s = self.settings(context.settings())?;
        tracing::info!(entity = %context.entity_id(), command = %s.command, "Executing command processor");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&s.command);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(StepOutcome::error(format!("failed to spawn command: {e}"))),
        };

        let payload = serde_json::to_vec(&context.to_json())?;
        let interaction = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // Commands that ignore stdin may close it early.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %e, "Command did not read its input");
                }
            }
            child.wait_with_output().await
        };

        let timeout = Duration::from_millis(s.timeout_ms);
        let output = match tokio::time::timeout(timeout, interaction).await {
            Err(_) => {
                let err = EnrichError::StepTimeout {
                    module: self.module_type().to_string(),
                    timeout_ms: s.timeout_ms,
                };
                return Ok(StepOutcome::error(err.to_string()));
            }
            Ok(Err(e)) => return Ok(StepOutcome::error(format!("command execution failed: {e}"))),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::debug!(
            entity = %context.entity_id(),
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command completed"
        );

        if !output.status.success() {
            let mut message = format!("command exited with code {exit_code}");
            if !stderr.trim().is_empty() {
                message.push_str(": ");
                message.push_str(&truncate(stderr.trim(), 1024));
            }
            return Ok(StepOutcome::error(message));
        }

        Ok(parse_stdout(&stdout))
    }
}
