//! Handlers shipped with the engine.
//!
//! | name         | parameters                          | result                              |
//! |--------------|-------------------------------------|-------------------------------------|
//! | `echo`       | anything                            | the parameters, unchanged           |
//! | `sleep`      | `duration_ms`                       | `slept_ms`                          |
//! | `file.read`  | `path`                              | `content`                           |
//! | `file.write` | `path`, `content`                   | `bytes`                             |
//! | `command`    | `program`, `args?`, `stdin?`        | `stdout`, `stderr`, `exit_code`     |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use cadence_types::{ContractField, FieldType, HandlerDescriptor};
use serde_json::{Value, json};
use tracing::warn;

use super::process::{describe_exit, run_process};
use super::{Handler, HandlerParams, HandlerRegistry};

/// Register (or re-register) every built-in handler.
pub fn register_builtins(registry: &HandlerRegistry) {
    let builtins: [(HandlerDescriptor, Arc<dyn Handler>); 5] = [
        (
            HandlerDescriptor::builtin("echo", vec![], vec![]).with_description("Return the parameters unchanged"),
            Arc::new(EchoHandler),
        ),
        (
            HandlerDescriptor::builtin(
                "sleep",
                vec![ContractField::required("duration_ms", FieldType::Integer)],
                vec![ContractField::required("slept_ms", FieldType::Integer)],
            )
            .with_description("Wait for the given number of milliseconds"),
            Arc::new(SleepHandler),
        ),
        (
            HandlerDescriptor::builtin(
                "file.read",
                vec![ContractField::required("path", FieldType::String)],
                vec![ContractField::required("content", FieldType::String)],
            )
            .with_description("Read a UTF-8 text file"),
            Arc::new(FileReadHandler),
        ),
        (
            HandlerDescriptor::builtin(
                "file.write",
                vec![
                    ContractField::required("path", FieldType::String),
                    ContractField::required("content", FieldType::Any),
                ],
                vec![ContractField::required("bytes", FieldType::Integer)],
            )
            .with_description("Write text (or JSON) to a file, replacing it"),
            Arc::new(FileWriteHandler),
        ),
        (
            HandlerDescriptor::builtin(
                "command",
                vec![
                    ContractField::required("program", FieldType::String),
                    ContractField::optional("args", FieldType::Array),
                    ContractField::optional("stdin", FieldType::String),
                ],
                vec![
                    ContractField::required("stdout", FieldType::String),
                    ContractField::required("stderr", FieldType::String),
                    ContractField::required("exit_code", FieldType::Integer),
                ],
            )
            .with_description("Run a program; a non-zero exit fails the step"),
            Arc::new(CommandHandler),
        ),
    ];

    for (descriptor, handler) in builtins {
        let name = descriptor.name.clone();
        if let Err(error) = registry.register(descriptor, handler, true) {
            warn!(handler = %name, error = %error, "failed to register built-in handler");
        }
    }
}

fn required_str<'a>(params: &'a HandlerParams, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .ok_or_else(|| anyhow!("missing required parameter '{key}'"))?
        .as_str()
        .ok_or_else(|| anyhow!("parameter '{key}' must be a string"))
}

fn result_map(value: Value) -> HandlerParams {
    match value {
        Value::Object(map) => map,
        _ => HandlerParams::new(),
    }
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        Ok(params)
    }
}

struct SleepHandler;

#[async_trait]
impl Handler for SleepHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        let duration_ms = params
            .get("duration_ms")
            .ok_or_else(|| anyhow!("missing required parameter 'duration_ms'"))?
            .as_u64()
            .ok_or_else(|| anyhow!("parameter 'duration_ms' must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(result_map(json!({ "slept_ms": duration_ms })))
    }
}

struct FileReadHandler;

#[async_trait]
impl Handler for FileReadHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        let path = required_str(&params, "path")?;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {path}"))?;
        Ok(result_map(json!({ "content": content })))
    }
}

struct FileWriteHandler;

#[async_trait]
impl Handler for FileWriteHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        let path = required_str(&params, "path")?;
        let content = match params.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string_pretty(other).context("failed to encode content")?,
            None => bail!("missing required parameter 'content'"),
        };
        tokio::fs::write(path, content.as_bytes())
            .await
            .with_context(|| format!("failed to write {path}"))?;
        Ok(result_map(json!({ "bytes": content.len() })))
    }
}

struct CommandHandler;

#[async_trait]
impl Handler for CommandHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        let program = required_str(&params, "program")?;
        let args = match params.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(_) => bail!("parameter 'args' must be a list"),
        };
        let stdin = match params.get("stdin") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.as_str()),
            Some(_) => bail!("parameter 'stdin' must be a string"),
        };

        let output = run_process(program, &args, stdin).await?;
        if !output.success() {
            bail!("'{program}' exited with {}: {}", describe_exit(output.exit_code), output.stderr.trim());
        }
        Ok(result_map(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code.unwrap_or_default(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(value: Value) -> HandlerParams {
        result_map(value)
    }

    #[tokio::test]
    async fn file_write_then_read_round_trips_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("note.txt");
        let path_text = path.to_string_lossy().to_string();

        let written = FileWriteHandler
            .invoke(params(json!({ "path": path_text, "content": "hello" })))
            .await
            .expect("write");
        assert_eq!(written["bytes"], json!(5));

        let read = FileReadHandler.invoke(params(json!({ "path": path_text }))).await.expect("read");
        assert_eq!(read["content"], json!("hello"));
    }

    #[tokio::test]
    async fn file_read_reports_missing_path_parameter() {
        let error = FileReadHandler.invoke(HandlerParams::new()).await.expect_err("missing path");
        assert!(error.to_string().contains("'path'"));
    }

    #[tokio::test]
    async fn sleep_rejects_negative_durations() {
        let error = SleepHandler
            .invoke(params(json!({ "duration_ms": -5 })))
            .await
            .expect_err("negative");
        assert!(error.to_string().contains("non-negative"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_captures_output_and_fails_on_non_zero_exit() {
        let ok = CommandHandler
            .invoke(params(json!({ "program": "sh", "args": ["-c", "cat; echo done"], "stdin": "in:" })))
            .await
            .expect("command");
        assert_eq!(ok["stdout"], json!("in:done\n"));
        assert_eq!(ok["exit_code"], json!(0));

        let error = CommandHandler
            .invoke(params(json!({ "program": "sh", "args": ["-c", "echo oops >&2; exit 2"] })))
            .await
            .expect_err("non-zero exit");
        assert!(error.to_string().contains("status 2"));
        assert!(error.to_string().contains("oops"));
    }
}
