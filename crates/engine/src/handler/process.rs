//! Subprocess execution shared by the `command` built-in, generated
//! capabilities, and the subprocess-backed collaborators.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use cadence_types::ContractField;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Handler, HandlerParams};

/// Captured outcome of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `program` with `args`, feeding `stdin` when given, and capture its output.
///
/// The child is killed if the returned future is dropped, so an enclosing
/// timeout reclaims the process.
pub async fn run_process(program: &str, args: &[String], stdin: Option<&str>) -> Result<ProcessOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program, args = ?args, "spawning process");
    let mut child = command.spawn().with_context(|| format!("failed to spawn '{program}'"))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(tokio::spawn(async move {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await
            }))
        }
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for '{program}'"))?;

    if let Some(writer) = writer
        && let Ok(Err(error)) = writer.await
    {
        // Programs may exit without draining stdin.
        debug!(program = %program, error = %error, "stdin was not fully consumed");
    }

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

/// Handler backed by an external program speaking JSON.
///
/// Parameters are written to stdin as one JSON object; the program must exit
/// zero and print a JSON object, which becomes the result mapping. When a
/// return contract is set, the result must carry every required field and
/// every declared field must have its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandler {
    program: String,
    args: Vec<String>,
    returns: Vec<ContractField>,
}

impl ProcessHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            returns: Vec::new(),
        }
    }

    /// Check results against `returns`.
    pub fn with_returns(mut self, returns: Vec<ContractField>) -> Self {
        self.returns = returns;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn invoke(&self, params: HandlerParams) -> Result<HandlerParams> {
        let input = serde_json::to_string(&Value::Object(params)).context("failed to encode parameters")?;
        let output = run_process(&self.program, &self.args, Some(&input)).await?;
        if !output.success() {
            bail!(
                "'{}' exited with {}: {}",
                self.program,
                describe_exit(output.exit_code),
                output.stderr.trim()
            );
        }
        let result =
            parse_json_object(&output.stdout).with_context(|| format!("'{}' did not print a JSON object", self.program))?;
        check_result_contract(&self.program, &self.returns, &result)?;
        Ok(result)
    }
}

fn check_result_contract(program: &str, returns: &[ContractField], result: &HandlerParams) -> Result<()> {
    for field in returns {
        match result.get(&field.name) {
            None if field.required => bail!("'{program}' did not return required field '{}'", field.name),
            Some(value) if !field.field_type.matches(value) => {
                bail!("'{program}' returned field '{}' that is not of type {}", field.name, field.field_type)
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse the trimmed `text` as a JSON object.
pub(crate) fn parse_json_object(text: &str) -> Result<HandlerParams> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, found {other}"),
    }
}

pub(crate) fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
