//! Collaborators backed by external programs.
//!
//! Both speak JSON over stdio: the planner reads the intent text on stdin and
//! prints a workflow object; the generator reads the capability request as
//! JSON and prints a command capability description.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use cadence_types::{CapabilitySpec, CommandSpec, ContractField, WorkflowDefinition};
use serde::Deserialize;
use tracing::debug;

use super::{CapabilityGenerator, IntentPlanner};
use crate::gateway::CapabilityImplementation;
use crate::handler::process::{ProcessOutput, describe_exit, run_process};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlanner {
    program: String,
    args: Vec<String>,
}

impl CommandPlanner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line such as `planner --model small`.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = cadence_util::split_command_line(command_line).into_iter();
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl IntentPlanner for CommandPlanner {
    async fn plan(&self, intent: &str) -> Result<WorkflowDefinition> {
        let output = run_process(&self.program, &self.args, Some(intent)).await?;
        ensure_success(&self.program, &output)?;
        debug!(program = %self.program, bytes = output.stdout.len(), "planner produced output");
        serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("planner '{}' did not print a workflow object", self.program))
    }
}

/// Shape printed by a generator program.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratedCommand {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    parameters: Vec<ContractField>,
    #[serde(default)]
    returns: Vec<ContractField>,
    #[serde(default)]
    concurrency_safe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = cadence_util::split_command_line(command_line).into_iter();
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl CapabilityGenerator for CommandGenerator {
    async fn generate(&self, spec: &CapabilitySpec) -> Result<CapabilityImplementation> {
        let request = serde_json::to_string(spec).context("failed to encode capability request")?;
        let output = run_process(&self.program, &self.args, Some(&request)).await?;
        ensure_success(&self.program, &output)?;

        let generated: GeneratedCommand = serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("generator '{}' did not print a command capability", self.program))?;
        debug!(capability = %spec.name, program = %generated.program, "generator produced a command capability");

        Ok(CapabilityImplementation::from_command(
            CommandSpec {
                program: generated.program,
                args: generated.args,
            },
            generated.parameters,
            generated.returns,
            generated.concurrency_safe,
        ))
    }
}

fn ensure_success(program: &str, output: &ProcessOutput) -> Result<()> {
    if !output.success() {
        bail!("'{program}' exited with {}: {}", describe_exit(output.exit_code), output.stderr.trim());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use cadence_types::FieldType;

    fn script(body: &str) -> Vec<String> {
        vec!["-c".into(), body.into()]
    }

    #[tokio::test]
    async fn planner_parses_the_printed_workflow() {
        let planner = CommandPlanner::new(
            "sh",
            script(r#"read -r intent; printf '{"steps":[{"step_id":"say","handler":"echo","params":{"text":"%s"}}]}' "$intent""#),
        );
        let workflow = planner.plan("hello there\n").await.expect("plan");
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].params["text"], "hello there");
    }

    #[tokio::test]
    async fn planner_failure_carries_stderr() {
        let planner = CommandPlanner::new("sh", script("echo 'no idea' >&2; exit 1"));
        let error = planner.plan("do something").await.expect_err("failure");
        assert!(format!("{error:#}").contains("no idea"));
    }

    #[tokio::test]
    async fn generator_output_becomes_a_process_capability() {
        let generator = CommandGenerator::new(
            "sh",
            script(
                r#"cat >/dev/null; echo '{"program":"cat","parameters":[{"name":"title","type":"string"}],"returns":[{"name":"title","type":"string"}]}'"#,
            ),
        );
        let spec = CapabilitySpec {
            name: "mirror".into(),
            description: "Return the title".into(),
            parameters: vec![ContractField::required("title", FieldType::String)],
            returns: vec![ContractField::required("title", FieldType::String)],
            guidance: None,
        };

        let implementation = generator.generate(&spec).await.expect("generate");
        assert!(!implementation.concurrency_safe);
        assert_eq!(implementation.command.as_ref().map(|command| command.program.as_str()), Some("cat"));
        assert_eq!(implementation.parameters, spec.parameters);

        let mut params = serde_json::Map::new();
        params.insert("title".into(), "Release notes".into());
        let result = implementation.handler.invoke(params.clone()).await.expect("invoke");
        assert_eq!(result, params);
    }

    #[test]
    fn command_lines_are_split_into_program_and_args() {
        let planner = CommandPlanner::from_command_line("planner --model 'small one'").expect("planner");
        assert_eq!(planner, CommandPlanner::new("planner", vec!["--model".into(), "small one".into()]));
        assert!(CommandGenerator::from_command_line("   ").is_none());
    }
}
