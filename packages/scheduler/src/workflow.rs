//! Workflow-runtime client.
//!
//! The runtime executes attempts; the scheduler only submits them and reads
//! back the outcome. The client is deliberately thin: one newline-delimited
//! JSON request and one response per submission over TCP. The workflow
//! identity is deterministic per `(job, attempt)` so resubmissions are
//! idempotent at the runtime layer.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::models::{AttemptOutput, JobConfig};

/// Deterministic workflow identity for an attempt.
pub fn workflow_identity(scope: &str, job_id: i64, attempt_number: i32) -> String {
    format!("connection-{scope}-{job_id}-{attempt_number}")
}

/// Everything the runtime needs to execute one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptInput {
    pub job_id: i64,
    pub attempt_number: i32,
    pub scope: String,
    pub workspace_path: String,
    pub config: JobConfig,
}

/// Terminal result of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum AttemptOutcome {
    Succeeded { output: AttemptOutput },
    Failed { reason: String },
}

/// Capability the submitter depends on; tests substitute an in-process
/// implementation.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn submit(&self, identity: &str, input: AttemptInput) -> Result<AttemptOutcome>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowRequest<'a> {
    identity: &'a str,
    input: &'a AttemptInput,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowResponse {
    outcome: AttemptOutcome,
}

/// TCP stub over the external workflow runtime.
pub struct RuntimeWorkflowClient {
    /// `host:port`, default port 7233.
    host: String,
}

impl RuntimeWorkflowClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl WorkflowClient for RuntimeWorkflowClient {
    async fn submit(&self, identity: &str, input: AttemptInput) -> Result<AttemptOutcome> {
        debug!(identity, host = %self.host, "submitting workflow");

        let stream = TcpStream::connect(&self.host)
            .await
            .with_context(|| format!("failed to reach workflow runtime at {}", self.host))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut request = serde_json::to_vec(&WorkflowRequest { identity, input: &input })?;
        request.push(b'\n');
        write_half
            .write_all(&request)
            .await
            .context("failed to send workflow request")?;
        write_half.shutdown().await.ok();

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .context("failed to read workflow response")?;
        let response: WorkflowResponse = serde_json::from_str(line.trim())
            .with_context(|| format!("malformed workflow response for {identity}"))?;

        Ok(response.outcome)
    }
}

/// Test client returning scripted outcomes and recording every identity it
/// was asked to run.
#[derive(Default)]
pub struct ScriptedWorkflowClient {
    outcomes: Mutex<VecDeque<AttemptOutcome>>,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedWorkflowClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next submission.
    pub fn push_outcome(&self, outcome: AttemptOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Identities submitted so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowClient for ScriptedWorkflowClient {
    async fn submit(&self, identity: &str, _input: AttemptInput) -> Result<AttemptOutcome> {
        self.submitted.lock().unwrap().push(identity.to_string());
        let outcome = self.outcomes.lock().unwrap().pop_front();
        Ok(outcome.unwrap_or(AttemptOutcome::Failed {
            reason: "no scripted outcome".to_string(),
        }))
    }
}
