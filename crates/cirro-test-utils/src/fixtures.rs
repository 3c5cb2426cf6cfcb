//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired-up test context and a builder for job descriptions with
//! sensible defaults.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cirro_core::location::LocationResolver;
use cirro_flow::attempt::CallAttempt;
use cirro_flow::backoff::BackoffPolicy;
use cirro_flow::compute::ComputeClient;
use cirro_flow::config::BackendConfig;
use cirro_flow::io_plan::{InputDeclaration, OutputDeclaration, detritus};
use cirro_flow::job::{AttemptBackend, JobAttempt, JobDescription};
use cirro_flow::ledger::RetryLedger;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::compute::ScriptedComputeClient;
use crate::ledger::RecordingKeyValueStore;
use crate::storage::{CountingMetadataSource, TracingMemoryBackend};

/// Bucket holding call roots in tests.
pub const TEST_BUCKET: &str = "cirro-test";

/// Project billed for requester-pays buckets in tests.
pub const TEST_BILLING_PROJECT: &str = "test-billing";

/// Backend configuration with short backoffs and few transient retries.
#[must_use]
pub fn fast_config() -> BackendConfig {
    BackendConfig::default()
        .with_project_id("test-project")
        .with_poll_backoff(BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
        ))
        .with_submit_backoff(BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        ))
        .with_max_transient_retries(3)
}

/// Test context with pre-configured collaborators.
pub struct TestContext {
    /// Object storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Bucket metadata source.
    pub metadata: Arc<CountingMetadataSource>,
    /// Location resolver over `storage` and `metadata`.
    pub resolver: Arc<LocationResolver>,
    /// Retry ledger store.
    pub store: Arc<RecordingKeyValueStore>,
    /// Compute client.
    pub compute: Arc<ScriptedComputeClient>,
    /// Backend configuration.
    pub config: BackendConfig,
    /// Workflow every description belongs to.
    pub workflow_id: Uuid,
}

impl TestContext {
    /// Creates a new test context with a unique workflow id.
    #[must_use]
    pub fn new() -> Self {
        let storage = Arc::new(TracingMemoryBackend::new());
        let metadata = Arc::new(CountingMetadataSource::new());
        let resolver = Arc::new(
            LocationResolver::new(storage.clone(), metadata.clone())
                .with_billing_project(TEST_BILLING_PROJECT),
        );
        Self {
            storage,
            metadata,
            resolver,
            store: Arc::new(RecordingKeyValueStore::new()),
            compute: Arc::new(ScriptedComputeClient::new()),
            config: fast_config(),
            workflow_id: Uuid::new_v4(),
        }
    }

    /// Replaces the backend configuration.
    #[must_use]
    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared attempt collaborators.
    #[must_use]
    pub fn backend(&self) -> AttemptBackend {
        let compute: Arc<dyn ComputeClient> = self.compute.clone();
        AttemptBackend::new(
            compute,
            RetryLedger::new(self.store.clone()),
            self.resolver.clone(),
            self.config.clone(),
        )
    }

    /// Creates an attempt for `description`.
    #[must_use]
    pub fn attempt(&self, description: JobDescription) -> JobAttempt {
        JobAttempt::new(description, self.backend())
    }

    /// Starts a description for the first attempt of `call`.
    #[must_use]
    pub fn description(&self, call: &str) -> JobDescriptionBuilder {
        JobDescriptionBuilder::new(CallAttempt::new(self.workflow_id, call))
    }

    /// Writes the return-code file of `description`.
    pub async fn write_return_code(&self, description: &JobDescription, return_code: i32) {
        self.storage
            .seed(
                &format!("{}/{}", description.call_root, detritus::RETURN_CODE),
                format!("{return_code}\n"),
            )
            .await;
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Call root used for `attempt` in tests.
#[must_use]
pub fn call_root(attempt: &CallAttempt) -> String {
    let shard = attempt
        .shard_index
        .map(|s| format!("/shard-{s}"))
        .unwrap_or_default();
    format!(
        "gs://{TEST_BUCKET}/{}/call-{}{shard}/attempt-{}",
        attempt.workflow_id, attempt.call, attempt.attempt
    )
}

/// Builder for [`JobDescription`]s.
#[derive(Debug, Clone)]
pub struct JobDescriptionBuilder {
    attempt: CallAttempt,
    call_root: Option<String>,
    runtime: BTreeMap<String, Value>,
    inputs: Vec<InputDeclaration>,
    outputs: Vec<OutputDeclaration>,
    script: String,
}

impl JobDescriptionBuilder {
    /// Starts a description running `echo hello` in `ubuntu:22.04`.
    #[must_use]
    pub fn new(attempt: CallAttempt) -> Self {
        Self {
            attempt,
            call_root: None,
            runtime: BTreeMap::from([("docker".to_string(), json!("ubuntu:22.04"))]),
            inputs: Vec::new(),
            outputs: Vec::new(),
            script: "#!/bin/bash\necho hello\n".to_string(),
        }
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn attempt_number(mut self, attempt: u32) -> Self {
        self.attempt = self.attempt.with_attempt(attempt);
        self
    }

    /// Sets the shard index.
    #[must_use]
    pub fn shard(mut self, shard: u32) -> Self {
        self.attempt = self.attempt.with_shard(shard);
        self
    }

    /// Overrides the call root.
    #[must_use]
    pub fn call_root(mut self, call_root: impl Into<String>) -> Self {
        self.call_root = Some(call_root.into());
        self
    }

    /// Sets a runtime declaration.
    #[must_use]
    pub fn runtime(mut self, name: &str, value: Value) -> Self {
        self.runtime.insert(name.to_string(), value);
        self
    }

    /// Removes a runtime declaration.
    #[must_use]
    pub fn without_runtime(mut self, name: &str) -> Self {
        self.runtime.remove(name);
        self
    }

    /// Sets the preemptible attempt ceiling.
    #[must_use]
    pub fn preemptible(self, ceiling: u32) -> Self {
        self.runtime("preemptible", json!(ceiling))
    }

    /// Adds an input.
    #[must_use]
    pub fn input(mut self, input: InputDeclaration) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds an output.
    #[must_use]
    pub fn output(mut self, output: OutputDeclaration) -> Self {
        self.outputs.push(output);
        self
    }

    /// Sets the command script.
    #[must_use]
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Builds the description.
    #[must_use]
    pub fn build(self) -> JobDescription {
        let call_root = self.call_root.unwrap_or_else(|| call_root(&self.attempt));
        JobDescription {
            attempt: self.attempt,
            call_root,
            runtime: self.runtime,
            inputs: self.inputs,
            outputs: self.outputs,
            script: self.script,
        }
    }
}
