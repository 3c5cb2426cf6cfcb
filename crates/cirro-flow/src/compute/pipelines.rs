//! Google Pipelines API compute client.
//!
//! [`PipelinesClient`] implements [`ComputeClient`] against the Pipelines
//! API (`v2alpha1`). A [`RunRequest`] becomes one pipeline:
//!
//! - one copy action per input parameter,
//! - background actions for the monitoring script and periodic log uploads,
//! - the user action, which records stdout, stderr and the return code on
//!   the working disk,
//! - one always-run copy action per output parameter.
//!
//! Finished operations are classified from their error status. The error
//! message carries the sub-code as a `NN:` prefix.
//!
//! This module is only compiled when the `gcp` feature is enabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ComputeClient, ErrorCode, ExecutionEvent, MachineInfo, RunHandle, RunRequest, RunStatus,
    sub_codes,
};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::io_plan::{IoParameter, detritus};
use crate::runtime::DiskType;

const SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];
const VM_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/devstorage.read_write",
];

const FLAG_ALWAYS_RUN: &str = "ALWAYS_RUN";
const FLAG_RUN_IN_BACKGROUND: &str = "RUN_IN_BACKGROUND";
const FLAG_IGNORE_EXIT_STATUS: &str = "IGNORE_EXIT_STATUS";

/// Settings the client needs from [`BackendConfig`].
#[derive(Debug, Clone)]
struct PipelineSettings {
    endpoint: String,
    project_id: String,
    localization_image: String,
}

/// Pipelines API compute client.
pub struct PipelinesClient {
    settings: PipelineSettings,
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

// TokenProvider doesn't implement Debug
impl std::fmt::Debug for PipelinesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinesClient")
            .field("settings", &self.settings)
            .field("token_provider", &"<TokenProvider>")
            .field("client", &self.client)
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunPipelineRequest {
    pipeline: Pipeline,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pipeline {
    actions: Vec<Action>,
    resources: Resources,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Action {
    image_uri: String,
    commands: Vec<String>,
    mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    flags: Vec<&'static str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Mount {
    disk: String,
    path: String,
    read_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Resources {
    project_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    zones: Vec<String>,
    virtual_machine: VirtualMachine,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    machine_type: String,
    preemptible: bool,
    labels: BTreeMap<String, String>,
    disks: Vec<Disk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account: Option<ServiceAccount>,
    boot_disk_size_gb: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Disk {
    name: String,
    size_gb: u32,
    #[serde(rename = "type")]
    disk_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccount {
    email: String,
    scopes: Vec<&'static str>,
}

/// Long-running operation resource.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    pipeline: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Event {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: Option<Value>,
}

impl Event {
    fn detail_type(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("@type"))
            .and_then(Value::as_str)
    }

    fn detail_str(&self, field: &str) -> Option<String> {
        self.details
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// API error response.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    status: String,
}

async fn api_error(context: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());

    let message = serde_json::from_str::<ErrorResponse>(&body).map_or_else(
        |_| format!("{context}: {status} - {body}"),
        |parsed| {
            format!(
                "{context}: {} ({})",
                parsed.error.message, parsed.error.status
            )
        },
    );

    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::transient(message)
    } else {
        Error::backend(message)
    }
}

impl PipelinesClient {
    /// Creates a client from the backend configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `project_id` is not configured
    /// - GCP authentication cannot be initialized
    pub async fn new(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| Error::configuration("project_id is required for the Pipelines API"))?;

        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::configuration(format!("Failed to initialize GCP auth: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            settings: PipelineSettings {
                endpoint: config.compute_endpoint.trim_end_matches('/').to_string(),
                project_id,
                localization_image: config.localization_image.clone(),
            },
            token_provider,
            client,
        })
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(SCOPES)
            .await
            .map_err(|e| Error::transient(format!("Failed to get GCP access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        request.bearer_auth(token).send().await.map_err(|e| {
            if e.is_builder() {
                Error::backend(format!("invalid Pipelines API request: {e}"))
            } else {
                Error::transient(format!("Pipelines API request failed: {e}"))
            }
        })
    }
}

#[async_trait]
impl ComputeClient for PipelinesClient {
    #[tracing::instrument(skip_all, fields(attempt = %request.attempt))]
    async fn submit(&self, request: &RunRequest) -> Result<RunHandle> {
        let body = pipeline_request(request, &self.settings);
        let url = format!("{}/pipelines:run", self.settings.endpoint);

        let response = self.send(self.client.post(&url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(api_error("Pipelines API run error", response).await);
        }
        let operation: Operation = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid operation response: {e}")))?;

        tracing::info!(operation = %operation.name, "pipeline submitted");
        Ok(RunHandle::new(operation.name))
    }

    async fn status(&self, handle: &RunHandle) -> Result<RunStatus> {
        let url = format!("{}/{}", self.settings.endpoint, handle.as_str());
        let response = self.send(self.client.get(&url)).await?;
        if !response.status().is_success() {
            return Err(api_error("Pipelines API status error", response).await);
        }
        let operation: Operation = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid operation response: {e}")))?;
        Ok(run_status(operation))
    }

    #[tracing::instrument(skip(self), fields(handle = %handle))]
    async fn abort(&self, handle: &RunHandle) -> Result<()> {
        let url = format!("{}/{}:cancel", self.settings.endpoint, handle.as_str());
        let response = self
            .send(self.client.post(&url).json(&serde_json::json!({})))
            .await?;
        if !response.status().is_success() {
            return Err(api_error("Pipelines API cancel error", response).await);
        }
        Ok(())
    }
}

/// Quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn machine_type(cpu: u32, memory_mb: u64) -> String {
    // Custom machine memory must be a multiple of 256 MB.
    let memory = memory_mb.div_ceil(256).max(1) * 256;
    format!("custom-{cpu}-{memory}")
}

const fn disk_type(disk_type: DiskType) -> &'static str {
    match disk_type {
        DiskType::Ssd => "pd-ssd",
        DiskType::Hdd => "pd-standard",
    }
}

struct ActionBuilder<'a> {
    request: &'a RunRequest,
    settings: &'a PipelineSettings,
    mounts: HashMap<&'a str, &'a str>,
}

impl<'a> ActionBuilder<'a> {
    fn new(request: &'a RunRequest, settings: &'a PipelineSettings) -> Self {
        let mounts = request
            .disks
            .iter()
            .map(|d| (d.name.as_str(), d.mount_point.as_str()))
            .collect();
        Self {
            request,
            settings,
            mounts,
        }
    }

    fn mounts(&self) -> Vec<Mount> {
        self.request
            .disks
            .iter()
            .map(|d| Mount {
                disk: d.name.clone(),
                path: d.mount_point.clone(),
                read_only: false,
            })
            .collect()
    }

    fn local(&self, parameter: &IoParameter) -> String {
        let mount = self
            .mounts
            .get(parameter.disk.as_str())
            .copied()
            .unwrap_or("/");
        format!("{}/{}", mount.trim_end_matches('/'), parameter.local_path)
    }

    fn working_local(&self, name: &str, fallback: &str) -> String {
        self.request
            .outputs
            .iter()
            .find(|p| p.name == name)
            .map_or_else(
                || {
                    let mount = self
                        .request
                        .disks
                        .iter()
                        .find(|d| d.is_working_disk())
                        .map_or("/", |d| d.mount_point.as_str());
                    format!("{}/{fallback}", mount.trim_end_matches('/'))
                },
                |p| self.local(p),
            )
    }

    fn gsutil(&self) -> String {
        self.request.billing_project.as_ref().map_or_else(
            || "gsutil -q".to_string(),
            |project| format!("gsutil -q -u {}", shell_quote(project)),
        )
    }

    fn action(&self, image: &str, script: String, flags: Vec<&'static str>, tag: &str) -> Action {
        Action {
            image_uri: image.to_string(),
            commands: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            mounts: self.mounts(),
            flags,
            labels: BTreeMap::from([("tag".to_string(), tag.to_string())]),
        }
    }

    fn localize(&self, parameter: &IoParameter) -> Action {
        let local = self.local(parameter);
        let script = format!(
            "mkdir -p \"$(dirname {local})\" && {} -m cp {} {local}",
            self.gsutil(),
            shell_quote(&parameter.remote),
            local = shell_quote(&local),
        );
        self.action(&self.settings.localization_image, script, Vec::new(), "localization")
    }

    fn delocalize(&self, parameter: &IoParameter) -> Action {
        let local = self.local(parameter);
        let gsutil = self.gsutil();
        // Listing lines are paths relative to the directory; rsync mirrors them remotely.
        let script = if let Some(directory) = local.strip_suffix("/*") {
            let dir = shell_quote(directory);
            let listing = shell_quote(&format!("{directory}.list"));
            format!(
                "if [ -d {dir} ]; then (cd {dir} && find . -type f | sed 's|^\\./||') > {listing}; \
                 {gsutil} -m rsync -r {dir} {remote}; fi",
                remote = shell_quote(&parameter.remote),
            )
        } else {
            let copy = format!(
                "{gsutil} -m cp {} {}",
                shell_quote(&local),
                shell_quote(&parameter.remote)
            );
            if parameter.optional {
                format!("if [ -e {} ]; then {copy}; fi", shell_quote(&local))
            } else {
                copy
            }
        };
        self.action(
            &self.settings.localization_image,
            script,
            vec![FLAG_ALWAYS_RUN],
            "delocalization",
        )
    }

    fn periodic_upload(&self, parameter: &IoParameter) -> Option<Action> {
        let policy = parameter.upload.as_ref()?;
        let script = format!(
            "while true; do if [ -e {local} ]; then {} -h {} cp {local} {remote}; fi; sleep {}; done",
            self.gsutil(),
            shell_quote(&format!("Content-Type:{}", policy.content_type)),
            policy.cadence.as_secs().max(1),
            local = shell_quote(&self.local(parameter)),
            remote = shell_quote(&parameter.remote),
        );
        Some(self.action(
            &self.settings.localization_image,
            script,
            vec![FLAG_RUN_IN_BACKGROUND, FLAG_IGNORE_EXIT_STATUS],
            "log-upload",
        ))
    }

    fn monitoring(&self) -> Option<Action> {
        let script = self
            .request
            .inputs
            .iter()
            .find(|p| p.name == detritus::MONITORING)?;
        Some(self.action(
            &self.settings.localization_image,
            format!("/bin/bash {}", shell_quote(&self.local(script))),
            vec![FLAG_RUN_IN_BACKGROUND, FLAG_IGNORE_EXIT_STATUS],
            "monitoring",
        ))
    }

    fn user_action(&self) -> Action {
        let working = self
            .request
            .disks
            .iter()
            .find(|d| d.is_working_disk())
            .map_or("/", |d| d.mount_point.as_str());
        let script = format!(
            "cd {} && {} > {} 2> {}; echo $? > {}",
            shell_quote(working),
            self.request.command,
            shell_quote(&self.working_local(detritus::STDOUT, detritus::STDOUT)),
            shell_quote(&self.working_local(detritus::STDERR, detritus::STDERR)),
            shell_quote(&self.working_local(detritus::RETURN_CODE, detritus::RETURN_CODE)),
        );
        Action {
            image_uri: self.request.docker_image.clone(),
            commands: vec!["/bin/bash".to_string(), "-c".to_string(), script],
            mounts: self.mounts(),
            flags: Vec::new(),
            labels: BTreeMap::from([("tag".to_string(), "user-action".to_string())]),
        }
    }
}

fn pipeline_request(request: &RunRequest, settings: &PipelineSettings) -> RunPipelineRequest {
    let builder = ActionBuilder::new(request, settings);

    let mut actions: Vec<Action> = request
        .inputs
        .iter()
        .map(|p| builder.localize(p))
        .collect();
    actions.extend(builder.monitoring());
    actions.extend(request.outputs.iter().filter_map(|p| builder.periodic_upload(p)));
    actions.push(builder.user_action());

    // Directory contents write the listing file their `.list` sibling copies.
    let (contents, files): (Vec<&IoParameter>, Vec<&IoParameter>) = request
        .outputs
        .iter()
        .partition(|p| p.local_path.ends_with("/*"));
    actions.extend(contents.into_iter().chain(files).map(|p| builder.delocalize(p)));

    RunPipelineRequest {
        pipeline: Pipeline {
            actions,
            resources: Resources {
                project_id: settings.project_id.clone(),
                zones: request.zones.clone(),
                virtual_machine: VirtualMachine {
                    machine_type: machine_type(request.cpu, request.memory_mb),
                    preemptible: request.preemptible,
                    labels: request.labels.clone(),
                    disks: request
                        .disks
                        .iter()
                        .map(|d| Disk {
                            name: d.name.clone(),
                            size_gb: d.size_gb,
                            disk_type: disk_type(d.disk_type),
                        })
                        .collect(),
                    service_account: request.service_account.as_ref().map(|email| {
                        ServiceAccount {
                            email: email.clone(),
                            scopes: VM_SCOPES.to_vec(),
                        }
                    }),
                    boot_disk_size_gb: request.boot_disk_size_gb,
                },
            },
        },
        labels: request.labels.clone(),
    }
}

/// Parses the `NN:` sub-code prefix of an operation error message.
fn sub_code(message: &str) -> Option<i32> {
    message
        .split_once(':')
        .and_then(|(head, _)| head.trim().parse().ok())
}

fn machine_info(metadata: &OperationMetadata) -> MachineInfo {
    let mut machine = MachineInfo {
        machine_type: metadata
            .pipeline
            .as_ref()
            .and_then(|p| p.pointer("/resources/virtualMachine/machineType"))
            .and_then(Value::as_str)
            .map(str::to_string),
        ..MachineInfo::default()
    };
    if let Some(assigned) = metadata
        .events
        .iter()
        .find(|e| e.detail_type().is_some_and(|t| t.ends_with("WorkerAssignedEvent")))
    {
        machine.zone = assigned.detail_str("zone");
        machine.instance_name = assigned.detail_str("instance");
    }
    machine
}

/// Exit status of the last action that stopped with a non-zero status.
fn failed_exit_status(metadata: &OperationMetadata) -> Option<i32> {
    metadata
        .events
        .iter()
        .filter(|e| e.detail_type().is_some_and(|t| t.ends_with("ContainerStoppedEvent")))
        .filter_map(|e| {
            e.details
                .as_ref()
                .and_then(|d| d.get("exitStatus"))
                .and_then(Value::as_i64)
        })
        .filter(|status| *status != 0)
        .max()
        .and_then(|status| i32::try_from(status).ok())
}

fn run_status(operation: Operation) -> RunStatus {
    if !operation.done {
        return RunStatus::Running;
    }
    let metadata = operation.metadata.unwrap_or_default();

    let Some(error) = operation.error else {
        let mut events: Vec<ExecutionEvent> = metadata
            .events
            .iter()
            .map(|e| ExecutionEvent::new(e.description.clone(), e.timestamp))
            .collect();
        events.sort_by_key(|e| e.timestamp);
        return RunStatus::Success {
            machine: machine_info(&metadata),
            events,
        };
    };

    let error_code = ErrorCode::from_code(error.code);
    let sub_code = sub_code(&error.message);
    match (error_code, sub_code) {
        (ErrorCode::Cancelled, _) => RunStatus::Cancelled,
        (ErrorCode::Aborted, Some(sub_codes::PREEMPTED)) => RunStatus::Preempted {
            error_code,
            sub_code,
            message: error.message,
        },
        _ => RunStatus::UnsuccessfulOther {
            error_code,
            sub_code,
            return_code: failed_exit_status(&metadata),
            message: error.message,
        },
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::attempt::CallAttempt;
    use crate::io_plan::{Direction, LOG_CONTENT_TYPE, UploadPolicy};
    use crate::runtime::{AttachedDisk, WORKING_DISK_NAME};
    use std::time::Duration;
    use uuid::Uuid;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            endpoint: "https://genomics.googleapis.com/v2alpha1".into(),
            project_id: "proj".into(),
            localization_image: "sdk".into(),
        }
    }

    fn parameter(name: &str, direction: Direction, remote: &str, local: &str) -> IoParameter {
        IoParameter {
            name: name.into(),
            direction,
            remote: remote.into(),
            local_path: local.into(),
            disk: WORKING_DISK_NAME.into(),
            optional: false,
            secondary: false,
            upload: None,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            attempt: CallAttempt::new(Uuid::nil(), "wf.call"),
            docker_image: "ubuntu:22.04".into(),
            command: "/bin/bash /cirro_root/script".into(),
            cpu: 2,
            memory_mb: 3000,
            preemptible: true,
            disks: vec![AttachedDisk {
                name: WORKING_DISK_NAME.into(),
                mount_point: "/cirro_root".into(),
                size_gb: 10,
                disk_type: DiskType::Ssd,
            }],
            boot_disk_size_gb: 10,
            zones: vec!["us-central1-a".into()],
            service_account: None,
            billing_project: Some("payer".into()),
            inputs: vec![parameter(
                "exec",
                Direction::Input,
                "gs://b/wf/call/script",
                "script",
            )],
            outputs: vec![
                parameter("/cirro_root/out.txt", Direction::Output, "gs://b/wf/call/out.txt", "out.txt"),
                parameter("/cirro_root/dir/*", Direction::Output, "gs://b/wf/call/dir/", "dir/*"),
                IoParameter {
                    upload: Some(UploadPolicy {
                        cadence: Duration::from_secs(60),
                        content_type: LOG_CONTENT_TYPE.into(),
                    }),
                    ..parameter("stdout", Direction::Output, "gs://b/wf/call/stdout", "stdout")
                },
            ],
            labels: BTreeMap::from([("call".to_string(), "wf-call".to_string())]),
        }
    }

    #[test]
    fn machine_type_rounds_memory() {
        assert_eq!(machine_type(2, 3000), "custom-2-3072");
        assert_eq!(machine_type(1, 0), "custom-1-256");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn sub_code_parses_message_prefix() {
        assert_eq!(sub_code("14: VM was preempted"), Some(14));
        assert_eq!(sub_code("13: VM stopped unexpectedly"), Some(13));
        assert_eq!(sub_code("execution failed"), None);
        assert_eq!(sub_code("reason: unknown"), None);
    }

    #[test]
    fn pipeline_request_layout() {
        let body = pipeline_request(&request(), &settings());
        let json = serde_json::to_value(&body).unwrap();

        let tags: Vec<&str> = json["pipeline"]["actions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["labels"]["tag"].as_str().unwrap())
            .collect();
        assert_eq!(
            tags,
            vec![
                "localization",
                "log-upload",
                "user-action",
                "delocalization",
                "delocalization",
                "delocalization",
            ]
        );

        let vm = &json["pipeline"]["resources"]["virtualMachine"];
        assert_eq!(vm["machineType"], "custom-2-3072");
        assert_eq!(vm["preemptible"], true);
        assert_eq!(vm["disks"][0]["type"], "pd-ssd");
        assert_eq!(json["pipeline"]["resources"]["projectId"], "proj");

        let user = &json["pipeline"]["actions"][2];
        assert_eq!(user["imageUri"], "ubuntu:22.04");
        let script = user["commands"][2].as_str().unwrap();
        assert!(script.contains("> '/cirro_root/stdout'"));
        assert!(script.contains("echo $? > '/cirro_root/rc'"));

        let first_delocalization = json["pipeline"]["actions"][3]["commands"][2]
            .as_str()
            .unwrap();
        assert!(first_delocalization.contains("rsync -r '/cirro_root/dir'"));
        // Listing entries keep their subdirectories, matching the rsync layout.
        assert!(first_delocalization.contains("find . -type f"));
        assert!(!first_delocalization.contains("maxdepth"));
        assert!(first_delocalization.contains("-u 'payer'"));
        assert_eq!(json["pipeline"]["actions"][3]["flags"][0], FLAG_ALWAYS_RUN);
    }

    fn operation(json: Value) -> Operation {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn running_operation() {
        let op = operation(serde_json::json!({ "name": "operations/1" }));
        assert_eq!(run_status(op), RunStatus::Running);
    }

    #[test]
    fn successful_operation_carries_events_and_machine() {
        let op = operation(serde_json::json!({
            "name": "operations/1",
            "done": true,
            "metadata": {
                "pipeline": { "resources": { "virtualMachine": { "machineType": "custom-2-3072" } } },
                "events": [
                    { "timestamp": "2024-01-01T00:05:00Z", "description": "Worker released" },
                    {
                        "timestamp": "2024-01-01T00:00:00Z",
                        "description": "Worker assigned",
                        "details": {
                            "@type": "type.googleapis.com/google.genomics.v2alpha1.WorkerAssignedEvent",
                            "zone": "us-central1-a",
                            "instance": "google-pipelines-worker-1"
                        }
                    }
                ]
            }
        }));

        let RunStatus::Success { events, machine } = run_status(op) else {
            panic!("expected success");
        };
        assert_eq!(events[0].description, "Worker assigned");
        assert_eq!(events[1].description, "Worker released");
        assert_eq!(machine.machine_type.as_deref(), Some("custom-2-3072"));
        assert_eq!(machine.zone.as_deref(), Some("us-central1-a"));
        assert_eq!(
            machine.instance_name.as_deref(),
            Some("google-pipelines-worker-1")
        );
    }

    #[test]
    fn error_operations_are_classified() {
        let preempted = operation(serde_json::json!({
            "name": "operations/1",
            "done": true,
            "error": { "code": 10, "message": "14: VM was preempted" }
        }));
        assert!(matches!(run_status(preempted), RunStatus::Preempted { sub_code: Some(14), .. }));

        let cancelled = operation(serde_json::json!({
            "name": "operations/1",
            "done": true,
            "error": { "code": 1, "message": "operation was cancelled" }
        }));
        assert_eq!(run_status(cancelled), RunStatus::Cancelled);

        let failed = operation(serde_json::json!({
            "name": "operations/1",
            "done": true,
            "error": { "code": 9, "message": "Execution failed" },
            "metadata": {
                "events": [{
                    "timestamp": "2024-01-01T00:00:00Z",
                    "description": "Stopped running user action",
                    "details": {
                        "@type": "type.googleapis.com/google.genomics.v2alpha1.ContainerStoppedEvent",
                        "actionId": 2,
                        "exitStatus": 3
                    }
                }]
            }
        }));
        assert_eq!(
            run_status(failed),
            RunStatus::UnsuccessfulOther {
                error_code: ErrorCode::FailedPrecondition,
                sub_code: None,
                message: "Execution failed".into(),
                return_code: Some(3),
            }
        );
    }
}
