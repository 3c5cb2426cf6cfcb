//! Backend configuration.
//!
//! [`BackendConfig`] gathers the settings shared by every attempt run
//! against one compute backend. It can be deserialized, assembled with the
//! `with_*` builders, or read from `CIRRO_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CIRRO_PROJECT_ID` | `project_id` |
//! | `CIRRO_COMPUTE_ENDPOINT` | `compute_endpoint` |
//! | `CIRRO_LOCALIZATION_IMAGE` | `localization_image` |
//! | `CIRRO_BILLING_PROJECT` | `billing_project` |
//! | `CIRRO_POLL_INITIAL_SECONDS`, `CIRRO_POLL_MAX_SECONDS`, `CIRRO_POLL_MULTIPLIER` | `poll_backoff` |
//! | `CIRRO_SUBMIT_INITIAL_SECONDS`, `CIRRO_SUBMIT_MAX_SECONDS`, `CIRRO_SUBMIT_MULTIPLIER` | `submit_backoff` |
//! | `CIRRO_MAX_TRANSIENT_RETRIES` | `max_transient_retries` |
//! | `CIRRO_LOG_UPLOAD_SECONDS` | `log_upload_cadence` |
//! | `CIRRO_MONITORING_SCRIPT` | `monitoring_script` |
//! | `CIRRO_REQUEST_TIMEOUT_SECONDS` | `request_timeout` |
//! | `CIRRO_WORKING_MOUNT` | `runtime_defaults.working_mount` |
//! | `CIRRO_DEFAULT_ZONES` | `runtime_defaults.zones` (comma-separated) |
//! | `CIRRO_SERVICE_ACCOUNT` | `runtime_defaults.service_account` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::runtime::RuntimeDefaults;

/// Default Pipelines API endpoint.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://genomics.googleapis.com/v2alpha1";

/// Default image used for copying files on and off the VM.
pub const DEFAULT_LOCALIZATION_IMAGE: &str = "gcr.io/google.com/cloudsdktool/cloud-sdk:slim";

/// Settings shared by every attempt against one compute backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Project the compute runs are created in.
    pub project_id: Option<String>,
    /// Base URL of the compute API.
    pub compute_endpoint: String,
    /// Image running the copy actions.
    pub localization_image: String,
    /// Project billed for requester-pays storage access.
    pub billing_project: Option<String>,
    /// Status polling schedule.
    pub poll_backoff: BackoffPolicy,
    /// Schedule for retrying transient submit and poll failures.
    pub submit_backoff: BackoffPolicy,
    /// Consecutive transient failures tolerated per operation.
    pub max_transient_retries: u32,
    /// How often stdout and stderr are uploaded while the command runs.
    #[serde(with = "humantime_serde")]
    pub log_upload_cadence: Duration,
    /// `gs://` location of a monitoring script run alongside the command.
    pub monitoring_script: Option<String>,
    /// Timeout of a single compute API request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Defaults applied to runtime declarations.
    pub runtime_defaults: RuntimeDefaults,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            compute_endpoint: DEFAULT_COMPUTE_ENDPOINT.to_string(),
            localization_image: DEFAULT_LOCALIZATION_IMAGE.to_string(),
            billing_project: None,
            poll_backoff: BackoffPolicy::poll(),
            submit_backoff: BackoffPolicy::submit(),
            max_transient_retries: 10,
            log_upload_cadence: Duration::from_secs(60),
            monitoring_script: None,
            request_timeout: Duration::from_secs(30),
            runtime_defaults: RuntimeDefaults::default(),
        }
    }
}

impl BackendConfig {
    /// Sets the compute project.
    #[must_use]
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the requester-pays billing project.
    #[must_use]
    pub fn with_billing_project(mut self, project: impl Into<String>) -> Self {
        self.billing_project = Some(project.into());
        self
    }

    /// Sets the polling schedule.
    #[must_use]
    pub const fn with_poll_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.poll_backoff = policy;
        self
    }

    /// Sets the transient-failure retry schedule.
    #[must_use]
    pub const fn with_submit_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.submit_backoff = policy;
        self
    }

    /// Sets the number of consecutive transient failures tolerated.
    #[must_use]
    pub const fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    /// Sets the log upload cadence.
    #[must_use]
    pub const fn with_log_upload_cadence(mut self, cadence: Duration) -> Self {
        self.log_upload_cadence = cadence;
        self
    }

    /// Sets the monitoring script location.
    #[must_use]
    pub fn with_monitoring_script(mut self, location: impl Into<String>) -> Self {
        self.monitoring_script = Some(location.into());
        self
    }

    /// Sets the runtime defaults.
    #[must_use]
    pub fn with_runtime_defaults(mut self, defaults: RuntimeDefaults) -> Self {
        self.runtime_defaults = defaults;
        self
    }

    /// Checks the configuration for values no attempt could run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        validate_backoff("poll_backoff", &self.poll_backoff)?;
        validate_backoff("submit_backoff", &self.submit_backoff)?;

        if self.compute_endpoint.trim().is_empty() {
            return Err(Error::configuration("compute_endpoint cannot be empty"));
        }
        if self.localization_image.trim().is_empty() {
            return Err(Error::configuration("localization_image cannot be empty"));
        }
        if self.log_upload_cadence.is_zero() {
            return Err(Error::configuration(
                "log_upload_cadence must be greater than zero",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::configuration(
                "request_timeout must be greater than zero",
            ));
        }
        if !self.runtime_defaults.working_mount.starts_with('/') {
            return Err(Error::configuration(format!(
                "working mount '{}' must be absolute",
                self.runtime_defaults.working_mount
            )));
        }
        if let Some(script) = self
            .monitoring_script
            .as_ref()
            .filter(|s| !s.starts_with("gs://"))
        {
            return Err(Error::configuration(format!(
                "monitoring_script '{script}' must be a gs:// location"
            )));
        }
        Ok(())
    }

    /// Reads the configuration from `CIRRO_*` environment variables.
    ///
    /// Unset variables keep their defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`BackendConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        config.project_id = env.string("CIRRO_PROJECT_ID");
        if let Some(endpoint) = env.string("CIRRO_COMPUTE_ENDPOINT") {
            config.compute_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(image) = env.string("CIRRO_LOCALIZATION_IMAGE") {
            config.localization_image = image;
        }
        config.billing_project = env.string("CIRRO_BILLING_PROJECT");

        config.poll_backoff = env.backoff("CIRRO_POLL", config.poll_backoff)?;
        config.submit_backoff = env.backoff("CIRRO_SUBMIT", config.submit_backoff)?;

        if let Some(retries) = env.u64("CIRRO_MAX_TRANSIENT_RETRIES")? {
            config.max_transient_retries = u32::try_from(retries).map_err(|_| {
                Error::configuration("CIRRO_MAX_TRANSIENT_RETRIES must fit in a u32")
            })?;
        }
        if let Some(secs) = env.u64("CIRRO_LOG_UPLOAD_SECONDS")? {
            config.log_upload_cadence = Duration::from_secs(secs);
        }
        config.monitoring_script = env.string("CIRRO_MONITORING_SCRIPT");
        if let Some(secs) = env.u64("CIRRO_REQUEST_TIMEOUT_SECONDS")? {
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(mount) = env.string("CIRRO_WORKING_MOUNT") {
            config.runtime_defaults.working_mount = mount;
        }
        if let Some(zones) = env.string("CIRRO_DEFAULT_ZONES") {
            config.runtime_defaults.zones = zones
                .split(',')
                .map(str::trim)
                .filter(|z| !z.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(account) = env.string("CIRRO_SERVICE_ACCOUNT") {
            config.runtime_defaults.service_account = Some(account);
        }
        if config.runtime_defaults.billing_project.is_none() {
            config
                .runtime_defaults
                .billing_project
                .clone_from(&config.billing_project);
        }

        config.validate()?;
        Ok(config)
    }
}

fn validate_backoff(name: &str, policy: &BackoffPolicy) -> Result<()> {
    if policy.initial.is_zero() {
        return Err(Error::configuration(format!(
            "{name}.initial must be greater than zero"
        )));
    }
    if policy.max < policy.initial {
        return Err(Error::configuration(format!(
            "{name}.max must be at least {name}.initial"
        )));
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(Error::configuration(format!(
            "{name}.multiplier must be a finite number >= 1"
        )));
    }
    Ok(())
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn f64(&self, name: &str) -> Result<Option<f64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<f64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a number: {e}")))
    }

    fn backoff(&self, prefix: &str, mut policy: BackoffPolicy) -> Result<BackoffPolicy> {
        if let Some(secs) = self.u64(&format!("{prefix}_INITIAL_SECONDS"))? {
            policy.initial = Duration::from_secs(secs);
        }
        if let Some(secs) = self.u64(&format!("{prefix}_MAX_SECONDS"))? {
            policy.max = Duration::from_secs(secs);
        }
        if let Some(multiplier) = self.f64(&format!("{prefix}_MULTIPLIER"))? {
            policy.multiplier = multiplier;
        }
        Ok(policy)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<BackendConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        BackendConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = BackendConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_backoff, BackoffPolicy::poll());
        assert_eq!(config.submit_backoff, BackoffPolicy::submit());
        assert_eq!(config.runtime_defaults.working_mount, "/cirro_root");
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(from_vars(&[]).unwrap(), BackendConfig::default());
    }

    #[test]
    fn environment_overrides() {
        let config = from_vars(&[
            ("CIRRO_PROJECT_ID", "  my-project "),
            ("CIRRO_COMPUTE_ENDPOINT", "http://localhost:8080/"),
            ("CIRRO_BILLING_PROJECT", "billing"),
            ("CIRRO_POLL_INITIAL_SECONDS", "1"),
            ("CIRRO_POLL_MAX_SECONDS", "10"),
            ("CIRRO_POLL_MULTIPLIER", "2"),
            ("CIRRO_MAX_TRANSIENT_RETRIES", "3"),
            ("CIRRO_LOG_UPLOAD_SECONDS", "15"),
            ("CIRRO_MONITORING_SCRIPT", "gs://tools/monitor.sh"),
            ("CIRRO_DEFAULT_ZONES", "us-central1-a, us-central1-b,"),
            ("CIRRO_SERVICE_ACCOUNT", "runner@example.iam.gserviceaccount.com"),
        ])
        .unwrap();

        assert_eq!(config.project_id.as_deref(), Some("my-project"));
        assert_eq!(config.compute_endpoint, "http://localhost:8080");
        assert_eq!(
            config.poll_backoff,
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 2.0)
        );
        assert_eq!(config.submit_backoff, BackoffPolicy::submit());
        assert_eq!(config.max_transient_retries, 3);
        assert_eq!(config.log_upload_cadence, Duration::from_secs(15));
        assert_eq!(
            config.monitoring_script.as_deref(),
            Some("gs://tools/monitor.sh")
        );
        assert_eq!(
            config.runtime_defaults.zones,
            vec!["us-central1-a".to_string(), "us-central1-b".to_string()]
        );
        assert_eq!(
            config.runtime_defaults.billing_project.as_deref(),
            Some("billing")
        );
    }

    #[test]
    fn blank_values_are_unset() {
        let config = from_vars(&[("CIRRO_PROJECT_ID", "   ")]).unwrap();
        assert!(config.project_id.is_none());
    }

    #[test]
    fn unparseable_numbers_are_rejected() {
        let err = from_vars(&[("CIRRO_MAX_TRANSIENT_RETRIES", "many")]).unwrap_err();
        assert!(err.to_string().contains("CIRRO_MAX_TRANSIENT_RETRIES"));

        let err = from_vars(&[("CIRRO_POLL_MULTIPLIER", "fast")]).unwrap_err();
        assert!(err.to_string().contains("CIRRO_POLL_MULTIPLIER"));
    }

    #[test]
    fn invalid_values_fail_validation() {
        assert!(from_vars(&[("CIRRO_POLL_INITIAL_SECONDS", "0")]).is_err());
        assert!(from_vars(&[("CIRRO_SUBMIT_MAX_SECONDS", "1")]).is_err());
        assert!(from_vars(&[("CIRRO_SUBMIT_MULTIPLIER", "0.5")]).is_err());
        assert!(from_vars(&[("CIRRO_WORKING_MOUNT", "relative")]).is_err());
        assert!(from_vars(&[("CIRRO_MONITORING_SCRIPT", "/local/monitor.sh")]).is_err());
        assert!(from_vars(&[("CIRRO_LOG_UPLOAD_SECONDS", "0")]).is_err());
    }

    #[test]
    fn deserializes_with_humantime_durations() {
        let config: BackendConfig = serde_json::from_str(
            r#"{
                "projectId": "p",
                "maxTransientRetries": 4,
                "logUploadCadence": "2m",
                "pollBackoff": { "initial": "10s", "max": "1m", "multiplier": 1.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.project_id.as_deref(), Some("p"));
        assert_eq!(config.max_transient_retries, 4);
        assert_eq!(config.log_upload_cadence, Duration::from_secs(120));
        assert_eq!(config.poll_backoff.initial, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn builders_set_fields() {
        let config = BackendConfig::default()
            .with_project_id("p")
            .with_billing_project("b")
            .with_max_transient_retries(2)
            .with_log_upload_cadence(Duration::from_secs(5))
            .with_monitoring_script("gs://tools/m.sh");
        assert_eq!(config.project_id.as_deref(), Some("p"));
        assert_eq!(config.billing_project.as_deref(), Some("b"));
        assert_eq!(config.max_transient_retries, 2);
        assert_eq!(config.log_upload_cadence, Duration::from_secs(5));
        config.validate().unwrap();
    }
}
