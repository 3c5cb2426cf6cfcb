//! Runtime parameters for one call attempt.
//!
//! [`RuntimeParameters::from_declarations`] turns the evaluated runtime
//! declarations of a call (a `name -> JSON value` map) into the resources
//! requested from the compute backend. Unknown declarations are ignored;
//! malformed ones fail with [`Error::InvalidRuntimeParameters`].
//!
//! Recognized declarations:
//!
//! | Name | Accepted values |
//! |------|-----------------|
//! | `cpu` | positive integer |
//! | `memory` | `"<n> <unit>"` (B, KB, KiB, MB, MiB, GB, GiB, TB, TiB) or a number of GB |
//! | `disks` | `"local-disk 10 SSD, /mnt/ref 50 HDD"` or a list of such entries |
//! | `docker` | image name (required) |
//! | `preemptible` | non-negative integer |
//! | `zones` | space-separated string or list |
//! | `bootDiskSizeGb` | positive integer |
//! | `continueOnReturnCode` | `true`, `false`, an integer or a list of integers |
//! | `serviceAccount` | service account email |
//! | `billingProject` | project billed for the run |

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Name of the working disk.
pub const WORKING_DISK_NAME: &str = "local-disk";

/// Disk media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskType {
    /// Solid-state persistent disk.
    Ssd,
    /// Standard persistent disk.
    Hdd,
}

impl DiskType {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "SSD" => Some(Self::Ssd),
            "HDD" => Some(Self::Hdd),
            _ => None,
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssd => write!(f, "SSD"),
            Self::Hdd => write!(f, "HDD"),
        }
    }
}

/// A disk attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Disk name, unique per run; `local-disk` for the working disk.
    pub name: String,
    /// Absolute mount point inside the VM.
    pub mount_point: String,
    /// Size in GB.
    pub size_gb: u32,
    /// Media type.
    pub disk_type: DiskType,
}

impl AttachedDisk {
    /// Returns true for the working disk.
    #[must_use]
    pub fn is_working_disk(&self) -> bool {
        self.name == WORKING_DISK_NAME
    }
}

/// Return codes that count as success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueOnReturnCode {
    /// Any return code is accepted.
    Any,
    /// Only the listed return codes are accepted.
    Codes(BTreeSet<i32>),
}

impl Default for ContinueOnReturnCode {
    fn default() -> Self {
        Self::Codes(BTreeSet::from([0]))
    }
}

impl ContinueOnReturnCode {
    /// Returns true if `return_code` counts as success.
    #[must_use]
    pub fn allows(&self, return_code: i32) -> bool {
        match self {
            Self::Any => true,
            Self::Codes(codes) => codes.contains(&return_code),
        }
    }
}

/// Defaults applied when a declaration is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDefaults {
    /// Mount point of the working disk.
    pub working_mount: String,
    /// Working disk size in GB.
    pub working_disk_size_gb: u32,
    /// Working disk media type.
    pub working_disk_type: DiskType,
    /// CPU count.
    pub cpu: u32,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Boot disk size in GB.
    pub boot_disk_size_gb: u32,
    /// Zones used when none are declared.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Service account used when none is declared.
    #[serde(default)]
    pub service_account: Option<String>,
    /// Billing project used when none is declared.
    #[serde(default)]
    pub billing_project: Option<String>,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            working_mount: "/cirro_root".to_string(),
            working_disk_size_gb: 10,
            working_disk_type: DiskType::Ssd,
            cpu: 1,
            memory_bytes: 2 * GB,
            boot_disk_size_gb: 10,
            zones: Vec::new(),
            service_account: None,
            billing_project: None,
        }
    }
}

/// Resources and execution options requested for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeParameters {
    /// CPU count.
    pub cpu: u32,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Attached disks; exactly one is the working disk.
    pub disks: Vec<AttachedDisk>,
    /// Container image.
    pub docker_image: String,
    /// Preemptible attempts allowed; 0 means never preemptible.
    pub preemptible: u32,
    /// Service account the VM runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Project billed for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_project: Option<String>,
    /// Zones the VM may run in.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Boot disk size in GB.
    pub boot_disk_size_gb: u32,
    /// Return codes treated as success.
    pub continue_on_return_code: ContinueOnReturnCode,
}

const KB: u64 = 1000;
const MB: u64 = KB * 1000;
const GB: u64 = MB * 1000;
const TB: u64 = GB * 1000;
const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

impl RuntimeParameters {
    /// Builds runtime parameters from evaluated declarations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRuntimeParameters`] if a declaration is
    /// malformed or `docker` is missing.
    pub fn from_declarations(
        declarations: &BTreeMap<String, Value>,
        defaults: &RuntimeDefaults,
    ) -> Result<Self> {
        let docker_image = match declarations.get("docker") {
            Some(Value::String(image)) if !image.trim().is_empty() => image.trim().to_string(),
            Some(other) => {
                return Err(Error::invalid_runtime(format!(
                    "docker must be a non-empty string, got {other}"
                )));
            }
            None => return Err(Error::invalid_runtime("docker is required")),
        };

        let cpu = declarations
            .get("cpu")
            .map(|v| positive_u32("cpu", v))
            .transpose()?
            .unwrap_or(defaults.cpu);

        let memory_bytes = declarations
            .get("memory")
            .map(parse_memory)
            .transpose()?
            .unwrap_or(defaults.memory_bytes);

        let disks = parse_disks(declarations.get("disks"), defaults)?;

        let preemptible = declarations
            .get("preemptible")
            .map(|v| non_negative_u32("preemptible", v))
            .transpose()?
            .unwrap_or(0);

        let zones = match declarations.get("zones") {
            Some(v) => string_list("zones", v)?,
            None => defaults.zones.clone(),
        };

        let boot_disk_size_gb = declarations
            .get("bootDiskSizeGb")
            .map(|v| positive_u32("bootDiskSizeGb", v))
            .transpose()?
            .unwrap_or(defaults.boot_disk_size_gb);

        let continue_on_return_code = declarations
            .get("continueOnReturnCode")
            .map(parse_continue_on_return_code)
            .transpose()?
            .unwrap_or_default();

        let service_account = optional_string(declarations, "serviceAccount")?
            .or_else(|| defaults.service_account.clone());
        let billing_project = optional_string(declarations, "billingProject")?
            .or_else(|| defaults.billing_project.clone());

        Ok(Self {
            cpu,
            memory_bytes,
            disks,
            docker_image,
            preemptible,
            service_account,
            billing_project,
            zones,
            boot_disk_size_gb,
            continue_on_return_code,
        })
    }

    /// The working disk.
    ///
    /// # Errors
    ///
    /// Returns an error if no working disk is attached.
    pub fn working_disk(&self) -> Result<&AttachedDisk> {
        self.disks
            .iter()
            .find(|d| d.is_working_disk())
            .ok_or_else(|| Error::invalid_runtime("no working disk attached"))
    }

    /// Returns true if the call may run on preemptible VMs at all.
    #[must_use]
    pub const fn preemptible_eligible(&self) -> bool {
        self.preemptible > 0
    }

    /// Memory in whole megabytes, rounded up.
    #[must_use]
    pub const fn memory_mb(&self) -> u64 {
        self.memory_bytes.div_ceil(MB)
    }
}

fn as_u64(name: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| Error::invalid_runtime(format!("{name} must be a whole number, got {n}"))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::invalid_runtime(format!("{name} must be a whole number: {e}"))),
        other => Err(Error::invalid_runtime(format!(
            "{name} must be a whole number, got {other}"
        ))),
    }
}

fn non_negative_u32(name: &str, value: &Value) -> Result<u32> {
    let n = as_u64(name, value)?;
    u32::try_from(n).map_err(|_| Error::invalid_runtime(format!("{name} is too large: {n}")))
}

fn positive_u32(name: &str, value: &Value) -> Result<u32> {
    let n = non_negative_u32(name, value)?;
    if n == 0 {
        return Err(Error::invalid_runtime(format!("{name} must be at least 1")));
    }
    Ok(n)
}

fn optional_string(declarations: &BTreeMap<String, Value>, name: &str) -> Result<Option<String>> {
    match declarations.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(Error::invalid_runtime(format!(
            "{name} must be a string, got {other}"
        ))),
    }
}

fn string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(Error::invalid_runtime(format!(
                    "{name} entries must be strings, got {other}"
                ))),
            })
            .collect(),
        other => Err(Error::invalid_runtime(format!(
            "{name} must be a string or a list of strings, got {other}"
        ))),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scale(amount: f64, unit: u64) -> Result<u64> {
    let bytes = (amount * unit as f64).ceil();
    if !bytes.is_finite() || bytes <= 0.0 || bytes > u64::MAX as f64 {
        return Err(Error::invalid_runtime(format!(
            "memory must be positive, got {amount}"
        )));
    }
    Ok(bytes as u64)
}

fn parse_memory(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => {
            let amount = n
                .as_f64()
                .ok_or_else(|| Error::invalid_runtime(format!("invalid memory amount {n}")))?;
            scale(amount, GB)
        }
        Value::String(s) => {
            let trimmed = s.trim();
            let split = trimmed
                .find(|c: char| c.is_ascii_alphabetic())
                .unwrap_or(trimmed.len());
            let (amount, unit) = trimmed.split_at(split);
            let amount: f64 = amount.trim().parse().map_err(|e| {
                Error::invalid_runtime(format!("invalid memory amount in '{trimmed}': {e}"))
            })?;
            let unit = match unit.trim() {
                "" | "GB" | "G" => GB,
                "B" => 1,
                "KB" | "K" => KB,
                "KiB" | "Ki" => KIB,
                "MB" | "M" => MB,
                "MiB" | "Mi" => MIB,
                "GiB" | "Gi" => GIB,
                "TB" | "T" => TB,
                "TiB" | "Ti" => TIB,
                other => {
                    return Err(Error::invalid_runtime(format!(
                        "unknown memory unit '{other}' in '{trimmed}'"
                    )));
                }
            };
            scale(amount, unit)
        }
        other => Err(Error::invalid_runtime(format!(
            "memory must be a string or number, got {other}"
        ))),
    }
}

fn parse_disk_entry(entry: &str, mounted: &mut u32, defaults: &RuntimeDefaults) -> Result<AttachedDisk> {
    let parts: Vec<&str> = entry.split_whitespace().collect();
    let [location, size, disk_type] = parts.as_slice() else {
        return Err(Error::invalid_runtime(format!(
            "disk entry '{entry}' must be '<mount point|local-disk> <size GB> <SSD|HDD>'"
        )));
    };

    let size_gb: u32 = size
        .parse()
        .map_err(|e| Error::invalid_runtime(format!("invalid disk size in '{entry}': {e}")))?;
    if size_gb == 0 {
        return Err(Error::invalid_runtime(format!(
            "disk size must be positive in '{entry}'"
        )));
    }
    let disk_type = DiskType::parse(disk_type).ok_or_else(|| {
        Error::invalid_runtime(format!("disk type must be SSD or HDD in '{entry}'"))
    })?;

    if *location == WORKING_DISK_NAME {
        return Ok(AttachedDisk {
            name: WORKING_DISK_NAME.to_string(),
            mount_point: defaults.working_mount.clone(),
            size_gb,
            disk_type,
        });
    }

    if !location.starts_with('/') {
        return Err(Error::invalid_runtime(format!(
            "disk mount point must be absolute in '{entry}'"
        )));
    }
    *mounted += 1;
    Ok(AttachedDisk {
        name: format!("disk-{mounted}"),
        mount_point: location.trim_end_matches('/').to_string(),
        size_gb,
        disk_type,
    })
}

fn parse_disks(value: Option<&Value>, defaults: &RuntimeDefaults) -> Result<Vec<AttachedDisk>> {
    let entries: Vec<String> = match value {
        None => Vec::new(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect(),
        Some(other) => string_list("disks", other)?,
    };

    let mut mounted = 0;
    let mut disks = entries
        .iter()
        .map(|entry| parse_disk_entry(entry, &mut mounted, defaults))
        .collect::<Result<Vec<_>>>()?;

    let working = disks.iter().filter(|d| d.is_working_disk()).count();
    if working > 1 {
        return Err(Error::invalid_runtime("only one local-disk may be declared"));
    }
    if working == 0 {
        disks.insert(
            0,
            AttachedDisk {
                name: WORKING_DISK_NAME.to_string(),
                mount_point: defaults.working_mount.clone(),
                size_gb: defaults.working_disk_size_gb,
                disk_type: defaults.working_disk_type,
            },
        );
    }

    let mut seen = HashSet::new();
    for disk in &disks {
        if !seen.insert(disk.mount_point.as_str()) {
            return Err(Error::invalid_runtime(format!(
                "mount point {} is declared more than once",
                disk.mount_point
            )));
        }
    }
    Ok(disks)
}

fn return_code(value: &Value) -> Result<i32> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::invalid_runtime(format!(
            "continueOnReturnCode entries must be integers, got {value}"
        ))
    })
}

fn parse_continue_on_return_code(value: &Value) -> Result<ContinueOnReturnCode> {
    match value {
        Value::Bool(true) => Ok(ContinueOnReturnCode::Any),
        Value::Bool(false) => Ok(ContinueOnReturnCode::default()),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(ContinueOnReturnCode::Any),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => {
            Ok(ContinueOnReturnCode::default())
        }
        Value::Array(items) => Ok(ContinueOnReturnCode::Codes(
            items.iter().map(return_code).collect::<Result<_>>()?,
        )),
        other => Ok(ContinueOnReturnCode::Codes(BTreeSet::from([return_code(
            other,
        )?]))),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decls(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn parse(value: Value) -> Result<RuntimeParameters> {
        RuntimeParameters::from_declarations(&decls(value), &RuntimeDefaults::default())
    }

    #[test]
    fn minimal_declarations_use_defaults() {
        let params = parse(json!({"docker": "ubuntu:22.04"})).unwrap();

        assert_eq!(params.cpu, 1);
        assert_eq!(params.memory_bytes, 2 * GB);
        assert_eq!(params.preemptible, 0);
        assert!(!params.preemptible_eligible());
        assert_eq!(params.disks.len(), 1);
        let working = params.working_disk().unwrap();
        assert_eq!(working.mount_point, "/cirro_root");
        assert_eq!(working.size_gb, 10);
        assert!(params.continue_on_return_code.allows(0));
        assert!(!params.continue_on_return_code.allows(1));
    }

    #[test]
    fn docker_is_required() {
        let err = parse(json!({"cpu": 2})).unwrap_err();
        assert!(matches!(err, Error::InvalidRuntimeParameters { .. }));
    }

    #[test]
    fn memory_units() {
        let cases = [
            (json!("4 GB"), 4 * GB),
            (json!("512 MiB"), 512 * MIB),
            (json!("1.5 GiB"), 3 * GIB / 2),
            (json!("100 B"), 100),
            (json!(3), 3 * GB),
            (json!("2"), 2 * GB),
        ];
        for (value, expected) in cases {
            assert_eq!(parse_memory(&value).unwrap(), expected, "{value}");
        }
        assert!(parse_memory(&json!("4 parsecs")).is_err());
        assert!(parse_memory(&json!("-1 GB")).is_err());
        assert!(parse_memory(&json!(true)).is_err());
    }

    #[test]
    fn disks_with_working_and_mounted() {
        let params = parse(json!({
            "docker": "img",
            "disks": "local-disk 50 HDD, /mnt/ref 20 SSD, /mnt/scratch 100 HDD"
        }))
        .unwrap();

        assert_eq!(
            params.disks,
            vec![
                AttachedDisk {
                    name: "local-disk".into(),
                    mount_point: "/cirro_root".into(),
                    size_gb: 50,
                    disk_type: DiskType::Hdd,
                },
                AttachedDisk {
                    name: "disk-1".into(),
                    mount_point: "/mnt/ref".into(),
                    size_gb: 20,
                    disk_type: DiskType::Ssd,
                },
                AttachedDisk {
                    name: "disk-2".into(),
                    mount_point: "/mnt/scratch".into(),
                    size_gb: 100,
                    disk_type: DiskType::Hdd,
                },
            ]
        );
    }

    #[test]
    fn working_disk_added_when_absent() {
        let params = parse(json!({"docker": "img", "disks": ["/mnt/ref 20 SSD"]})).unwrap();
        assert_eq!(params.disks.len(), 2);
        assert!(params.disks[0].is_working_disk());
    }

    #[test]
    fn invalid_disks_are_rejected() {
        for disks in [
            "local-disk 10 SSD, local-disk 20 SSD",
            "/mnt/a 10 SSD, /mnt/a 20 HDD",
            "relative 10 SSD",
            "/mnt/a ten SSD",
            "/mnt/a 10 TAPE",
            "/mnt/a 10",
            "/mnt/a 0 SSD",
        ] {
            assert!(
                parse(json!({"docker": "img", "disks": disks})).is_err(),
                "{disks}"
            );
        }
    }

    #[test]
    fn continue_on_return_code_forms() {
        let any = parse_continue_on_return_code(&json!(true)).unwrap();
        assert!(any.allows(137));

        let zero = parse_continue_on_return_code(&json!(false)).unwrap();
        assert_eq!(zero, ContinueOnReturnCode::default());

        let single = parse_continue_on_return_code(&json!(3)).unwrap();
        assert!(single.allows(3));
        assert!(!single.allows(0));

        let list = parse_continue_on_return_code(&json!([0, 1, "2"])).unwrap();
        assert!(list.allows(2));
        assert!(!list.allows(4));

        assert!(parse_continue_on_return_code(&json!("sometimes")).is_err());
    }

    #[test]
    fn preemptible_and_options() {
        let params = parse(json!({
            "docker": "img",
            "preemptible": "3",
            "zones": "us-central1-a us-central1-b",
            "bootDiskSizeGb": 20,
            "serviceAccount": "runner@project.iam.gserviceaccount.com",
        }))
        .unwrap();

        assert_eq!(params.preemptible, 3);
        assert!(params.preemptible_eligible());
        assert_eq!(params.zones, vec!["us-central1-a", "us-central1-b"]);
        assert_eq!(params.boot_disk_size_gb, 20);
        assert_eq!(
            params.service_account.as_deref(),
            Some("runner@project.iam.gserviceaccount.com")
        );
    }

    #[test]
    fn defaults_fill_service_account_and_billing() {
        let defaults = RuntimeDefaults {
            service_account: Some("default@sa".into()),
            billing_project: Some("billing".into()),
            ..RuntimeDefaults::default()
        };
        let params =
            RuntimeParameters::from_declarations(&decls(json!({"docker": "img"})), &defaults)
                .unwrap();
        assert_eq!(params.service_account.as_deref(), Some("default@sa"));
        assert_eq!(params.billing_project.as_deref(), Some("billing"));
    }

    #[test]
    fn invalid_cpu() {
        assert!(parse(json!({"docker": "img", "cpu": 0})).is_err());
        assert!(parse(json!({"docker": "img", "cpu": -2})).is_err());
        assert!(parse(json!({"docker": "img", "cpu": "many"})).is_err());
    }
}
