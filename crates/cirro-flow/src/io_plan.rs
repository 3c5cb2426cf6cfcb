//! Localization and delocalization planning.
//!
//! The planner translates the file references of a call into the named
//! input and output parameters the compute backend copies before and after
//! the command runs:
//!
//! - **Inputs** are expanded to single files. Listed directories are
//!   flattened, unlisted directories and globs are enumerated through
//!   storage listings. Each file lands on the working disk at its
//!   scheme-stripped path (`gs://bucket/a/b` becomes `bucket/a/b`), or at
//!   its base name for ad hoc files.
//! - **Outputs** are resolved against the attached disks. The disk with the
//!   longest matching mount point owns the file. Destinations live under the
//!   call root.
//! - **Detritus** parameters carry the command script in and the return
//!   code, stdout and stderr out.
//!
//! Parameter names are at most [`MAX_REFERENCE_NAME_LEN`] characters. The
//! same naming function maps outputs back to their destinations once the
//! run succeeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cirro_core::location::{LocationResolver, PathValidation, StorageLocation, validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::runtime::AttachedDisk;

/// Longest parameter name accepted by the compute backend.
pub const MAX_REFERENCE_NAME_LEN: usize = 127;

/// Content type used for periodically uploaded logs.
pub const LOG_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Detritus parameter names and the file names they use under the call root.
pub mod detritus {
    /// Command script input.
    pub const EXEC: &str = "exec";
    /// Monitoring script input.
    pub const MONITORING: &str = "monitoring";
    /// Return-code file output.
    pub const RETURN_CODE: &str = "rc";
    /// Standard output log.
    pub const STDOUT: &str = "stdout";
    /// Standard error log.
    pub const STDERR: &str = "stderr";
    /// File name of the command script under the call root.
    pub const SCRIPT_FILE: &str = "script";
    /// File name of the monitoring script on the working disk.
    pub const MONITORING_FILE: &str = "monitoring.sh";
}

/// A file value produced by the workflow evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileReference {
    /// One file.
    SingleFile {
        /// File path.
        path: String,
    },
    /// A directory whose contents are discovered at run time.
    UnlistedDirectory {
        /// Directory path.
        path: String,
    },
    /// A glob pattern.
    Glob {
        /// Pattern with `*` and `?` wildcards.
        pattern: String,
    },
    /// A directory with a known listing.
    ListedDirectory {
        /// Directory path.
        path: String,
        /// Contained entries.
        listing: Vec<FileReference>,
    },
}

impl FileReference {
    /// Creates a single file reference.
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        Self::SingleFile { path: path.into() }
    }

    /// Creates an unlisted directory reference.
    #[must_use]
    pub fn directory(path: impl Into<String>) -> Self {
        Self::UnlistedDirectory { path: path.into() }
    }

    /// Creates a glob reference.
    #[must_use]
    pub fn glob(pattern: impl Into<String>) -> Self {
        Self::Glob {
            pattern: pattern.into(),
        }
    }
}

/// An input file value of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeclaration {
    /// Input name in the workflow.
    pub name: String,
    /// File value.
    pub reference: FileReference,
    /// Whether the file is copied onto the VM.
    #[serde(default = "default_true")]
    pub localize: bool,
    /// Whether the file is placed in the working directory by base name.
    #[serde(default)]
    pub ad_hoc: bool,
}

fn default_true() -> bool {
    true
}

impl InputDeclaration {
    /// Creates a localized, non ad hoc input.
    #[must_use]
    pub fn new(name: impl Into<String>, reference: FileReference) -> Self {
        Self {
            name: name.into(),
            reference,
            localize: true,
            ad_hoc: false,
        }
    }
}

/// One file of a declared output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    /// File value, relative to the working directory unless absolute.
    pub reference: FileReference,
    /// Whether the file may be absent.
    #[serde(default)]
    pub optional: bool,
    /// Whether the file is a secondary file of another output.
    #[serde(default)]
    pub secondary: bool,
}

impl OutputFile {
    /// Creates a required primary output file.
    #[must_use]
    pub const fn required(reference: FileReference) -> Self {
        Self {
            reference,
            optional: false,
            secondary: false,
        }
    }

    /// Creates an optional primary output file.
    #[must_use]
    pub const fn optional(reference: FileReference) -> Self {
        Self {
            reference,
            optional: true,
            secondary: false,
        }
    }
}

/// A declared output of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDeclaration {
    /// Output name in the workflow.
    pub name: String,
    /// Files making up the output.
    pub files: Vec<OutputFile>,
}

impl OutputDeclaration {
    /// Creates an output with a single file.
    #[must_use]
    pub fn single(name: impl Into<String>, file: OutputFile) -> Self {
        Self {
            name: name.into(),
            files: vec![file],
        }
    }
}

/// Copy direction of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Copied from storage onto the VM before the command runs.
    Input,
    /// Copied from the VM to storage after the command runs.
    Output,
}

/// Periodic upload settings for outputs written while the command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    /// Interval between uploads.
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
    /// Content type set on the uploaded object.
    pub content_type: String,
}

/// A named copy between storage and a disk on the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoParameter {
    /// Unique parameter name.
    pub name: String,
    /// Copy direction.
    pub direction: Direction,
    /// Remote `gs://` location.
    pub remote: String,
    /// Path relative to the disk's mount point; may end in `/*`.
    pub local_path: String,
    /// Name of the disk holding the file.
    pub disk: String,
    /// Whether a missing file is tolerated.
    pub optional: bool,
    /// Whether the file is a secondary file.
    pub secondary: bool,
    /// Periodic upload settings (outputs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadPolicy>,
}

/// Parameters for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPlan {
    /// Localized workflow inputs.
    pub inputs: Vec<IoParameter>,
    /// Delocalized workflow outputs.
    pub outputs: Vec<IoParameter>,
    /// Script, return code and log parameters.
    pub detritus: Vec<IoParameter>,
}

impl IoPlan {
    /// All parameters copied onto the VM.
    pub fn all_inputs(&self) -> impl Iterator<Item = &IoParameter> {
        self.inputs
            .iter()
            .chain(self.detritus.iter().filter(|p| p.direction == Direction::Input))
    }

    /// All parameters copied off the VM.
    pub fn all_outputs(&self) -> impl Iterator<Item = &IoParameter> {
        self.outputs
            .iter()
            .chain(self.detritus.iter().filter(|p| p.direction == Direction::Output))
    }

    /// Finds a workflow output parameter by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&IoParameter> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Finds a detritus parameter by name.
    #[must_use]
    pub fn detritus(&self, name: &str) -> Option<&IoParameter> {
        self.detritus.iter().find(|p| p.name == name)
    }
}

/// Call-specific context for planning.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// Root location for this attempt's outputs and detritus.
    pub call_root: &'a StorageLocation,
    /// Disks attached to the VM.
    pub disks: &'a [AttachedDisk],
    /// Monitoring script to localize, if configured.
    pub monitoring_script: Option<&'a StorageLocation>,
}

impl<'a> PlanContext<'a> {
    fn working_disk(&self) -> Result<&'a AttachedDisk> {
        self.disks
            .iter()
            .find(|d| d.is_working_disk())
            .ok_or_else(|| Error::planning("no working disk attached"))
    }
}

/// A mapped value of one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    /// A delocalized file.
    File(String),
    /// A delocalized directory.
    Directory(String),
    /// An optional file that was not produced.
    Missing(String),
}

/// The remote values of one declared output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedOutput {
    /// Output name in the workflow.
    pub name: String,
    /// Values in declaration order.
    pub values: Vec<OutputValue>,
}

/// Returns a backend-safe parameter name.
///
/// Names longer than [`MAX_REFERENCE_NAME_LEN`] are replaced by the SHA-256
/// hex digest of the full name.
#[must_use]
pub fn safe_reference_name(natural: &str) -> String {
    if natural.len() <= MAX_REFERENCE_NAME_LEN {
        return natural.to_string();
    }
    hex::encode(Sha256::digest(natural.as_bytes()))
}

/// Directory name used on the working disk for the files matching `pattern`.
///
/// Format: `glob-{sha256(pattern)[0..32]}`
#[must_use]
pub fn glob_directory_name(pattern: &str) -> String {
    let digest = hex::encode(Sha256::digest(pattern.as_bytes()));
    let short = digest.get(..32).unwrap_or(&digest);
    format!("glob-{short}")
}

/// Collapses `.` and `..` segments of an absolute POSIX path.
///
/// # Errors
///
/// Returns a planning error if the path is relative or climbs above `/`.
pub fn normalize_absolute(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::planning(format!("path '{path}' is not absolute")));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::planning(format!("path '{path}' escapes the root")));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

fn mount_contains(mount: &str, path: &str) -> bool {
    mount == "/"
        || path == mount
        || path
            .strip_prefix(mount)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn relative_to<'p>(mount: &str, path: &'p str) -> &'p str {
    if mount == "/" {
        return path.trim_start_matches('/');
    }
    path.strip_prefix(mount)
        .map_or(path, |rest| rest.trim_start_matches('/'))
}

fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut expression = String::from("^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                expression.push_str(&regex::escape(&literal));
                literal.clear();
                expression.push_str(if c == '*' { "[^/]*" } else { "[^/]" });
            }
            other => literal.push(other),
        }
    }
    expression.push_str(&regex::escape(&literal));
    expression.push('$');
    Regex::new(&expression)
        .map_err(|e| Error::planning(format!("invalid glob pattern '{pattern}': {e}")))
}

fn scheme_stripped(location: &StorageLocation) -> String {
    format!("{}{}", location.bucket(), location.path())
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

fn flatten_listing<'r>(reference: &'r FileReference, out: &mut Vec<&'r FileReference>) {
    match reference {
        FileReference::ListedDirectory { listing, .. } => {
            for entry in listing {
                flatten_listing(entry, out);
            }
        }
        other => out.push(other),
    }
}

/// Accumulates parameters, collapsing identical duplicates.
#[derive(Default)]
struct ParameterSet {
    parameters: Vec<IoParameter>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    fn add(&mut self, parameter: IoParameter) -> Result<()> {
        if let Some(&existing) = self.index.get(&parameter.name) {
            if self.parameters[existing] == parameter {
                return Ok(());
            }
            return Err(Error::planning(format!(
                "parameter name '{}' refers to both {} and {}",
                parameter.name, self.parameters[existing].remote, parameter.remote
            )));
        }
        self.index
            .insert(parameter.name.clone(), self.parameters.len());
        self.parameters.push(parameter);
        Ok(())
    }
}

/// A resolved output location on the VM.
struct OutputTarget<'d> {
    absolute: String,
    disk: &'d AttachedDisk,
}

impl OutputTarget<'_> {
    fn local_path(&self) -> &str {
        relative_to(&self.disk.mount_point, &self.absolute)
    }

    fn destination(&self, call_root: &StorageLocation) -> StorageLocation {
        if self.disk.is_working_disk() {
            call_root.resolve(self.local_path())
        } else {
            call_root.resolve(&self.absolute)
        }
    }
}

/// Plans input and output parameters for call attempts.
#[derive(Debug, Clone)]
pub struct IoPlanner {
    resolver: Arc<LocationResolver>,
    log_upload_cadence: Duration,
}

impl IoPlanner {
    /// Creates a planner resolving remote paths through `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<LocationResolver>) -> Self {
        Self {
            resolver,
            log_upload_cadence: Duration::from_secs(60),
        }
    }

    /// Sets how often stdout and stderr are uploaded while the command runs.
    #[must_use]
    pub const fn with_log_upload_cadence(mut self, cadence: Duration) -> Self {
        self.log_upload_cadence = cadence;
        self
    }

    /// The storage location resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<LocationResolver> {
        &self.resolver
    }

    /// Plans every parameter of an attempt.
    ///
    /// # Errors
    ///
    /// Returns a planning error for unplaceable outputs or conflicting
    /// parameter names, or a storage error if an input listing fails.
    #[tracing::instrument(skip_all, fields(call_root = %ctx.call_root))]
    pub async fn plan(
        &self,
        ctx: &PlanContext<'_>,
        inputs: &[InputDeclaration],
        outputs: &[OutputDeclaration],
    ) -> Result<IoPlan> {
        let mut plan = self.plan_outputs(ctx, outputs)?;
        plan.inputs = self.plan_inputs(ctx, inputs).await?;

        let mut names = ParameterSet::default();
        for parameter in plan.inputs.iter().chain(&plan.detritus) {
            if parameter.direction == Direction::Input {
                names.add(parameter.clone())?;
            }
        }
        tracing::debug!(
            inputs = plan.inputs.len(),
            outputs = plan.outputs.len(),
            "planned attempt parameters"
        );
        Ok(plan)
    }

    /// Plans outputs and detritus only.
    ///
    /// Used after reconnecting to a run, where inputs were already copied.
    ///
    /// # Errors
    ///
    /// Returns a planning error for unplaceable outputs or conflicting
    /// parameter names.
    pub fn plan_outputs(
        &self,
        ctx: &PlanContext<'_>,
        outputs: &[OutputDeclaration],
    ) -> Result<IoPlan> {
        let working = ctx.working_disk()?;
        let mut planned = ParameterSet::default();

        for declaration in outputs {
            for file in &declaration.files {
                let mut references = Vec::new();
                flatten_listing(&file.reference, &mut references);
                for reference in references {
                    for parameter in self.output_parameters(ctx, working, reference, file)? {
                        planned.add(parameter)?;
                    }
                }
            }
        }

        let detritus = self.detritus(ctx, working);
        let mut all = ParameterSet::default();
        for parameter in planned.parameters.iter().chain(&detritus) {
            if parameter.direction == Direction::Output {
                all.add(parameter.clone())?;
            }
        }

        Ok(IoPlan {
            inputs: Vec::new(),
            outputs: planned.parameters,
            detritus,
        })
    }

    fn resolve_output<'d>(&self, ctx: &PlanContext<'d>, path: &str) -> Result<OutputTarget<'d>> {
        let working = ctx.working_disk()?;
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", working.mount_point.trim_end_matches('/'))
        };
        let absolute = normalize_absolute(&joined)?;

        let disk = ctx
            .disks
            .iter()
            .filter(|d| mount_contains(&d.mount_point, &absolute))
            .max_by_key(|d| d.mount_point.len())
            .ok_or_else(|| {
                Error::planning(format!("output '{absolute}' is not on any attached disk"))
            })?;

        if relative_to(&disk.mount_point, &absolute).is_empty() {
            return Err(Error::planning(format!(
                "output '{absolute}' is the mount point of disk {}",
                disk.name
            )));
        }
        Ok(OutputTarget { absolute, disk })
    }

    fn output_parameters(
        &self,
        ctx: &PlanContext<'_>,
        working: &AttachedDisk,
        reference: &FileReference,
        file: &OutputFile,
    ) -> Result<Vec<IoParameter>> {
        let output = |name: String, remote: String, local_path: String, disk: &str| IoParameter {
            name: safe_reference_name(&name),
            direction: Direction::Output,
            remote,
            local_path,
            disk: disk.to_string(),
            optional: file.optional,
            secondary: file.secondary,
            upload: None,
        };

        match reference {
            FileReference::SingleFile { path } => {
                if matches!(validate(path), PathValidation::Full { .. }) {
                    return Ok(Vec::new());
                }
                let target = self.resolve_output(ctx, path)?;
                Ok(vec![output(
                    target.absolute.clone(),
                    target.destination(ctx.call_root).uri(),
                    target.local_path().to_string(),
                    &target.disk.name,
                )])
            }
            FileReference::UnlistedDirectory { path } => {
                let target = self.resolve_output(ctx, path)?;
                let destination = target.destination(ctx.call_root);
                let local = target.local_path();
                let listing = IoParameter {
                    optional: false,
                    ..output(
                        format!("{}.list", target.absolute),
                        format!("{destination}.list"),
                        format!("{local}.list"),
                        &target.disk.name,
                    )
                };
                let contents = IoParameter {
                    optional: false,
                    ..output(
                        format!("{}/*", target.absolute),
                        format!("{destination}/"),
                        format!("{local}/*"),
                        &target.disk.name,
                    )
                };
                Ok(vec![listing, contents])
            }
            FileReference::Glob { pattern } => {
                let directory = glob_directory_name(pattern);
                let mount = working.mount_point.trim_end_matches('/');
                let destination = ctx.call_root.resolve(&directory);
                let listing = IoParameter {
                    optional: false,
                    ..output(
                        format!("{mount}/{directory}.list"),
                        format!("{destination}.list"),
                        format!("{directory}.list"),
                        &working.name,
                    )
                };
                let contents = IoParameter {
                    optional: false,
                    ..output(
                        format!("{mount}/{directory}/*"),
                        format!("{destination}/"),
                        format!("{directory}/*"),
                        &working.name,
                    )
                };
                Ok(vec![listing, contents])
            }
            FileReference::ListedDirectory { .. } => Err(Error::planning(
                "listed directories must be flattened before planning",
            )),
        }
    }

    fn detritus(&self, ctx: &PlanContext<'_>, working: &AttachedDisk) -> Vec<IoParameter> {
        let parameter = |name: &str, direction: Direction, remote: String, local: &str| IoParameter {
            name: name.to_string(),
            direction,
            remote,
            local_path: local.to_string(),
            disk: working.name.clone(),
            optional: false,
            secondary: false,
            upload: None,
        };
        let log_upload = Some(UploadPolicy {
            cadence: self.log_upload_cadence,
            content_type: LOG_CONTENT_TYPE.to_string(),
        });

        let mut parameters = vec![parameter(
            detritus::EXEC,
            Direction::Input,
            ctx.call_root.resolve(detritus::SCRIPT_FILE).uri(),
            detritus::SCRIPT_FILE,
        )];
        if let Some(monitoring) = ctx.monitoring_script {
            parameters.push(parameter(
                detritus::MONITORING,
                Direction::Input,
                monitoring.uri(),
                detritus::MONITORING_FILE,
            ));
        }
        parameters.push(parameter(
            detritus::RETURN_CODE,
            Direction::Output,
            ctx.call_root.resolve(detritus::RETURN_CODE).uri(),
            detritus::RETURN_CODE,
        ));
        for log in [detritus::STDOUT, detritus::STDERR] {
            parameters.push(IoParameter {
                upload: log_upload.clone(),
                ..parameter(
                    log,
                    Direction::Output,
                    ctx.call_root.resolve(log).uri(),
                    log,
                )
            });
        }
        parameters
    }

    async fn expand_input(&self, reference: &FileReference) -> Result<Vec<StorageLocation>> {
        match reference {
            FileReference::SingleFile { path } => Ok(vec![self.resolver.build(path).await?]),
            FileReference::UnlistedDirectory { path } => {
                Ok(self.resolver.build(path).await?.list().await?)
            }
            FileReference::Glob { pattern } => {
                let wildcard = pattern.find(['*', '?']).unwrap_or(pattern.len());
                let directory = pattern
                    .get(..wildcard)
                    .and_then(|prefix| prefix.rfind('/'))
                    .and_then(|slash| pattern.get(..slash))
                    .unwrap_or(pattern);
                let matcher = glob_regex(pattern)?;
                let listed = self.resolver.build(directory).await?.list().await?;
                Ok(listed
                    .into_iter()
                    .filter(|location| matcher.is_match(&location.uri()))
                    .collect())
            }
            FileReference::ListedDirectory { .. } => Err(Error::planning(
                "listed directories must be flattened before expansion",
            )),
        }
    }

    async fn plan_inputs(
        &self,
        ctx: &PlanContext<'_>,
        inputs: &[InputDeclaration],
    ) -> Result<Vec<IoParameter>> {
        let working = ctx.working_disk()?;
        let mut planned = ParameterSet::default();

        for input in inputs.iter().filter(|i| i.localize) {
            let mut references = Vec::new();
            flatten_listing(&input.reference, &mut references);

            for reference in references {
                for location in self.expand_input(reference).await? {
                    let stripped = scheme_stripped(&location);
                    let local_path = if input.ad_hoc {
                        base_name(&stripped).to_string()
                    } else {
                        stripped
                    };
                    planned.add(IoParameter {
                        name: safe_reference_name(&local_path),
                        direction: Direction::Input,
                        remote: location.uri(),
                        local_path,
                        disk: working.name.clone(),
                        optional: false,
                        secondary: false,
                        upload: None,
                    })?;
                }
            }
        }
        Ok(planned.parameters)
    }

    async fn map_file(
        &self,
        plan: &IoPlan,
        ctx: &PlanContext<'_>,
        reference: &FileReference,
        file: &OutputFile,
    ) -> Result<Vec<OutputValue>> {
        let working = ctx.working_disk()?;
        let lookup = |natural: &str| {
            plan.output(&safe_reference_name(natural)).ok_or_else(|| {
                Error::planning(format!("output '{natural}' is not part of the submitted plan"))
            })
        };

        match reference {
            FileReference::SingleFile { path } => {
                if matches!(validate(path), PathValidation::Full { .. }) {
                    return Ok(vec![OutputValue::File(path.clone())]);
                }
                let target = self.resolve_output(ctx, path)?;
                let parameter = lookup(&target.absolute)?;
                let location = self.resolver.build(&parameter.remote).await?;
                if location.exists().await? {
                    Ok(vec![OutputValue::File(parameter.remote.clone())])
                } else if file.optional {
                    Ok(vec![OutputValue::Missing(parameter.remote.clone())])
                } else {
                    Err(Error::planning(format!(
                        "required output '{path}' was not produced at {}",
                        parameter.remote
                    )))
                }
            }
            FileReference::UnlistedDirectory { path } => {
                let target = self.resolve_output(ctx, path)?;
                let parameter = lookup(&format!("{}/*", target.absolute))?;
                Ok(vec![OutputValue::Directory(
                    parameter.remote.trim_end_matches('/').to_string(),
                )])
            }
            FileReference::Glob { pattern } => {
                let directory = glob_directory_name(pattern);
                let mount = working.mount_point.trim_end_matches('/');
                let listing = lookup(&format!("{mount}/{directory}.list"))?;
                let contents = self.resolver.build(&listing.remote).await?.read_to_string().await?;
                let glob_root = ctx.call_root.resolve(&directory);
                Ok(contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| line.trim_start_matches("./"))
                    .map(|line| OutputValue::File(glob_root.resolve(line).uri()))
                    .collect())
            }
            FileReference::ListedDirectory { .. } => Err(Error::planning(
                "listed directories must be flattened before mapping",
            )),
        }
    }

    /// Maps declared outputs to their remote values after a successful run.
    ///
    /// # Errors
    ///
    /// Returns an error if a required file is missing, a glob listing cannot
    /// be read, or an output is not part of `plan`.
    pub async fn map_outputs(
        &self,
        plan: &IoPlan,
        ctx: &PlanContext<'_>,
        outputs: &[OutputDeclaration],
    ) -> Result<Vec<MappedOutput>> {
        let mut mapped = Vec::with_capacity(outputs.len());
        for declaration in outputs {
            let mut values = Vec::new();
            for file in &declaration.files {
                let mut references = Vec::new();
                flatten_listing(&file.reference, &mut references);
                for reference in references {
                    values.extend(self.map_file(plan, ctx, reference, file).await?);
                }
            }
            mapped.push(MappedOutput {
                name: declaration.name.clone(),
                values,
            });
        }
        Ok(mapped)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::{DiskType, WORKING_DISK_NAME};
    use async_trait::async_trait;
    use bytes::Bytes;
    use cirro_core::location::BucketMetadataSource;
    use cirro_core::storage::MemoryBackend;

    struct NoRequesterPays;

    #[async_trait]
    impl BucketMetadataSource for NoRequesterPays {
        async fn requester_pays(&self, _bucket: &str) -> cirro_core::Result<bool> {
            Ok(false)
        }
    }

    fn planner() -> IoPlanner {
        IoPlanner::new(Arc::new(LocationResolver::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(NoRequesterPays),
        )))
    }

    fn disks() -> Vec<AttachedDisk> {
        vec![
            AttachedDisk {
                name: WORKING_DISK_NAME.into(),
                mount_point: "/mnt/data".into(),
                size_gb: 10,
                disk_type: DiskType::Ssd,
            },
            AttachedDisk {
                name: "disk-1".into(),
                mount_point: "/mnt/data/ref".into(),
                size_gb: 20,
                disk_type: DiskType::Hdd,
            },
            AttachedDisk {
                name: "disk-2".into(),
                mount_point: "/scratch".into(),
                size_gb: 50,
                disk_type: DiskType::Hdd,
            },
        ]
    }

    async fn call_root(planner: &IoPlanner) -> StorageLocation {
        planner.resolver().build("gs://bucket/wf/call").await.unwrap()
    }

    #[test]
    fn safe_names_hash_long_values() {
        let short = "a".repeat(MAX_REFERENCE_NAME_LEN);
        assert_eq!(safe_reference_name(&short), short);

        let long = "a".repeat(MAX_REFERENCE_NAME_LEN + 1);
        let hashed = safe_reference_name(&long);
        assert_eq!(hashed.len(), 64);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hashed, safe_reference_name(&long));
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize_absolute("/a/./b/../c//d").unwrap(), "/a/c/d");
        assert_eq!(normalize_absolute("/").unwrap(), "/");
        assert!(normalize_absolute("/a/../..").is_err());
        assert!(normalize_absolute("relative").is_err());
    }

    #[test]
    fn glob_regex_matches_single_segment() {
        let re = glob_regex("gs://b/dir/foo*.tx?").unwrap();
        assert!(re.is_match("gs://b/dir/foo1.txt"));
        assert!(re.is_match("gs://b/dir/foo.txt"));
        assert!(!re.is_match("gs://b/dir/sub/foo1.txt"));
        assert!(!re.is_match("gs://b/dir/bar.txt"));
    }

    #[tokio::test]
    async fn relative_output_lands_under_call_root() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [OutputDeclaration::single(
            "out",
            OutputFile::required(FileReference::file("results/out.txt")),
        )];

        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();
        let parameter = plan.output("/mnt/data/results/out.txt").unwrap();
        assert_eq!(parameter.remote, "gs://bucket/wf/call/results/out.txt");
        assert_eq!(parameter.local_path, "results/out.txt");
        assert_eq!(parameter.disk, WORKING_DISK_NAME);
    }

    #[tokio::test]
    async fn longest_mount_prefix_wins() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [
            OutputDeclaration::single(
                "indexed",
                OutputFile::required(FileReference::file("/mnt/data/ref/../ref/idx.bai")),
            ),
            OutputDeclaration::single(
                "scratch",
                OutputFile::optional(FileReference::file("/scratch/tmp.bin")),
            ),
        ];

        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();
        let indexed = plan.output("/mnt/data/ref/idx.bai").unwrap();
        assert_eq!(indexed.disk, "disk-1");
        assert_eq!(indexed.local_path, "idx.bai");
        assert_eq!(indexed.remote, "gs://bucket/wf/call/mnt/data/ref/idx.bai");

        let scratch = plan.output("/scratch/tmp.bin").unwrap();
        assert_eq!(scratch.disk, "disk-2");
        assert!(scratch.optional);
        assert_eq!(scratch.remote, "gs://bucket/wf/call/scratch/tmp.bin");
    }

    #[tokio::test]
    async fn output_off_every_disk_is_rejected() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [OutputDeclaration::single(
            "etc",
            OutputFile::required(FileReference::file("/etc/passwd")),
        )];
        assert!(matches!(
            planner.plan_outputs(&ctx, &outputs),
            Err(Error::Planning { .. })
        ));
    }

    #[tokio::test]
    async fn glob_and_directory_outputs() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [
            OutputDeclaration::single("texts", OutputFile::optional(FileReference::glob("foo*.txt"))),
            OutputDeclaration::single("dir", OutputFile::required(FileReference::directory("outdir"))),
        ];

        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();
        assert_eq!(plan.outputs.len(), 4);

        let glob_dir = glob_directory_name("foo*.txt");
        let listing = plan.output(&format!("/mnt/data/{glob_dir}.list")).unwrap();
        assert_eq!(listing.remote, format!("gs://bucket/wf/call/{glob_dir}.list"));
        assert!(!listing.optional);
        let contents = plan.output(&format!("/mnt/data/{glob_dir}/*")).unwrap();
        assert_eq!(contents.local_path, format!("{glob_dir}/*"));
        assert!(!contents.optional);

        let dir_list = plan.output("/mnt/data/outdir.list").unwrap();
        assert_eq!(dir_list.remote, "gs://bucket/wf/call/outdir.list");
        let dir_contents = plan.output("/mnt/data/outdir/*").unwrap();
        assert_eq!(dir_contents.remote, "gs://bucket/wf/call/outdir/");
    }

    #[tokio::test]
    async fn duplicate_outputs_collapse() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let file = OutputFile::required(FileReference::file("a.txt"));
        let outputs = [
            OutputDeclaration::single("first", file.clone()),
            OutputDeclaration::single("second", file),
        ];
        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();
        assert_eq!(plan.outputs.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_outputs_are_rejected() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [
            OutputDeclaration::single("first", OutputFile::required(FileReference::file("a.txt"))),
            OutputDeclaration::single("second", OutputFile::optional(FileReference::file("./a.txt"))),
        ];
        assert!(matches!(
            planner.plan_outputs(&ctx, &outputs),
            Err(Error::Planning { .. })
        ));
    }

    #[tokio::test]
    async fn detritus_parameters() {
        let planner = planner().with_log_upload_cadence(Duration::from_secs(30));
        let root = call_root(&planner).await;
        let monitoring = planner
            .resolver()
            .build("gs://tools/monitor.sh")
            .await
            .unwrap();
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: Some(&monitoring),
        };

        let plan = planner.plan_outputs(&ctx, &[]).unwrap();
        let names: Vec<&str> = plan.detritus.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["exec", "monitoring", "rc", "stdout", "stderr"]);

        assert_eq!(plan.detritus("exec").unwrap().remote, "gs://bucket/wf/call/script");
        let stderr = plan.detritus("stderr").unwrap();
        assert_eq!(stderr.remote, "gs://bucket/wf/call/stderr");
        let upload = stderr.upload.as_ref().unwrap();
        assert_eq!(upload.cadence, Duration::from_secs(30));
        assert_eq!(upload.content_type, LOG_CONTENT_TYPE);
        assert!(plan.detritus("rc").unwrap().upload.is_none());
        assert_eq!(plan.all_inputs().count(), 2);
        assert_eq!(plan.all_outputs().count(), 3);
    }

    #[tokio::test]
    async fn inputs_are_expanded_and_named_by_local_path() {
        let backend = Arc::new(MemoryBackend::new());
        let resolver = Arc::new(LocationResolver::new(
            backend.clone(),
            Arc::new(NoRequesterPays),
        ));
        let planner = IoPlanner::new(resolver.clone());
        for name in ["ref/a.fa", "ref/b.fa", "ref/sub/c.fa", "reads/r1.fq", "reads/r2.fq", "reads/notes.md"] {
            resolver
                .build(&format!("gs://inputs/{name}"))
                .await
                .unwrap()
                .write(Bytes::from("x"), None)
                .await
                .unwrap();
        }
        let root = resolver.build("gs://bucket/wf/call").await.unwrap();
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };

        let inputs = [
            InputDeclaration::new("reference", FileReference::directory("gs://inputs/ref")),
            InputDeclaration::new("reads", FileReference::glob("gs://inputs/reads/r?.fq")),
            InputDeclaration {
                ad_hoc: true,
                ..InputDeclaration::new("notes", FileReference::file("gs://inputs/reads/notes.md"))
            },
            InputDeclaration {
                localize: false,
                ..InputDeclaration::new("streamed", FileReference::file("gs://inputs/ref/a.fa"))
            },
            InputDeclaration::new(
                "listed",
                FileReference::ListedDirectory {
                    path: "gs://inputs/ref".into(),
                    listing: vec![FileReference::file("gs://inputs/ref/a.fa")],
                },
            ),
        ];

        let plan = planner.plan(&ctx, &inputs, &[]).await.unwrap();
        let locals: Vec<&str> = plan.inputs.iter().map(|p| p.local_path.as_str()).collect();
        assert_eq!(
            locals,
            vec![
                "inputs/ref/a.fa",
                "inputs/ref/b.fa",
                "inputs/ref/sub/c.fa",
                "inputs/reads/r1.fq",
                "inputs/reads/r2.fq",
                "notes.md",
            ]
        );
        assert_eq!(plan.inputs[0].name, "inputs/ref/a.fa");
        assert_eq!(plan.inputs[0].remote, "gs://inputs/ref/a.fa");
    }

    #[tokio::test]
    async fn map_outputs_after_success() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [
            OutputDeclaration::single("out", OutputFile::required(FileReference::file("out.txt"))),
            OutputDeclaration::single("maybe", OutputFile::optional(FileReference::file("maybe.txt"))),
            OutputDeclaration::single("texts", OutputFile::required(FileReference::glob("*.txt"))),
            OutputDeclaration::single("dir", OutputFile::required(FileReference::directory("outdir"))),
        ];
        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();

        root.resolve("out.txt").write(Bytes::from("1"), None).await.unwrap();
        let glob_dir = glob_directory_name("*.txt");
        root.resolve(&format!("{glob_dir}.list"))
            .write(Bytes::from("out.txt\nother.txt\n./nested/deep.txt\n"), None)
            .await
            .unwrap();

        let mapped = planner.map_outputs(&plan, &ctx, &outputs).await.unwrap();
        assert_eq!(
            mapped[0].values,
            vec![OutputValue::File("gs://bucket/wf/call/out.txt".into())]
        );
        assert_eq!(
            mapped[1].values,
            vec![OutputValue::Missing("gs://bucket/wf/call/maybe.txt".into())]
        );
        assert_eq!(
            mapped[2].values,
            vec![
                OutputValue::File(format!("gs://bucket/wf/call/{glob_dir}/out.txt")),
                OutputValue::File(format!("gs://bucket/wf/call/{glob_dir}/other.txt")),
                OutputValue::File(format!("gs://bucket/wf/call/{glob_dir}/nested/deep.txt")),
            ]
        );
        assert_eq!(
            mapped[3].values,
            vec![OutputValue::Directory("gs://bucket/wf/call/outdir".into())]
        );
    }

    #[tokio::test]
    async fn missing_required_output_fails_mapping() {
        let planner = planner();
        let root = call_root(&planner).await;
        let disks = disks();
        let ctx = PlanContext {
            call_root: &root,
            disks: &disks,
            monitoring_script: None,
        };
        let outputs = [OutputDeclaration::single(
            "out",
            OutputFile::required(FileReference::file("out.txt")),
        )];
        let plan = planner.plan_outputs(&ctx, &outputs).unwrap();
        assert!(planner.map_outputs(&plan, &ctx, &outputs).await.is_err());
    }
}
