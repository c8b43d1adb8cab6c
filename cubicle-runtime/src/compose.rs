//! Compose CLI runtime driver.
//!
//! Drives one compose project per VM through the container runtime's command
//! line: the project and container are both named `sandbox-vm-<id>`, and the
//! descriptor written by [`DescriptorStore`] is passed with `-f`.
//!
//! Every invocation is bounded by a timeout and killed on expiry.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use cubicle_core::VmId;

use crate::descriptor::DescriptorStore;
use crate::{RuntimeDriver, RuntimeError, RuntimeHandle, RuntimeOp};

/// Default bound for start/stop/create/destroy invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound for image builds.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(900);

/// stderr fragments meaning the runtime daemon cannot be reached.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "cannot connect to podman",
    "permission denied while trying to connect",
    "connection refused",
];

/// stderr fragments meaning the instance does not exist.
const NOT_FOUND_MARKERS: &[&str] = &[
    "no such container",
    "no such service",
    "no such project",
    "no container found",
    "has no container",
    "no containers to start",
];

/// Runtime driver backed by a compose-compatible CLI.
#[derive(Debug, Clone)]
pub struct ComposeDriver {
    /// Runtime executable, e.g. `docker` or `podman`.
    program: PathBuf,

    /// Arguments placed before everything else, e.g. `["compose"]`.
    program_args: Vec<String>,

    /// Where per-VM descriptors live.
    descriptors: DescriptorStore,

    command_timeout: Duration,
    build_timeout: Duration,
}

impl ComposeDriver {
    /// Create a driver invoking `program` with the given leading arguments.
    #[must_use]
    pub fn new(program: PathBuf, program_args: Vec<String>, descriptors: DescriptorStore) -> Self {
        Self {
            program,
            program_args,
            descriptors,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    /// Create a driver for `docker compose` with default timeouts.
    #[must_use]
    pub fn docker(descriptors: DescriptorStore) -> Self {
        Self::new(PathBuf::from("docker"), vec!["compose".to_owned()], descriptors)
    }

    /// Override the invocation timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, command_timeout: Duration, build_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self.build_timeout = build_timeout;
        self
    }

    /// Full argument list for one compose invocation.
    fn command_args(&self, id: VmId, descriptor: Option<&Path>, subcommand: &[&str]) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.program_args.iter().map(OsString::from).collect();
        if let Some(path) = descriptor {
            args.push("-f".into());
            args.push(path.as_os_str().to_owned());
        }
        args.push("-p".into());
        args.push(id.instance_name().into());
        args.extend(subcommand.iter().map(OsString::from));
        args
    }

    /// The descriptor path for `id`, if the file is still present.
    async fn existing_descriptor(&self, id: VmId) -> Option<PathBuf> {
        let path = self.descriptors.path_for(id);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Run one compose invocation and classify its failure.
    async fn invoke(
        &self,
        id: VmId,
        op: RuntimeOp,
        descriptor: Option<&Path>,
        subcommand: &[&str],
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let instance = id.instance_name();
        let args = self.command_args(id, descriptor, subcommand);

        tracing::info!(
            vm_id = %id,
            %op,
            %instance,
            step = subcommand.first().copied().unwrap_or_default(),
            "invoking container runtime"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(self.descriptors.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.spawn_error(id, op, &e)),
            Err(_) => {
                tracing::warn!(vm_id = %id, %op, %instance, timeout_s = timeout.as_secs(), "runtime command timed out");
                return Err(RuntimeError::Timeout { vm_id: id, op, after: timeout });
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        tracing::debug!(vm_id = %id, %op, code = ?output.status.code(), %stderr, "runtime command failed");
        Err(classify(id, op, &stderr))
    }

    fn spawn_error(&self, id: VmId, op: RuntimeOp, err: &std::io::Error) -> RuntimeError {
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => RuntimeError::RuntimeUnavailable {
                reason: format!("cannot execute {}: {err}", self.program.display()),
            },
            _ => RuntimeError::Unknown {
                vm_id: id,
                op,
                stderr: format!("spawn {}: {err}", self.program.display()),
            },
        }
    }
}

/// Map a failed invocation's stderr to a [`RuntimeError`].
pub(crate) fn classify(id: VmId, op: RuntimeOp, stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return RuntimeError::RuntimeUnavailable { reason: stderr.to_owned() };
    }
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return RuntimeError::NotFound { vm_id: id };
    }
    RuntimeError::Unknown { vm_id: id, op, stderr: stderr.to_owned() }
}

#[async_trait]
impl RuntimeDriver for ComposeDriver {
    async fn create(&self, id: VmId, descriptor: &Path) -> Result<RuntimeHandle, RuntimeError> {
        self.invoke(id, RuntimeOp::Create, Some(descriptor), &["build"], self.build_timeout)
            .await
            .map_err(|e| match e {
                RuntimeError::Unknown { vm_id, stderr, .. } => RuntimeError::BuildFailed { vm_id, stderr },
                other => other,
            })?;

        self.invoke(
            id,
            RuntimeOp::Create,
            Some(descriptor),
            &["up", "--no-start"],
            self.command_timeout,
        )
        .await?;

        tracing::info!(vm_id = %id, instance = %id.instance_name(), "runtime instance created (stopped)");
        Ok(RuntimeHandle::new(id, descriptor.to_path_buf()))
    }

    async fn start(&self, id: VmId) -> Result<(), RuntimeError> {
        let Some(descriptor) = self.existing_descriptor(id).await else {
            return Err(RuntimeError::NotFound { vm_id: id });
        };
        self.invoke(id, RuntimeOp::Start, Some(&descriptor), &["start"], self.command_timeout)
            .await
    }

    async fn stop(&self, id: VmId) -> Result<(), RuntimeError> {
        let descriptor = self.existing_descriptor(id).await;
        match self
            .invoke(id, RuntimeOp::Stop, descriptor.as_deref(), &["stop"], self.command_timeout)
            .await
        {
            Err(RuntimeError::NotFound { .. }) => {
                tracing::warn!(vm_id = %id, instance = %id.instance_name(), "stop: no runtime instance, treating as stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn destroy(&self, id: VmId) -> Result<(), RuntimeError> {
        let descriptor = self.existing_descriptor(id).await;
        match self
            .invoke(
                id,
                RuntimeOp::Destroy,
                descriptor.as_deref(),
                &["down", "--volumes", "--remove-orphans"],
                self.command_timeout,
            )
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound { .. }) => {
                tracing::warn!(vm_id = %id, instance = %id.instance_name(), "destroy: no runtime instance to remove");
            }
            Err(e) => return Err(e),
        }

        self.descriptors.remove(id).await.map_err(|e| RuntimeError::Unknown {
            vm_id: id,
            op: RuntimeOp::Destroy,
            stderr: e.to_string(),
        })?;

        tracing::info!(vm_id = %id, instance = %id.instance_name(), "runtime instance destroyed");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RuntimeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.program_args)
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| RuntimeError::RuntimeUnavailable {
                reason: format!("{} version timed out", self.program.display()),
            })?
            .map_err(|e| RuntimeError::RuntimeUnavailable {
                reason: format!("cannot execute {}: {e}", self.program.display()),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::RuntimeUnavailable {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}
