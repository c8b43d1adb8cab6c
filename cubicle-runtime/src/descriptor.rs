//! Isolation descriptor generation.
//!
//! Each VM gets one compose-style YAML file describing a single privileged
//! service. The sandbox runs its own nested process and resource isolation for
//! the guest desktop session, so it needs `privileged: true` and a read-only
//! view of the host control-group filesystem. Both are part of the isolation
//! contract and must stay in the rendered output.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use cubicle_core::endpoint::{INTERNAL_CONTROL_PORT, INTERNAL_DISPLAY_PORT};
use cubicle_core::{EndpointPair, VmId, VmName};

use crate::DescriptorError;

/// Service name used inside every descriptor.
pub const SERVICE_NAME: &str = "desktop";

/// Host path of the control-group filesystem exposed to the sandbox.
const CGROUP_PATH: &str = "/sys/fs/cgroup";

/// In-memory scratch mounts for the sandbox init system.
const SCRATCH_MOUNTS: [&str; 3] = ["/run", "/run/lock", "/tmp"];

/// Fixed inputs shared by every rendered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct IsolationTemplate {
    /// Image tag the service is built as and runs from.
    pub image: String,

    /// Build context directory.
    pub build_context: PathBuf,

    /// Isolation manifest (Dockerfile), relative to the build context.
    pub manifest: PathBuf,
}

impl IsolationTemplate {
    /// Create a template for the given image and build inputs.
    #[must_use]
    pub fn new(image: impl Into<String>, build_context: PathBuf, manifest: PathBuf) -> Self {
        Self {
            image: image.into(),
            build_context,
            manifest,
        }
    }

    /// Render the descriptor for one VM.
    ///
    /// # Errors
    /// Returns [`DescriptorError::Render`] if YAML serialization fails.
    pub fn render(
        &self,
        id: VmId,
        name: &VmName,
        endpoints: EndpointPair,
    ) -> Result<Vec<u8>, DescriptorError> {
        let labels = BTreeMap::from([
            ("cubicle.vm-id".to_owned(), id.to_string()),
            ("cubicle.vm-name".to_owned(), compose_literal(name.as_str())),
        ]);

        let service = Service {
            image: &self.image,
            build: Build {
                context: &self.build_context,
                dockerfile: &self.manifest,
            },
            container_name: id.instance_name(),
            privileged: true,
            labels,
            volumes: vec![Volume {
                kind: "bind",
                source: CGROUP_PATH,
                target: CGROUP_PATH,
                read_only: true,
            }],
            tmpfs: SCRATCH_MOUNTS.to_vec(),
            ports: vec![
                format!("{}:{INTERNAL_DISPLAY_PORT}", endpoints.display_port),
                format!("{}:{INTERNAL_CONTROL_PORT}", endpoints.control_port),
            ],
        };

        let document = ComposeFile {
            services: BTreeMap::from([(SERVICE_NAME, service)]),
        };

        serde_yaml::to_string(&document)
            .map(String::into_bytes)
            .map_err(|source| DescriptorError::Render { vm_id: id, source })
    }
}

#[derive(Serialize)]
struct ComposeFile<'a> {
    services: BTreeMap<&'static str, Service<'a>>,
}

#[derive(Serialize)]
struct Service<'a> {
    image: &'a str,
    build: Build<'a>,
    container_name: String,
    privileged: bool,
    labels: BTreeMap<String, String>,
    volumes: Vec<Volume>,
    tmpfs: Vec<&'static str>,
    ports: Vec<String>,
}

#[derive(Serialize)]
struct Build<'a> {
    context: &'a Path,
    dockerfile: &'a Path,
}

#[derive(Serialize)]
struct Volume {
    #[serde(rename = "type")]
    kind: &'static str,
    source: &'static str,
    target: &'static str,
    read_only: bool,
}

/// Per-VM descriptor files under a single directory.
///
/// Files are keyed by VM id, so operations on distinct VMs never touch the
/// same path.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    dir: PathBuf,
}

impl DescriptorStore {
    /// Create a store rooted at `dir`. Call [`DescriptorStore::ensure_dir`] before use.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Directory holding all descriptors.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the descriptor directory if it is absent.
    ///
    /// # Errors
    /// Returns [`DescriptorError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self) -> Result<(), DescriptorError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| DescriptorError::Io { path: self.dir.clone(), source })
    }

    /// Path of the descriptor for `id` (`descriptor-vm-<id>.yml`).
    #[must_use]
    pub fn path_for(&self, id: VmId) -> PathBuf {
        self.dir.join(format!("descriptor-vm-{id}.yml"))
    }

    /// Write the descriptor for `id`, replacing any previous file.
    ///
    /// The file is written to a temporary sibling and renamed into place, so a
    /// reader never sees a partial descriptor.
    ///
    /// # Errors
    /// Returns [`DescriptorError::Io`] on any filesystem failure.
    pub async fn write(&self, id: VmId, descriptor: &[u8]) -> Result<PathBuf, DescriptorError> {
        let path = self.path_for(id);
        let tmp = self.dir.join(format!(".descriptor-vm-{id}.yml.tmp"));

        tokio::fs::write(&tmp, descriptor)
            .await
            .map_err(|source| DescriptorError::Io { path: tmp.clone(), source })?;

        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DescriptorError::Io { path, source });
        }

        tracing::debug!(vm_id = %id, path = %path.display(), "descriptor written");
        Ok(path)
    }

    /// Remove the descriptor for `id`. A missing file counts as success.
    ///
    /// # Errors
    /// Returns [`DescriptorError::Io`] for failures other than "not found".
    pub async fn remove(&self, id: VmId) -> Result<(), DescriptorError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(vm_id = %id, path = %path.display(), "descriptor removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DescriptorError::Io { path, source }),
        }
    }

    /// Returns `true` if a descriptor exists for `id`.
    ///
    /// # Errors
    /// Returns [`DescriptorError::Io`] if existence cannot be determined.
    pub async fn exists(&self, id: VmId) -> Result<bool, DescriptorError> {
        let path = self.path_for(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| DescriptorError::Io { path, source })
    }
}

/// Compose substitutes `$VAR` inside string values; `$$` is its literal dollar.
fn compose_literal(raw: &str) -> String {
    raw.replace('$', "$$")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> IsolationTemplate {
        IsolationTemplate::new(
            "cubicle-desktop:latest",
            PathBuf::from("/opt/cubicle/image"),
            PathBuf::from("Dockerfile"),
        )
    }

    fn name(raw: &str) -> VmName {
        match VmName::parse(raw) {
            Ok(n) => n,
            Err(e) => panic!("invalid test name: {e}"),
        }
    }

    fn endpoints() -> EndpointPair {
        EndpointPair { display_port: 6087, control_port: 5908 }
    }

    fn render_yaml(id: u32, vm_name: &str) -> serde_yaml::Value {
        let bytes = match template().render(VmId::new(id), &name(vm_name), endpoints()) {
            Ok(b) => b,
            Err(e) => panic!("render failed: {e}"),
        };
        match serde_yaml::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => panic!("rendered descriptor is not valid YAML: {e}"),
        }
    }

    #[test]
    fn render_declares_single_privileged_service() {
        let doc = render_yaml(7, "box1");
        let services = &doc["services"];
        assert_eq!(services.as_mapping().map(serde_yaml::Mapping::len), Some(1));

        let svc = &services[SERVICE_NAME];
        assert_eq!(svc["image"], "cubicle-desktop:latest");
        assert_eq!(svc["container_name"], "sandbox-vm-7");
        assert_eq!(svc["privileged"], true);
        assert_eq!(svc["build"]["context"], "/opt/cubicle/image");
        assert_eq!(svc["build"]["dockerfile"], "Dockerfile");
    }

    #[test]
    fn render_mounts_cgroup_read_only_and_scratch_tmpfs() {
        let doc = render_yaml(7, "box1");
        let svc = &doc["services"][SERVICE_NAME];

        let volume = &svc["volumes"][0];
        assert_eq!(volume["type"], "bind");
        assert_eq!(volume["source"], "/sys/fs/cgroup");
        assert_eq!(volume["target"], "/sys/fs/cgroup");
        assert_eq!(volume["read_only"], true);

        let tmpfs: Vec<&str> = svc["tmpfs"]
            .as_sequence()
            .map(|s| s.iter().filter_map(serde_yaml::Value::as_str).collect())
            .unwrap_or_default();
        assert_eq!(tmpfs, ["/run", "/run/lock", "/tmp"]);
    }

    #[test]
    fn render_maps_allocated_ports_to_fixed_internal_ports() {
        let doc = render_yaml(7, "box1");
        let ports = &doc["services"][SERVICE_NAME]["ports"];
        assert_eq!(ports[0], "6087:6080");
        assert_eq!(ports[1], "5908:5901");
    }

    #[test]
    fn render_escapes_hostile_names() {
        let doc = render_yaml(2, "x: y\" # {evil}");
        let svc = &doc["services"][SERVICE_NAME];
        assert_eq!(svc["labels"]["cubicle.vm-name"], "x: y\" # {evil}");
        assert_eq!(svc["labels"]["cubicle.vm-id"], "2");
        assert_eq!(svc["privileged"], true, "name must not alter other keys");
    }

    #[test]
    fn render_keeps_dollar_signs_out_of_interpolation() {
        let doc = render_yaml(3, "cost $HOME ${PATH:-x} $$");
        let label = &doc["services"][SERVICE_NAME]["labels"]["cubicle.vm-name"];
        assert_eq!(label, "cost $$HOME $${PATH:-x} $$$$");
    }

    #[tokio::test]
    async fn write_then_remove_roundtrip() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = DescriptorStore::new(dir.path().join("descriptors"));
        if let Err(e) = store.ensure_dir().await {
            panic!("ensure_dir failed: {e}");
        }

        let id = VmId::new(4);
        let path = match store.write(id, b"services: {}\n").await {
            Ok(p) => p,
            Err(e) => panic!("write failed: {e}"),
        };
        assert_eq!(path, store.path_for(id));
        assert!(path.ends_with("descriptor-vm-4.yml"));
        assert!(matches!(store.exists(id).await, Ok(true)));

        if let Err(e) = store.remove(id).await {
            panic!("remove failed: {e}");
        }
        assert!(matches!(store.exists(id).await, Ok(false)));
    }

    #[tokio::test]
    async fn remove_missing_descriptor_is_success() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = DescriptorStore::new(dir.path().to_path_buf());
        assert!(store.remove(VmId::new(99)).await.is_ok());
        assert!(store.remove(VmId::new(99)).await.is_ok(), "remove must be idempotent");
    }

    #[tokio::test]
    async fn write_into_missing_directory_reports_io_error() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = DescriptorStore::new(dir.path().join("never-created"));
        let result = store.write(VmId::new(1), b"x").await;
        assert!(matches!(result, Err(DescriptorError::Io { .. })));
    }
}
