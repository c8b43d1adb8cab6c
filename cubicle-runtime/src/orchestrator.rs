//! Lifecycle orchestrator.
//!
//! Sequences the endpoint allocator, descriptor generator, runtime driver and
//! record store for each VM:
//!
//! ```text
//! Absent --create--> Stopped <--start/stop--> Running
//!    ^                  |                        |
//!    +-----delete-------+------------------------+
//! ```
//!
//! Every mutating operation holds the VM's lock from the first record read to
//! the last record write, so the runtime driver never sees two calls for the
//! same VM at once. Creates additionally hold the owner's lock, which makes the
//! quota check and the insert one step.
//!
//! The record store is the only place status is kept; nothing here caches it.

use serde::Serialize;

use cubicle_core::{CoreError, EndpointPair, OwnerId, PortLayout, Vm, VmId, VmName, VmStatus};

use crate::descriptor::{DescriptorStore, IsolationTemplate};
use crate::locks::LockArena;
use crate::{OrchestratorError, RuntimeDriver, RuntimeError, RuntimeOp, VmStore};

/// Maximum number of VMs one owner may define.
pub const DEFAULT_QUOTA: usize = 3;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OrchestratorSettings {
    /// Per-owner VM limit.
    pub quota: usize,

    /// Endpoint derivation offsets.
    pub ports: PortLayout,

    /// Host name put into console URLs.
    pub public_host: String,
}

impl OrchestratorSettings {
    /// Settings with an explicit quota, port layout and console host.
    #[must_use]
    pub fn new(quota: usize, ports: PortLayout, public_host: impl Into<String>) -> Self {
        Self {
            quota,
            ports,
            public_host: public_host.into(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA, PortLayout::default(), "localhost")
    }
}

/// A VM record together with its derived endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmView {
    /// The persisted record.
    #[serde(flatten)]
    pub vm: Vm,

    /// Host ports, absent if the id falls outside the current port layout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointPair>,

    /// Browser URL of the remote display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,
}

/// Per-VM state machine over a [`VmStore`] and a [`RuntimeDriver`].
pub struct VmOrchestrator<S: VmStore, D: RuntimeDriver> {
    store: S,
    driver: D,
    descriptors: DescriptorStore,
    template: IsolationTemplate,
    settings: OrchestratorSettings,
    vm_locks: LockArena<VmId>,
    owner_locks: LockArena<OwnerId>,
}

impl<S: VmStore, D: RuntimeDriver> VmOrchestrator<S, D> {
    /// Create an orchestrator. `descriptors` must point at the same directory
    /// the driver reads descriptors from.
    #[must_use]
    pub fn new(
        store: S,
        driver: D,
        descriptors: DescriptorStore,
        template: IsolationTemplate,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            driver,
            descriptors,
            template,
            settings,
            vm_locks: LockArena::new(),
            owner_locks: LockArena::new(),
        }
    }

    /// Borrow the record store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume the orchestrator, returning its record store.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Borrow the runtime driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Create a VM for `owner`, leaving it stopped.
    ///
    /// On any failure after the record is inserted, the record, the descriptor
    /// and any runtime instance are removed again before the error is returned.
    ///
    /// # Errors
    /// - [`OrchestratorError::Validation`] for a bad name (no side effects).
    /// - [`OrchestratorError::QuotaExceeded`] if `owner` is at the limit (no side effects).
    /// - [`OrchestratorError::NotFoundOrUnauthorized`] if the new record was
    ///   deleted before creation finished; nothing was written for it.
    /// - [`OrchestratorError::CapacityExhausted`], [`OrchestratorError::Descriptor`]
    ///   or [`OrchestratorError::Runtime`] after rollback.
    pub async fn create(&self, owner: OwnerId, name: &str) -> Result<VmView, OrchestratorError> {
        let name = VmName::parse(name)?;

        let _owner_guard = self.owner_locks.acquire(owner).await;

        let count = self.store.count_by_owner(owner).await?;
        if count >= self.settings.quota {
            tracing::info!(owner_id = %owner, count, limit = self.settings.quota, "create rejected: quota exceeded");
            return Err(OrchestratorError::QuotaExceeded { owner_id: owner, limit: self.settings.quota });
        }

        let inserted = self.store.insert(owner, &name).await?;
        let _vm_guard = self.vm_locks.acquire(inserted.id).await;

        // The row is visible before the VM lock is held, so another request
        // may have deleted or renamed it in between. Continue from what is
        // stored now.
        let vm = match self.store.get(inserted.id).await {
            Ok(Some(vm)) if vm.is_owned_by(owner) => vm,
            Ok(_) => {
                tracing::warn!(vm_id = %inserted.id, owner_id = %owner, "VM record removed before create finished");
                return Err(OrchestratorError::NotFoundOrUnauthorized { vm_id: inserted.id });
            }
            Err(e) => {
                self.rollback_create(&inserted, false).await;
                return Err(e.into());
            }
        };

        tracing::info!(vm_id = %vm.id, owner_id = %owner, name = %vm.name, "VM record inserted");

        let endpoints = match self.settings.ports.allocate(vm.id) {
            Ok(endpoints) => endpoints,
            Err(source) => {
                self.rollback_create(&vm, false).await;
                return Err(OrchestratorError::CapacityExhausted { vm_id: vm.id, source });
            }
        };

        let descriptor = match self.write_descriptor(&vm, endpoints).await {
            Ok(path) => path,
            Err(e) => {
                self.rollback_create(&vm, false).await;
                return Err(e);
            }
        };

        if let Err(source) = self.driver.create(vm.id, &descriptor).await {
            tracing::warn!(vm_id = %vm.id, error = %source, "runtime create failed, rolling back");
            self.rollback_create(&vm, true).await;
            return Err(OrchestratorError::Runtime { op: RuntimeOp::Create, source });
        }

        tracing::info!(
            vm_id = %vm.id,
            display_port = endpoints.display_port,
            control_port = endpoints.control_port,
            "VM created"
        );
        Ok(self.view(vm))
    }

    /// Drive a VM to `target`. Calling it with the current status is a no-op
    /// that does not touch the runtime.
    ///
    /// # Errors
    /// - [`OrchestratorError::NotFoundOrUnauthorized`] if the VM is absent or not `owner`'s.
    /// - [`OrchestratorError::InconsistentState`] if the descriptor has vanished.
    /// - [`OrchestratorError::Runtime`] if the driver fails; the record is unchanged.
    pub async fn set_status(
        &self,
        vm_id: VmId,
        owner: OwnerId,
        target: VmStatus,
    ) -> Result<VmView, OrchestratorError> {
        let _guard = self.vm_locks.acquire(vm_id).await;
        let mut vm = self.owned(vm_id, owner).await?;

        if vm.status == target {
            tracing::debug!(vm_id = %vm_id, status = %target, "status unchanged, skipping runtime");
            return Ok(self.view(vm));
        }

        if !self.descriptors.exists(vm_id).await? {
            let reason = format!(
                "record says {} but descriptor {} is missing",
                vm.status,
                self.descriptors.path_for(vm_id).display()
            );
            tracing::error!(vm_id = %vm_id, instance = %vm_id.instance_name(), %reason, "inconsistent VM state");
            return Err(OrchestratorError::InconsistentState { vm_id, reason });
        }

        let (op, result) = match target {
            VmStatus::Running => (RuntimeOp::Start, self.driver.start(vm_id).await),
            VmStatus::Stopped => (RuntimeOp::Stop, self.driver.stop(vm_id).await),
        };
        if let Err(source) = result {
            tracing::warn!(vm_id = %vm_id, %op, error = %source, "runtime transition failed, record unchanged");
            return Err(OrchestratorError::Runtime { op, source });
        }

        match self.store.update_status(vm_id, target).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!("record vanished after runtime {op}");
                tracing::error!(vm_id = %vm_id, %reason, "inconsistent VM state");
                return Err(OrchestratorError::InconsistentState { vm_id, reason });
            }
            Err(e) => {
                tracing::error!(
                    vm_id = %vm_id,
                    %op,
                    error = %e,
                    "runtime transition succeeded but status was not persisted"
                );
                return Err(e.into());
            }
        }

        tracing::info!(vm_id = %vm_id, status = %target, "VM status changed");
        vm.status = target;
        Ok(self.view(vm))
    }

    /// Rename a VM. Touches only the record.
    ///
    /// # Errors
    /// [`OrchestratorError::Validation`] for a bad name,
    /// [`OrchestratorError::NotFoundOrUnauthorized`] if the VM is absent or not `owner`'s.
    pub async fn rename(&self, vm_id: VmId, owner: OwnerId, name: &str) -> Result<VmView, OrchestratorError> {
        let name = VmName::parse(name)?;
        let _guard = self.vm_locks.acquire(vm_id).await;
        let mut vm = self.owned(vm_id, owner).await?;

        if !self.store.update_name(vm_id, &name).await? {
            return Err(OrchestratorError::NotFoundOrUnauthorized { vm_id });
        }
        tracing::info!(vm_id = %vm_id, name = %name, "VM renamed");
        vm.name = name;
        Ok(self.view(vm))
    }

    /// Delete a VM: the record first, then the runtime instance.
    ///
    /// The record is gone once this returns `Ok`, even if runtime teardown
    /// failed; such an instance is logged with `orphaned = true` for
    /// out-of-band cleanup.
    ///
    /// # Errors
    /// [`OrchestratorError::NotFoundOrUnauthorized`] if the VM is absent or not `owner`'s.
    pub async fn delete(&self, vm_id: VmId, owner: OwnerId) -> Result<Vm, OrchestratorError> {
        let _guard = self.vm_locks.acquire(vm_id).await;
        let vm = self.owned(vm_id, owner).await?;

        if !self.store.delete(vm_id).await? {
            return Err(OrchestratorError::NotFoundOrUnauthorized { vm_id });
        }
        tracing::info!(vm_id = %vm_id, owner_id = %owner, "VM record deleted");

        if let Err(e) = self.driver.destroy(vm_id).await {
            log_orphan(vm_id, &e);
        }

        Ok(vm)
    }

    /// Fetch one VM owned by `owner`.
    ///
    /// # Errors
    /// [`OrchestratorError::NotFoundOrUnauthorized`] if the VM is absent or not `owner`'s.
    pub async fn get(&self, vm_id: VmId, owner: OwnerId) -> Result<VmView, OrchestratorError> {
        let vm = self.owned(vm_id, owner).await?;
        Ok(self.view(vm))
    }

    /// All VMs of `owner`, ordered by id.
    ///
    /// # Errors
    /// [`OrchestratorError::Store`] if the store fails.
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<VmView>, OrchestratorError> {
        let vms = self.store.list_by_owner(owner).await?;
        Ok(vms.into_iter().map(|vm| self.view(vm)).collect())
    }

    /// Check that the container runtime is reachable.
    ///
    /// # Errors
    /// Propagates [`RuntimeDriver::health_check`] failures.
    pub async fn runtime_health(&self) -> Result<(), RuntimeError> {
        self.driver.health_check().await
    }

    async fn owned(&self, vm_id: VmId, owner: OwnerId) -> Result<Vm, OrchestratorError> {
        match self.store.get(vm_id).await? {
            Some(vm) if vm.is_owned_by(owner) => Ok(vm),
            _ => Err(OrchestratorError::NotFoundOrUnauthorized { vm_id }),
        }
    }

    async fn write_descriptor(
        &self,
        vm: &Vm,
        endpoints: EndpointPair,
    ) -> Result<std::path::PathBuf, OrchestratorError> {
        let bytes = self.template.render(vm.id, &vm.name, endpoints)?;
        Ok(self.descriptors.write(vm.id, &bytes).await?)
    }

    /// Undo a partially created VM. Failures are logged, never returned, so the
    /// caller can surface the first error.
    async fn rollback_create(&self, vm: &Vm, runtime_touched: bool) {
        if runtime_touched {
            if let Err(e) = self.driver.destroy(vm.id).await {
                log_orphan(vm.id, &e);
            }
        }
        if let Err(e) = self.descriptors.remove(vm.id).await {
            tracing::error!(vm_id = %vm.id, error = %e, "rollback: descriptor removal failed");
        }
        match self.store.delete(vm.id).await {
            Ok(_) => tracing::info!(vm_id = %vm.id, "rollback: VM record removed"),
            Err(e) => tracing::error!(vm_id = %vm.id, error = %e, "rollback: VM record removal failed"),
        }
    }

    fn view(&self, vm: Vm) -> VmView {
        let endpoints = match self.settings.ports.allocate(vm.id) {
            Ok(endpoints) => Some(endpoints),
            Err(CoreError::PortSpaceExhausted { .. }) => None,
            Err(e) => {
                tracing::warn!(vm_id = %vm.id, error = %e, "no endpoints for VM");
                None
            }
        };
        let console_url = endpoints.map(|e| e.console_url(&self.settings.public_host));
        VmView { vm, endpoints, console_url }
    }
}

fn log_orphan(vm_id: VmId, error: &RuntimeError) {
    tracing::error!(
        vm_id = %vm_id,
        instance = %vm_id.instance_name(),
        orphaned = true,
        error = %error,
        "runtime teardown failed; instance left without a record"
    );
}
