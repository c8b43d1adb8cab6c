//! VM record store contract and an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use cubicle_core::{OwnerId, Vm, VmId, VmName, VmStatus};

use crate::StoreError;

/// Durable record of logical VMs.
///
/// Every method is atomic with respect to the others for a given row. Ids are
/// assigned in increasing order and never reused, even after deletion.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Insert a new record with status `stopped` and return it.
    async fn insert(&self, owner: OwnerId, name: &VmName) -> Result<Vm, StoreError>;

    /// Fetch one record.
    async fn get(&self, id: VmId) -> Result<Option<Vm>, StoreError>;

    /// All records of `owner`, ordered by id.
    async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<Vm>, StoreError>;

    /// Number of records owned by `owner`.
    async fn count_by_owner(&self, owner: OwnerId) -> Result<usize, StoreError>;

    /// Persist a new status. Returns `false` if the record does not exist.
    async fn update_status(&self, id: VmId, status: VmStatus) -> Result<bool, StoreError>;

    /// Persist a new name. Returns `false` if the record does not exist.
    async fn update_name(&self, id: VmId, name: &VmName) -> Result<bool, StoreError>;

    /// Delete a record. Returns `false` if it did not exist.
    async fn delete(&self, id: VmId) -> Result<bool, StoreError>;
}

#[derive(Debug)]
struct Inner {
    next_id: u32,
    rows: BTreeMap<VmId, Vm>,
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Debug)]
pub struct MemoryVmStore {
    inner: Mutex<Inner>,
}

impl MemoryVmStore {
    /// Create an empty store; the first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                rows: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryVmStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmStore for MemoryVmStore {
    async fn insert(&self, owner: OwnerId, name: &VmName) -> Result<Vm, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = VmId::new(inner.next_id);
        inner.next_id = inner.next_id.checked_add(1).ok_or(StoreError::IdsExhausted)?;
        let vm = Vm::new(id, owner, name.clone(), Utc::now());
        inner.rows.insert(id, vm.clone());
        Ok(vm)
    }

    async fn get(&self, id: VmId) -> Result<Option<Vm>, StoreError> {
        Ok(self.inner.lock().await.rows.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<Vm>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .values()
            .filter(|vm| vm.is_owned_by(owner))
            .cloned()
            .collect())
    }

    async fn count_by_owner(&self, owner: OwnerId) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .values()
            .filter(|vm| vm.is_owned_by(owner))
            .count())
    }

    async fn update_status(&self, id: VmId, status: VmStatus) -> Result<bool, StoreError> {
        Ok(match self.inner.lock().await.rows.get_mut(&id) {
            Some(vm) => {
                vm.status = status;
                true
            }
            None => false,
        })
    }

    async fn update_name(&self, id: VmId, name: &VmName) -> Result<bool, StoreError> {
        Ok(match self.inner.lock().await.rows.get_mut(&id) {
            Some(vm) => {
                vm.name = name.clone();
                true
            }
            None => false,
        })
    }

    async fn delete(&self, id: VmId) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.rows.remove(&id).is_some())
    }
}
