//! Process and module enumeration over the handle registry
//!
//! Each walk reconciles the registry with the guest first, takes a sorted
//! snapshot of handles, releases the lock and only then calls the visitor.
//! A process exiting mid-walk makes its handle stop resolving; the walk
//! itself carries on.

use crate::core::types::{
    GuestAddress, MemorySpan, ModuleHandle, ProcessHandle, VmiError, VmiResult,
};
use crate::guest::GuestBackend;
use crate::process::registry::{reconcile_modules, HandleRegistry};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Visitor verdict controlling whether a walk continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    Stop,
}

/// Enumeration engine shared by a core context
pub struct Enumerator {
    registry: Arc<RwLock<HandleRegistry>>,
    backend: Arc<dyn GuestBackend>,
}

impl Enumerator {
    pub fn new(registry: Arc<RwLock<HandleRegistry>>, backend: Arc<dyn GuestBackend>) -> Self {
        Enumerator { registry, backend }
    }

    /// Snapshot of every live process, reconciled with the guest
    pub fn snapshot_processes(&self) -> VmiResult<Vec<ProcessHandle>> {
        let live = self
            .backend
            .running_processes()
            .map_err(|e| VmiError::enumeration_failed(format!("process walk: {}", e)))?;

        let untracked = self.registry.read().untracked(&live);
        let described: Vec<_> = untracked
            .into_iter()
            .filter_map(|guest_id| {
                let descriptor = self.backend.describe_process(guest_id);
                if descriptor.is_none() {
                    debug!("process {} vanished before it could be described", guest_id);
                }
                descriptor.map(|d| (guest_id, d))
            })
            .collect();

        Ok(self.registry.write().sync_processes(&live, described))
    }

    /// Presents each live process handle to `visitor`
    pub fn list_processes<F>(&self, mut visitor: F) -> VmiResult<()>
    where
        F: FnMut(ProcessHandle) -> Walk,
    {
        for handle in self.snapshot_processes()? {
            if visitor(handle) == Walk::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Snapshot of one process's modules, reconciled with the guest
    pub fn snapshot_modules(&self, process: ProcessHandle) -> VmiResult<Vec<ModuleHandle>> {
        match reconcile_modules(&self.registry, self.backend.as_ref(), process) {
            Err(err) if err.is_not_found() => Err(VmiError::enumeration_failed(format!(
                "process {} is stale",
                process
            ))),
            Err(err) => {
                warn!("module walk of process {} failed: {}", process, err);
                Err(err)
            }
            ok => ok,
        }
    }

    /// Presents each loaded module of `process` to `visitor`
    pub fn list_modules<F>(&self, process: ProcessHandle, mut visitor: F) -> VmiResult<()>
    where
        F: FnMut(ModuleHandle) -> Walk,
    {
        for module in self.snapshot_modules(process)? {
            if visitor(module) == Walk::Stop {
                break;
            }
        }
        Ok(())
    }

    pub fn module_name(&self, process: ProcessHandle, module: ModuleHandle) -> VmiResult<String> {
        self.with_module(process, module, |desc| desc.name.clone())
    }

    pub fn module_span(
        &self,
        process: ProcessHandle,
        module: ModuleHandle,
    ) -> VmiResult<MemorySpan> {
        self.with_module(process, module, |desc| desc.span)
    }

    /// The module of `process` whose span contains `address`
    pub fn find_module_by_address(
        &self,
        process: ProcessHandle,
        address: GuestAddress,
    ) -> VmiResult<ModuleHandle> {
        self.refresh_modules(process)?;
        self.registry.read().find_module_by_address(process, address)
    }

    pub fn find_module_by_name(&self, process: ProcessHandle, name: &str) -> VmiResult<ModuleHandle> {
        self.refresh_modules(process)?;
        self.registry.read().find_module_by_name(process, name)
    }

    fn refresh_modules(&self, process: ProcessHandle) -> VmiResult<()> {
        match self.snapshot_modules(process) {
            Ok(_) => Ok(()),
            Err(VmiError::EnumerationFailed(_)) if !self.registry.read().contains(process) => {
                Err(VmiError::process_not_found(process))
            }
            Err(err) => Err(err),
        }
    }

    fn with_module<T>(
        &self,
        process: ProcessHandle,
        module: ModuleHandle,
        read: impl FnOnce(&crate::core::types::ModuleDescriptor) -> T,
    ) -> VmiResult<T> {
        if module.process() != process {
            return Err(VmiError::module_not_found(module));
        }
        let registry = self.registry.read();
        registry.resolve_module(module).map(read)
    }
}
