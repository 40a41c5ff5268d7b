//! Handle registry mapping opaque handles to guest descriptors
//!
//! Process handles come from a single counter that never goes backwards, so a
//! handle that stopped resolving can never alias a later process. Module
//! handles embed their owning process handle plus a per-process counter.

use crate::core::types::{
    GuestAddress, GuestModuleId, GuestProcessId, MemorySpan, ModuleDescriptor, ModuleHandle,
    ProcessDescriptor, ProcessFlags, ProcessHandle, VmiError, VmiResult,
};
use crate::guest::GuestBackend;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug)]
struct ModuleEntry {
    guest_id: GuestModuleId,
    descriptor: ModuleDescriptor,
}

#[derive(Debug)]
struct ProcessEntry {
    guest_id: GuestProcessId,
    descriptor: ProcessDescriptor,
    modules: HashMap<u64, ModuleEntry>,
    module_index: HashMap<GuestModuleId, u64>,
    next_module: u64,
}

impl ProcessEntry {
    fn new(guest_id: GuestProcessId, descriptor: ProcessDescriptor) -> Self {
        ProcessEntry {
            guest_id,
            descriptor,
            modules: HashMap::new(),
            module_index: HashMap::new(),
            next_module: 0,
        }
    }

    fn overlapping(&self, except: Option<u64>, descriptor: &ModuleDescriptor) -> bool {
        self.modules
            .iter()
            .filter(|(index, _)| Some(**index) != except)
            .any(|(_, entry)| entry.descriptor.span.overlaps(&descriptor.span))
    }

    fn remove_module(&mut self, guest_id: GuestModuleId) -> Option<u64> {
        let index = self.module_index.remove(&guest_id)?;
        self.modules.remove(&index);
        Some(index)
    }

    /// Tracks a module without any overlap check
    fn track_module(
        &mut self,
        process: ProcessHandle,
        guest_id: GuestModuleId,
        descriptor: ModuleDescriptor,
    ) -> ModuleHandle {
        if let Some(index) = self.module_index.get(&guest_id).copied() {
            let tracked = self.modules.get(&index).map(|module| module.descriptor.span);
            if tracked == Some(descriptor.span) {
                return ModuleHandle::new(process, index);
            }
            debug!(
                "process {}: module #{} remapped to {}",
                process, index, descriptor.span
            );
            self.remove_module(guest_id);
        }

        let index = self.next_module;
        self.next_module += 1;
        debug!(
            "process {}: module {} at {} tracked as #{}",
            process, descriptor.name, descriptor.span, index
        );
        self.module_index.insert(guest_id, index);
        self.modules
            .insert(index, ModuleEntry { guest_id, descriptor });
        ModuleHandle::new(process, index)
    }

    fn sorted_modules(&self, process: ProcessHandle) -> Vec<ModuleHandle> {
        let mut indices: Vec<u64> = self.modules.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|index| ModuleHandle::new(process, index))
            .collect()
    }
}

/// Registry of live guest processes and their modules
#[derive(Debug)]
pub struct HandleRegistry {
    processes: HashMap<ProcessHandle, ProcessEntry>,
    by_guest: HashMap<GuestProcessId, ProcessHandle>,
    next_handle: u64,
    case_insensitive_names: bool,
}

impl HandleRegistry {
    pub fn new(case_insensitive_names: bool) -> Self {
        HandleRegistry {
            processes: HashMap::new(),
            by_guest: HashMap::new(),
            next_handle: 1,
            case_insensitive_names,
        }
    }

    /// Number of live processes tracked
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Resolves a process handle to its descriptor
    pub fn resolve(&self, handle: ProcessHandle) -> VmiResult<&ProcessDescriptor> {
        self.processes
            .get(&handle)
            .map(|entry| &entry.descriptor)
            .ok_or_else(|| VmiError::process_not_found(handle))
    }

    /// Resolves a module handle to its descriptor
    pub fn resolve_module(&self, handle: ModuleHandle) -> VmiResult<&ModuleDescriptor> {
        self.processes
            .get(&handle.process())
            .and_then(|entry| entry.modules.get(&handle.index()))
            .map(|module| &module.descriptor)
            .ok_or_else(|| VmiError::module_not_found(handle))
    }

    pub fn contains(&self, handle: ProcessHandle) -> bool {
        self.processes.contains_key(&handle)
    }

    pub fn guest_id(&self, handle: ProcessHandle) -> VmiResult<GuestProcessId> {
        self.processes
            .get(&handle)
            .map(|entry| entry.guest_id)
            .ok_or_else(|| VmiError::process_not_found(handle))
    }

    pub fn handle_for(&self, guest_id: GuestProcessId) -> Option<ProcessHandle> {
        self.by_guest.get(&guest_id).copied()
    }

    /// Parent handle, if the parent process is itself tracked
    pub fn parent(&self, handle: ProcessHandle) -> VmiResult<ProcessHandle> {
        let descriptor = self.resolve(handle)?;
        descriptor
            .parent
            .and_then(|parent| self.handle_for(parent))
            .ok_or_else(|| VmiError::NotFound(format!("parent of process {}", handle)))
    }

    /// Checks a live process against a name and bitness
    pub fn process_matches(&self, handle: ProcessHandle, name: &str, flags: ProcessFlags) -> bool {
        self.resolve(handle)
            .map(|desc| desc.flags == flags && desc.name_matches(name, self.case_insensitive_names))
            .unwrap_or(false)
    }

    /// Records a newly created process and returns its handle
    ///
    /// A process already tracked under this guest identifier with the same
    /// pid, name and bitness was picked up by a walk ahead of its creation
    /// trap and keeps its handle. A different descriptor means the identifier
    /// was reused without an observed exit; the old handle is invalidated and
    /// a fresh one issued.
    pub fn process_created(
        &mut self,
        guest_id: GuestProcessId,
        descriptor: ProcessDescriptor,
    ) -> ProcessHandle {
        if let Some(tracked) = self.by_guest.get(&guest_id).copied() {
            let same = self
                .processes
                .get(&tracked)
                .map_or(false, |entry| entry.descriptor.same_process(&descriptor));
            if same {
                return tracked;
            }
            debug!(
                "guest id {} reused, invalidating process {}",
                guest_id, tracked
            );
            self.invalidate(tracked);
        }
        self.insert(guest_id, descriptor)
    }

    /// Returns the existing handle for a guest process, or tracks it
    pub fn ensure_process(
        &mut self,
        guest_id: GuestProcessId,
        descriptor: ProcessDescriptor,
    ) -> ProcessHandle {
        match self.by_guest.get(&guest_id) {
            Some(handle) => *handle,
            None => self.insert(guest_id, descriptor),
        }
    }

    fn insert(&mut self, guest_id: GuestProcessId, descriptor: ProcessDescriptor) -> ProcessHandle {
        let handle = ProcessHandle::new(self.next_handle);
        self.next_handle += 1;
        debug!("tracking {} as process {}", descriptor, handle);
        self.processes
            .insert(handle, ProcessEntry::new(guest_id, descriptor));
        self.by_guest.insert(guest_id, handle);
        handle
    }

    /// Handles a process exit notification
    pub fn process_exited(&mut self, guest_id: GuestProcessId) -> Option<ProcessHandle> {
        let handle = self.by_guest.get(&guest_id).copied()?;
        self.invalidate(handle);
        Some(handle)
    }

    /// Permanently invalidates a process handle and all of its module handles
    pub fn invalidate(&mut self, handle: ProcessHandle) -> bool {
        match self.processes.remove(&handle) {
            Some(entry) => {
                if self.by_guest.get(&entry.guest_id) == Some(&handle) {
                    self.by_guest.remove(&entry.guest_id);
                }
                debug!("process {} ({}) invalidated", handle, entry.descriptor.name);
                true
            }
            None => false,
        }
    }

    /// Guest identifiers among `live` that have no handle yet
    pub fn untracked(&self, live: &[GuestProcessId]) -> Vec<GuestProcessId> {
        live.iter()
            .copied()
            .filter(|guest_id| !self.by_guest.contains_key(guest_id))
            .collect()
    }

    /// Reconciles the registry with a fresh process walk and returns a sorted snapshot
    ///
    /// `described` carries descriptors for previously untracked processes.
    /// Tracked processes missing from `live` have exited.
    pub fn sync_processes(
        &mut self,
        live: &[GuestProcessId],
        described: Vec<(GuestProcessId, ProcessDescriptor)>,
    ) -> Vec<ProcessHandle> {
        let live_set: HashSet<GuestProcessId> = live.iter().copied().collect();
        let gone: Vec<ProcessHandle> = self
            .by_guest
            .iter()
            .filter(|(guest_id, _)| !live_set.contains(*guest_id))
            .map(|(_, handle)| *handle)
            .collect();
        for handle in gone {
            self.invalidate(handle);
        }

        for (guest_id, descriptor) in described {
            if live_set.contains(&guest_id) {
                self.ensure_process(guest_id, descriptor);
            }
        }

        self.processes()
    }

    /// Sorted snapshot of every live process handle
    pub fn processes(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.processes.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// First live process matching name and flags, in handle order
    pub fn find_process(&self, name: &str, flags: ProcessFlags) -> Option<ProcessHandle> {
        self.processes()
            .into_iter()
            .find(|handle| self.process_matches(*handle, name, flags))
    }

    /// Records a module load and returns its handle
    ///
    /// A module already tracked with the same span keeps its handle; a span
    /// change means a new mapping and yields a new handle.
    pub fn module_loaded(
        &mut self,
        process: ProcessHandle,
        guest_id: GuestModuleId,
        descriptor: ModuleDescriptor,
    ) -> VmiResult<ModuleHandle> {
        let entry = self
            .processes
            .get_mut(&process)
            .ok_or_else(|| VmiError::process_not_found(process))?;

        let existing = entry.module_index.get(&guest_id).copied();
        if entry.overlapping(existing, &descriptor) {
            return Err(VmiError::OverlappingModule {
                process,
                span: descriptor.span,
            });
        }

        Ok(entry.track_module(process, guest_id, descriptor))
    }

    /// Forgets an unloaded module
    pub fn module_unloaded(&mut self, process: ProcessHandle, guest_id: GuestModuleId) -> bool {
        self.processes
            .get_mut(&process)
            .and_then(|entry| entry.remove_module(guest_id))
            .is_some()
    }

    /// Reconciles one process's modules with a fresh module walk
    ///
    /// `described` holds the current descriptor of each live module the guest
    /// could describe; live modules missing from it keep their tracked span.
    /// A tracked module described at a new span gets a new handle. If any two
    /// spans of the resulting set overlap, the walk fails with
    /// `EnumerationFailed` and the registry is left as it was.
    pub fn sync_modules(
        &mut self,
        process: ProcessHandle,
        live: &[GuestModuleId],
        described: Vec<(GuestModuleId, ModuleDescriptor)>,
    ) -> VmiResult<Vec<ModuleHandle>> {
        let entry = self
            .processes
            .get_mut(&process)
            .ok_or_else(|| VmiError::process_not_found(process))?;

        let live_set: HashSet<GuestModuleId> = live.iter().copied().collect();
        let described: Vec<(GuestModuleId, ModuleDescriptor)> = described
            .into_iter()
            .filter(|(guest_id, _)| live_set.contains(guest_id))
            .collect();
        let fresh: HashSet<GuestModuleId> = described.iter().map(|(id, _)| *id).collect();

        let mut spans: Vec<MemorySpan> = entry
            .module_index
            .iter()
            .filter(|(guest_id, _)| live_set.contains(*guest_id) && !fresh.contains(*guest_id))
            .filter_map(|(_, index)| entry.modules.get(index))
            .map(|module| module.descriptor.span)
            .collect();
        spans.extend(described.iter().map(|(_, descriptor)| descriptor.span));
        if let Some(span) = first_overlap(&spans) {
            return Err(VmiError::enumeration_failed(format!(
                "module span {} of process {} overlaps another module",
                span, process
            )));
        }

        let gone: Vec<GuestModuleId> = entry
            .module_index
            .keys()
            .filter(|module| !live_set.contains(*module))
            .copied()
            .collect();
        for module in gone {
            entry.remove_module(module);
        }
        for (guest_id, descriptor) in described {
            entry.track_module(process, guest_id, descriptor);
        }

        Ok(entry.sorted_modules(process))
    }

    /// Sorted snapshot of a process's module handles
    pub fn modules(&self, process: ProcessHandle) -> VmiResult<Vec<ModuleHandle>> {
        self.processes
            .get(&process)
            .map(|entry| entry.sorted_modules(process))
            .ok_or_else(|| VmiError::process_not_found(process))
    }

    /// The module whose span contains `address`
    pub fn find_module_by_address(
        &self,
        process: ProcessHandle,
        address: GuestAddress,
    ) -> VmiResult<ModuleHandle> {
        let entry = self
            .processes
            .get(&process)
            .ok_or_else(|| VmiError::process_not_found(process))?;
        entry
            .modules
            .iter()
            .find(|(_, module)| module.descriptor.span.contains(address))
            .map(|(index, _)| ModuleHandle::new(process, *index))
            .ok_or_else(|| {
                VmiError::NotFound(format!("no module of process {} maps {}", process, address))
            })
    }

    /// The first module (in load order) with a matching name
    pub fn find_module_by_name(&self, process: ProcessHandle, name: &str) -> VmiResult<ModuleHandle> {
        let entry = self
            .processes
            .get(&process)
            .ok_or_else(|| VmiError::process_not_found(process))?;
        entry
            .sorted_modules(process)
            .into_iter()
            .find(|module| {
                let module_name = &entry.modules[&module.index()].descriptor.name;
                if self.case_insensitive_names {
                    module_name.eq_ignore_ascii_case(name)
                } else {
                    module_name == name
                }
            })
            .ok_or_else(|| VmiError::NotFound(format!("module {} in process {}", name, process)))
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

fn first_overlap(spans: &[MemorySpan]) -> Option<MemorySpan> {
    spans.iter().enumerate().find_map(|(i, span)| {
        spans[i + 1..]
            .iter()
            .any(|other| span.overlaps(other))
            .then_some(*span)
    })
}

/// Handle for a guest process, describing and tracking it if needed
///
/// The backend is queried without holding the registry lock.
pub(crate) fn track_process(
    registry: &RwLock<HandleRegistry>,
    backend: &dyn GuestBackend,
    guest_id: GuestProcessId,
) -> VmiResult<ProcessHandle> {
    if let Some(handle) = registry.read().handle_for(guest_id) {
        return Ok(handle);
    }
    let descriptor = backend
        .describe_process(guest_id)
        .ok_or_else(|| VmiError::NotFound(format!("guest process {}", guest_id)))?;
    Ok(registry.write().ensure_process(guest_id, descriptor))
}

/// Reconciles a process's modules with the guest's current module list
///
/// Every live module is described without holding the registry lock.
pub(crate) fn reconcile_modules(
    registry: &RwLock<HandleRegistry>,
    backend: &dyn GuestBackend,
    process: ProcessHandle,
) -> VmiResult<Vec<ModuleHandle>> {
    let guest_id = registry.read().guest_id(process)?;
    let live = backend.loaded_modules(guest_id).map_err(|e| {
        VmiError::enumeration_failed(format!("module walk of process {}: {}", process, e))
    })?;
    let described: Vec<_> = live
        .iter()
        .filter_map(|module| {
            backend
                .describe_module(guest_id, *module)
                .map(|descriptor| (*module, descriptor))
        })
        .collect();
    registry.write().sync_modules(process, &live, described)
}
